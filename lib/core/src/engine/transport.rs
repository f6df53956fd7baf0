// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport variant selection.
//!
//! Payload moves over one of five variants, chosen once per session. Push
//! variants address the reader's exposed receive buffer; pull variants read
//! from the writer's exposed payload buffer.
//!
//! | mode              | writer at EndStep        | writer wait | reader           |
//! |-------------------|--------------------------|-------------|------------------|
//! | twosided          | isend per target         | wait-all    | irecv per source |
//! | onesidedfencepush | fence + put per target   | fence       | fence + fence    |
//! | onesidedpostpush  | start + put per target   | complete    | post + wait      |
//! | onesidedfencepull | fence                    | fence       | fence + get + fence |
//! | onesidedpostpull  | post                     | wait        | start + get + complete |

use std::str::FromStr;

use crate::SscError;

/// Point-to-point tag the step engines move payload on.
pub(crate) const DATA_TAG: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiMode {
    TwoSided,
    OneSidedFencePush,
    OneSidedPostPush,
    OneSidedFencePull,
    OneSidedPostPull,
}

impl MpiMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MpiMode::TwoSided => "twosided",
            MpiMode::OneSidedFencePush => "onesidedfencepush",
            MpiMode::OneSidedPostPush => "onesidedpostpush",
            MpiMode::OneSidedFencePull => "onesidedfencepull",
            MpiMode::OneSidedPostPull => "onesidedpostpull",
        }
    }

    pub fn is_one_sided(self) -> bool {
        !matches!(self, MpiMode::TwoSided)
    }

    /// Whether the writer initiates data movement into the reader's buffer.
    pub fn is_push(self) -> bool {
        matches!(self, MpiMode::OneSidedFencePush | MpiMode::OneSidedPostPush)
    }
}

impl std::fmt::Display for MpiMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MpiMode {
    type Err = SscError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "twosided" => Ok(MpiMode::TwoSided),
            "onesidedfencepush" => Ok(MpiMode::OneSidedFencePush),
            "onesidedpostpush" => Ok(MpiMode::OneSidedPostPush),
            "onesidedfencepull" => Ok(MpiMode::OneSidedFencePull),
            "onesidedpostpull" => Ok(MpiMode::OneSidedPostPull),
            other => Err(SscError::Configuration(format!(
                "unknown MpiMode {other:?}"
            ))),
        }
    }
}

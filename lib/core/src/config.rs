// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Built directly through the builder or parsed from the host framework's
//! string parameter map with case-insensitive keys: `MpiMode`, `Verbose`,
//! `Threading`, `OpenTimeoutSecs`, `Chunksize`, `LockDefinitions`,
//! `LockSelections`.

use std::collections::HashMap;

use derive_builder::Builder;

use crate::engine::MpiMode;
use crate::{Result, SscError};

#[derive(Builder, Clone, Debug)]
pub struct EngineConfig {
    /// Transport variant; static per session, all ranks must agree.
    #[builder(default = "MpiMode::TwoSided")]
    pub mpi_mode: MpiMode,

    /// Diagnostic print level, 0..20.
    #[builder(default = "0")]
    pub verbose: u32,

    /// Run pattern synchronization on a background worker.
    #[builder(default = "true")]
    pub threading: bool,

    /// Handshake timeout in seconds.
    #[builder(default = "10")]
    pub open_timeout_secs: u64,

    /// Chunk bound for the large-count gather, in bytes.
    #[builder(default = "1 << 30")]
    pub chunksize: usize,

    /// Writer promise: variable definitions will not change step-to-step.
    #[builder(default = "false")]
    pub lock_definitions: bool,

    /// Reader promise: read selections will not change step-to-step.
    #[builder(default = "false")]
    pub lock_selections: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::default()
            .build()
            .expect("every field has a default")
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse the string parameter map. Unknown keys are ignored (other
    /// layers share the same map); invalid values are configuration errors.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "mpimode" => config.mpi_mode = value.parse()?,
                "verbose" => {
                    config.verbose = value.parse().map_err(|_| {
                        SscError::Configuration(format!("Verbose must be an integer, got {value}"))
                    })?;
                }
                "threading" => config.threading = parse_bool("Threading", value)?,
                "opentimeoutsecs" => {
                    config.open_timeout_secs = value.parse().map_err(|_| {
                        SscError::Configuration(format!(
                            "OpenTimeoutSecs must be an integer, got {value}"
                        ))
                    })?;
                }
                "chunksize" => {
                    config.chunksize = value.parse().map_err(|_| {
                        SscError::Configuration(format!(
                            "Chunksize must be an integer, got {value}"
                        ))
                    })?;
                    if config.chunksize == 0 {
                        return Err(SscError::Configuration(
                            "Chunksize must be positive".to_string(),
                        ));
                    }
                }
                "lockdefinitions" => config.lock_definitions = parse_bool("LockDefinitions", value)?,
                "lockselections" => config.lock_selections = parse_bool("LockSelections", value)?,
                other => {
                    tracing::debug!(key = other, "ignoring unknown engine parameter");
                }
            }
        }
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(SscError::Configuration(format!(
            "{key} must be a boolean, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.mpi_mode, MpiMode::TwoSided);
        assert_eq!(config.verbose, 0);
        assert!(config.threading);
        assert!(!config.lock_definitions);
    }

    #[test]
    fn test_from_params_round_trip() {
        let config = EngineConfig::from_params(&params(&[
            ("MpiMode", "onesidedpostpull"),
            ("Verbose", "5"),
            ("Threading", "false"),
            ("OpenTimeoutSecs", "30"),
            ("Chunksize", "4096"),
            ("LockDefinitions", "true"),
            ("LockSelections", "1"),
        ]))
        .unwrap();
        assert_eq!(config.mpi_mode, MpiMode::OneSidedPostPull);
        assert_eq!(config.verbose, 5);
        assert!(!config.threading);
        assert_eq!(config.open_timeout_secs, 30);
        assert_eq!(config.chunksize, 4096);
        assert!(config.lock_definitions);
        assert!(config.lock_selections);
    }

    #[test]
    fn test_keys_are_case_insensitive_and_unknown_ignored() {
        let config = EngineConfig::from_params(&params(&[
            ("mpimode", "onesidedfencepush"),
            ("SomeOtherEngineKnob", "whatever"),
        ]))
        .unwrap();
        assert_eq!(config.mpi_mode, MpiMode::OneSidedFencePush);
    }

    #[test]
    fn test_invalid_mode_is_configuration_error() {
        let err = EngineConfig::from_params(&params(&[("MpiMode", "quantum")])).unwrap_err();
        assert!(matches!(err, SscError::Configuration(_)));
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let err = EngineConfig::from_params(&params(&[("Threading", "maybe")])).unwrap_err();
        assert!(matches!(err, SscError::Configuration(_)));
    }
}

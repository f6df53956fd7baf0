// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # SSC Core
//!
//! The core of the Sustainable Staging Coupler: an in-situ coupling engine
//! that streams multi-dimensional array data from parallel writers to
//! parallel readers over a message-passing fabric.
//!
//! Each side declares its variables and access regions per step; the
//! metadata protocol ([`codec`]) serializes those declarations into a
//! compact binary pattern, the [`aggregate`] layer assembles and broadcasts
//! them across the stream, the [`overlap`] resolver computes which writer
//! must send what to which reader, and the step [`engine`]s drive the
//! per-step handshake and payload transfer over one of five two-sided/RMA
//! transport variants.
//!
//! The message-passing fabric itself is the [`ssc_fabric`] collaborator;
//! the engines only see its `Comm`/`Window` traits.

pub mod aggregate;
pub mod block;
pub mod codec;
pub mod config;
pub mod engine;
pub mod io;
pub mod overlap;

pub use block::{Block, BlockVec, BlockVecVec, DataType, Dims, Element, RankPosMap, ShapeId};
pub use config::EngineConfig;
pub use engine::{MpiMode, SscReader, SscWriter, StepStatus};
pub use io::{Attribute, AttributeValue, Io, VariableDef};

use ssc_fabric::FabricError;

/// Errors surfaced by the coupler core. All of them are fatal for the step
/// that raised them; nothing is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum SscError {
    #[error("unknown type tag {0}")]
    UnknownType(u8),

    #[error("unknown shape tag {0}")]
    UnknownShape(u8),

    #[error("malformed pattern buffer: cursor {cursor} overruns valid length {valid}")]
    MalformedBuffer { cursor: usize, valid: usize },

    #[error("{what} of {len} bytes exceeds the 255-byte wire limit")]
    FieldTooLong { what: &'static str, len: usize },

    #[error("block {name}: shape/start/count lengths disagree")]
    DimsMismatch { name: String },

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("variable {name} redeclared with a different {what} while locked")]
    LockedPatternMismatch { name: String, what: &'static str },

    #[error("variable {0} is not defined")]
    UnknownVariable(String),

    #[error("variable {name}: declared {declared:?}, requested {requested:?}")]
    TypeMismatch {
        name: String,
        declared: DataType,
        requested: DataType,
    },

    #[error("data of {got} elements does not match the declared count of {expected}")]
    CountMismatch { expected: usize, got: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("engine state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// Crate-wide result alias.
pub type Result<T, E = SscError> = std::result::Result<T, E>;

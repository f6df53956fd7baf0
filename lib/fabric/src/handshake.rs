// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream establishment.
//!
//! Writers and readers start as one combined world; `handshake` sorts the
//! ranks into sides and yields the communicator set the step engines run
//! on: the stream communicator (the whole world), the caller's side
//! communicator, both side groups as stream-rank lists, and each side's
//! master stream rank.

use std::sync::Arc;

use crate::{Comm, FabricError, Group};

/// Which side of the stream this rank joins as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

impl Role {
    fn token(self) -> u8 {
        match self {
            Role::Writer => b'w',
            Role::Reader => b'r',
        }
    }
}

/// The communicator set one rank operates on for the lifetime of a stream.
#[derive(Clone, derive_getters::Getters)]
pub struct StreamContext {
    /// The combined writer+reader communicator.
    stream: Arc<dyn Comm>,
    /// This rank's side communicator (writers only, or readers only).
    side: Arc<dyn Comm>,
    /// Stream ranks of all writers.
    writer_group: Group,
    /// Stream ranks of all readers.
    reader_group: Group,
    /// Stream rank of writer-side rank 0.
    writer_master_stream_rank: usize,
    /// Stream rank of reader-side rank 0.
    reader_master_stream_rank: usize,
    role: Role,
}

impl StreamContext {
    pub fn is_writer(&self) -> bool {
        matches!(self.role, Role::Writer)
    }

    /// The opposite side's stream-rank group.
    pub fn peer_group(&self) -> &Group {
        match self.role {
            Role::Writer => &self.reader_group,
            Role::Reader => &self.writer_group,
        }
    }
}

/// Join a stream. Collective over `world`; every rank passes its role.
///
/// `open_timeout_secs` bounds how long a connecting backend may wait for the
/// peer side to appear; the in-process backend has both sides present by
/// construction.
pub fn handshake(
    world: Arc<dyn Comm>,
    role: Role,
    open_timeout_secs: u64,
) -> Result<StreamContext, FabricError> {
    tracing::debug!(
        rank = world.rank(),
        ?role,
        open_timeout_secs,
        "joining stream"
    );

    let tokens = world.allgather_u8(role.token())?;
    let writer_ranks: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, &t)| t == b'w')
        .map(|(r, _)| r)
        .collect();
    let reader_ranks: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, &t)| t == b'r')
        .map(|(r, _)| r)
        .collect();
    if writer_ranks.is_empty() || reader_ranks.is_empty() {
        return Err(FabricError::Handshake(format!(
            "stream needs both sides: {} writers, {} readers",
            writer_ranks.len(),
            reader_ranks.len()
        )));
    }

    let side = world.split(role.token() as u32)?;

    let master_contribution = |is_my_side: bool| -> i64 {
        if is_my_side && side.rank() == 0 {
            world.rank() as i64
        } else {
            -1
        }
    };
    let writer_master =
        world.allreduce_max_i64(master_contribution(matches!(role, Role::Writer)))?;
    let reader_master =
        world.allreduce_max_i64(master_contribution(matches!(role, Role::Reader)))?;
    debug_assert!(writer_master >= 0 && reader_master >= 0);

    Ok(StreamContext {
        stream: world,
        side,
        writer_group: Group::new(writer_ranks),
        reader_group: Group::new(reader_ranks),
        writer_master_stream_rank: writer_master as usize,
        reader_master_stream_rank: reader_master as usize,
        role,
    })
}

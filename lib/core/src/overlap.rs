// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Overlap resolver: given both sides' declared block patterns, name each
//! peer rank whose region intersects the local one and assign byte
//! positions within the receive buffers.
//!
//! Two GlobalArray blocks with the same name intersect iff every dimension's
//! intervals overlap; a single disjoint dimension excludes the pair.
//! GlobalValue blocks overlap on name match alone. LocalValue and LocalArray
//! carry no intersection semantics for cross-rank routing.

use crate::block::{total_data_size, BlockVec, BlockVecVec, RankPosMap, ShapeId};
use crate::{Result, SscError};

fn arrays_intersect(a_start: &[u64], a_count: &[u64], b_start: &[u64], b_count: &[u64]) -> bool {
    if a_start.len() != b_start.len() {
        return false;
    }
    a_start
        .iter()
        .zip(a_count)
        .zip(b_start.iter().zip(b_count))
        .all(|((&as_, &ac), (&bs, &bc))| as_ + ac > bs && bs + bc > as_)
}

/// Peer ranks in `global` sharing at least one variable whose declared
/// region intersects a block in `local`. Offsets and lengths are zeroed;
/// position assignment fills them in.
pub fn calculate_overlap(global: &BlockVecVec, local: &BlockVec) -> RankPosMap {
    let mut overlap = RankPosMap::new();
    for (rank, blocks) in global.iter().enumerate() {
        for g in blocks {
            for l in local {
                if l.name != g.name {
                    continue;
                }
                match g.shape_id {
                    ShapeId::GlobalValue => {
                        overlap.insert(rank, (0, 0));
                    }
                    ShapeId::GlobalArray => {
                        if arrays_intersect(&g.start, &g.count, &l.start, &l.count) {
                            overlap.insert(rank, (0, 0));
                        }
                    }
                    ShapeId::LocalValue | ShapeId::LocalArray => {}
                }
            }
        }
    }
    overlap
}

/// Writer-side position assignment. For every overlapping reader rank,
/// recompute that reader's overlap against the full writer pattern, walk
/// writer ranks ascending assigning prefix-sum offsets of
/// `TotalDataSize + 1` (the trailing byte is the per-contribution final-step
/// marker slot), and keep this writer's own entry.
pub fn calculate_position(
    writer_pattern: &BlockVecVec,
    reader_pattern: &BlockVecVec,
    writer_rank: usize,
    overlap: &mut RankPosMap,
) -> Result<()> {
    let readers: Vec<usize> = overlap.keys().copied().collect();
    for reader in readers {
        let reader_blocks = &reader_pattern[reader];
        let reader_overlap = calculate_overlap(writer_pattern, reader_blocks);
        let mut position = 0u64;
        let mut own = None;
        for (rank, blocks) in writer_pattern.iter().enumerate() {
            if !reader_overlap.contains_key(&rank) {
                continue;
            }
            let contribution = total_data_size(blocks)? + 1;
            if rank == writer_rank {
                own = Some((position, contribution));
            }
            position += contribution;
        }
        let own = own.ok_or(SscError::InvalidState(
            "overlapping reader does not cover this writer",
        ))?;
        overlap.insert(reader, own);
    }
    Ok(())
}

/// Reader-side projection of the same table: offsets of every overlapping
/// writer's contribution within this reader's receive buffer, plus the
/// total buffer size.
pub fn reader_positions(
    writer_pattern: &BlockVecVec,
    local_reads: &BlockVec,
) -> Result<(RankPosMap, u64)> {
    let overlap = calculate_overlap(writer_pattern, local_reads);
    let mut positions = RankPosMap::new();
    let mut total = 0u64;
    for &rank in overlap.keys() {
        let contribution = total_data_size(&writer_pattern[rank])? + 1;
        positions.insert(rank, (total, contribution));
        total += contribution;
    }
    Ok((positions, total))
}

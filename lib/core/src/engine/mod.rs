// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Step engines.
//!
//! A stream runs in steps: writers declare and fill their payload between
//! `begin_step` and `end_step`, readers consume between theirs. Step 0
//! exchanges both sides' patterns; if both sides locked their declarations,
//! later steps reuse the resolved routing and a persistent window (fixed
//! mode), otherwise the pattern is re-published every step (flexible mode).

pub mod transport;

mod reader;
mod writer;

pub use reader::SscReader;
pub use transport::MpiMode;
pub use writer::SscWriter;

use ssc_fabric::StreamContext;

use crate::aggregate::broadcast_metadata;
use crate::block::BlockVecVec;
use crate::codec::deserialize;
use crate::io::Io;
use crate::{Result, SscError};

/// Outcome of `begin_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    /// The peer side closed the stream; no further steps will arrive.
    EndOfStream,
}

/// A pattern broadcast received from the peer side's master.
pub(crate) struct PatternBroadcast {
    pub final_step: bool,
    pub locked: bool,
    pub pattern: BlockVecVec,
}

/// Receive a framed pattern broadcast on the stream communicator and decode
/// it. With `register`, unknown variables and attributes are defined in the
/// host database.
pub(crate) fn receive_pattern(
    ctx: &StreamContext,
    io: &Io,
    root: usize,
    register: bool,
) -> Result<PatternBroadcast> {
    let mut buffer = Vec::new();
    broadcast_metadata(ctx.stream().as_ref(), &mut buffer, root)?;
    if buffer.len() < 10 {
        return Err(SscError::MalformedBuffer {
            cursor: 10,
            valid: buffer.len(),
        });
    }
    let final_step = buffer[0] != 0;
    let locked = buffer[1] != 0;
    let mut pattern = vec![Vec::new(); ctx.stream().size()];
    deserialize(&buffer, &mut pattern, io, register, register)?;
    Ok(PatternBroadcast {
        final_step,
        locked,
        pattern,
    })
}

pub(crate) fn dims_product(dims: &[u64]) -> u64 {
    dims.iter().product()
}

/// Copy the intersection of a source hyperslab into a destination one.
///
/// Both sides are dense row-major regions: `src` covers `src_count` at
/// global offset `src_start`, `dst` covers `dst_count` at `dst_start`.
/// Innermost-dimension runs are copied contiguously. A scalar (`ndims == 0`)
/// copies one element.
pub(crate) fn copy_block_overlap(
    src: &[u8],
    src_start: &[u64],
    src_count: &[u64],
    dst: &mut [u8],
    dst_start: &[u64],
    dst_count: &[u64],
    elem: usize,
) -> Result<()> {
    let ndims = src_start.len();
    if dst_start.len() != ndims || src_count.len() != ndims || dst_count.len() != ndims {
        return Err(SscError::DimsMismatch {
            name: "<overlap copy>".to_string(),
        });
    }
    if src.len() < dims_product(src_count) as usize * elem
        || dst.len() < dims_product(dst_count) as usize * elem
    {
        return Err(SscError::CountMismatch {
            expected: dims_product(src_count) as usize * elem,
            got: src.len(),
        });
    }

    if ndims == 0 {
        dst[..elem].copy_from_slice(&src[..elem]);
        return Ok(());
    }

    let mut inter_start = vec![0u64; ndims];
    let mut inter_count = vec![0u64; ndims];
    for d in 0..ndims {
        let lo = src_start[d].max(dst_start[d]);
        let hi = (src_start[d] + src_count[d]).min(dst_start[d] + dst_count[d]);
        if hi <= lo {
            return Ok(());
        }
        inter_start[d] = lo;
        inter_count[d] = hi - lo;
    }

    let mut src_stride = vec![1u64; ndims];
    let mut dst_stride = vec![1u64; ndims];
    for d in (0..ndims.saturating_sub(1)).rev() {
        src_stride[d] = src_stride[d + 1] * src_count[d + 1];
        dst_stride[d] = dst_stride[d + 1] * dst_count[d + 1];
    }

    let run = inter_count[ndims - 1] as usize * elem;
    let rows = dims_product(&inter_count[..ndims - 1]);
    let mut index = vec![0u64; ndims.saturating_sub(1)];
    for _ in 0..rows {
        let mut src_off = (inter_start[ndims - 1] - src_start[ndims - 1]) * src_stride[ndims - 1];
        let mut dst_off = (inter_start[ndims - 1] - dst_start[ndims - 1]) * dst_stride[ndims - 1];
        for d in 0..ndims - 1 {
            let global = inter_start[d] + index[d];
            src_off += (global - src_start[d]) * src_stride[d];
            dst_off += (global - dst_start[d]) * dst_stride[d];
        }
        let s = src_off as usize * elem;
        let t = dst_off as usize * elem;
        dst[t..t + run].copy_from_slice(&src[s..s + run]);

        for d in (0..ndims - 1).rev() {
            index[d] += 1;
            if index[d] < inter_count[d] {
                break;
            }
            index[d] = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_scalar() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        copy_block_overlap(&src, &[], &[], &mut dst, &[], &[], 4).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_1d_partial_overlap() {
        // Source covers [0, 8), destination requests [4, 12); overlap [4, 8).
        let src: Vec<u8> = (0..8).collect();
        let mut dst = vec![0xffu8; 8];
        copy_block_overlap(&src, &[0], &[8], &mut dst, &[4], &[8], 1).unwrap();
        assert_eq!(dst, vec![4, 5, 6, 7, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_copy_2d_interior_block() {
        // Source: 4x4 region at (0,0); destination: 2x2 region at (1,1).
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 4];
        copy_block_overlap(&src, &[0, 0], &[4, 4], &mut dst, &[1, 1], &[2, 2], 1).unwrap();
        assert_eq!(dst, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_copy_disjoint_is_noop() {
        let src = [7u8; 4];
        let mut dst = [0u8; 4];
        copy_block_overlap(&src, &[0], &[4], &mut dst, &[4], &[4], 1).unwrap();
        assert_eq!(dst, [0u8; 4]);
    }

    #[test]
    fn test_copy_multibyte_elements() {
        let src_vals = [10i32, 11, 12, 13];
        let src = crate::block::elements_to_bytes(&src_vals);
        let mut dst = vec![0u8; 8];
        copy_block_overlap(&src, &[2], &[4], &mut dst, &[3], &[2], 4).unwrap();
        let dst_vals: Vec<i32> = crate::block::bytes_to_elements(&dst).unwrap();
        assert_eq!(dst_vals, vec![11, 12]);
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pattern aggregation: collective assembly of every rank's serialized
//! local buffer into one global buffer on the side's root, and broadcast of
//! global buffers across the stream.

use ssc_fabric::{gatherv::gatherv64, Comm};

use crate::codec::PatternBuffer;
use crate::Result;

/// Per-rank payload sizes above this total take the chunked gather path.
const NATIVE_GATHER_LIMIT: u64 = i32::MAX as u64;

/// Gather every rank's local pattern payload to side rank 0 and frame it
/// with the final-step/locked flags and the 8-byte payload total.
///
/// Returns the framed global buffer on the root and an empty vector on
/// every other rank.
pub fn aggregate_metadata(
    comm: &dyn Comm,
    local: &PatternBuffer,
    final_step: bool,
    locked: bool,
    chunksize: usize,
) -> Result<Vec<u8>> {
    let payload = local.payload();
    let local_size = payload.len() as u64;

    let sizes = comm.gather_u64(local_size, 0)?;

    let (mut global, displs, total) = if comm.rank() == 0 {
        let total: u64 = sizes.iter().sum();
        let mut displs = vec![0u64; sizes.len()];
        for i in 1..sizes.len() {
            displs[i] = displs[i - 1] + sizes[i - 1];
        }
        (vec![0u8; total as usize + 10], displs, total)
    } else {
        (Vec::new(), Vec::new(), 0)
    };

    // Both paths are collective, so every rank must take the same branch;
    // only the root knows the total.
    let chunked = comm.bcast_u64((total > NATIVE_GATHER_LIMIT) as u64, 0)? != 0;
    let recv = if comm.rank() == 0 {
        &mut global[10..]
    } else {
        &mut []
    };
    if chunked {
        gatherv64(comm, payload, recv, &sizes, &displs, 0, chunksize)?;
    } else {
        comm.gatherv(payload, recv, &sizes, &displs, 0)?;
    }

    if comm.rank() == 0 {
        global[0] = final_step as u8;
        global[1] = locked as u8;
        global[2..10].copy_from_slice(&total.to_le_bytes());
    }
    Ok(global)
}

/// Broadcast a framed global buffer from `root` across `comm`, resizing
/// receivers to the root's length.
pub fn broadcast_metadata(comm: &dyn Comm, buffer: &mut Vec<u8>, root: usize) -> Result<()> {
    let len = comm.bcast_u64(buffer.len() as u64, root)? as usize;
    if comm.rank() != root {
        buffer.clear();
        buffer.resize(len, 0);
    }
    comm.bcast(&mut buffer[..], root)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, DataType, ShapeId};
    use crate::codec::serialize_variables;
    use ssc_fabric::local::LocalCluster;
    use std::sync::Arc;

    fn run_world<F>(size: usize, f: F)
    where
        F: Fn(Arc<dyn Comm>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalCluster::comms(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(comm))
            })
            .collect();
        for handle in handles {
            handle.join().expect("rank thread panicked");
        }
    }

    fn rank_block(rank: usize) -> Block {
        Block {
            name: format!("var{rank}"),
            shape_id: ShapeId::GlobalArray,
            dtype: DataType::Float64,
            shape: vec![64],
            start: vec![rank as u64 * 16],
            count: vec![16],
            buffer_start: 1,
            buffer_count: 128,
            value: Vec::new(),
        }
    }

    fn check_layout(comm: &dyn Comm, chunksize: usize) {
        let rank = comm.rank();
        let mut local = PatternBuffer::new();
        serialize_variables(&vec![rank_block(rank)], &mut local, rank as i32).unwrap();
        let local_payload = local.payload().to_vec();

        let global = aggregate_metadata(comm, &local, false, true, chunksize).unwrap();

        let sizes = comm.gather_u64(local_payload.len() as u64, 0).unwrap();
        if rank == 0 {
            // Aggregation law: length is 10 + sum of payloads, flags lead,
            // and each rank's payload lands at its displacement.
            let total: u64 = sizes.iter().sum();
            assert_eq!(global.len(), total as usize + 10);
            assert_eq!(global[0], 0);
            assert_eq!(global[1], 1);
            assert_eq!(
                u64::from_le_bytes(global[2..10].try_into().unwrap()),
                total
            );
            assert_eq!(
                &global[10..10 + local_payload.len()],
                local_payload.as_slice()
            );
        } else {
            assert!(global.is_empty());
        }
    }

    #[test]
    fn test_aggregation_law() {
        run_world(3, |comm| check_layout(&*comm, 1 << 20));
    }

    #[test]
    fn test_aggregation_chunked_path_matches() {
        // A tiny chunk size exercises gatherv64 through the same framing.
        run_world(3, |comm| {
            let rank = comm.rank();
            let mut local = PatternBuffer::new();
            serialize_variables(&vec![rank_block(rank)], &mut local, rank as i32).unwrap();
            let payload = local.payload().to_vec();
            let sizes = vec![payload.len() as u64; 3];
            let mut displs = vec![0u64; 3];
            for i in 1..3 {
                displs[i] = displs[i - 1] + sizes[i - 1];
            }
            let mut recv = vec![0u8; payload.len() * 3];
            gatherv64(&*comm, &payload, &mut recv, &sizes, &displs, 0, 7).unwrap();
            if rank == 0 {
                assert_eq!(&recv[..payload.len()], payload.as_slice());
            }
        });
    }

    #[test]
    fn test_broadcast_resizes_receivers() {
        run_world(3, |comm| {
            let mut buffer = if comm.rank() == 1 {
                vec![5u8; 33]
            } else {
                Vec::new()
            };
            broadcast_metadata(&*comm, &mut buffer, 1).unwrap();
            assert_eq!(buffer, vec![5u8; 33]);
        });
    }

    #[test]
    fn test_aggregate_then_deserialize_round_trip() {
        run_world(2, |comm| {
            let rank = comm.rank();
            let mut local = PatternBuffer::new();
            serialize_variables(&vec![rank_block(rank)], &mut local, rank as i32).unwrap();
            let mut global = aggregate_metadata(comm.as_ref(), &local, false, false, 1 << 20).unwrap();
            broadcast_metadata(comm.as_ref(), &mut global, 0).unwrap();

            let io = crate::io::Io::new();
            let mut pattern = vec![Vec::new(); 2];
            crate::codec::deserialize(&global, &mut pattern, &io, false, false).unwrap();
            assert_eq!(pattern[0], vec![rank_block(0)]);
            assert_eq!(pattern[1], vec![rank_block(1)]);
        });
    }
}

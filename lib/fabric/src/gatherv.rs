// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Chunked large-count gather.
//!
//! Collective byte counts are 32-bit in the native interface; once a rank's
//! metadata or payload outgrows that, the gather has to be decomposed. The
//! three variants here mirror the native gatherv shape (send buffer,
//! per-rank receive counts, displacements, root) so callers can swap them in
//! without restructuring, and each bounds its individual transfers by
//! `chunksize` bytes.
//!
//! For `gatherv64` and `gatherv64_one_sided_pull` the counts and
//! displacement slices are only read on the root; the push variant reads
//! them on every rank, since each rank targets `displs[rank]` directly.

use crate::{waitall_sends, Comm, FabricError, PendingRecv, SharedBuffer};

const TAG: u32 = 1;

/// Chunk iterator: yields `(offset, len)` pieces of a `total`-byte span.
fn chunks(total: usize, chunksize: usize) -> impl Iterator<Item = (usize, usize)> {
    let chunksize = chunksize.max(1);
    let mut done = 0;
    std::iter::from_fn(move || {
        if done >= total {
            return None;
        }
        let this = (total - done).min(chunksize);
        let piece = (done, this);
        done += this;
        Some(piece)
    })
}

/// Two-sided chunked gatherv: the root posts one non-blocking receive per
/// chunk per peer, every rank posts matching sends, and a single wait-all
/// completes the gather.
pub fn gatherv64(
    comm: &dyn Comm,
    sendbuf: &[u8],
    recvbuf: &mut [u8],
    recvcounts: &[u64],
    displs: &[u64],
    root: usize,
    chunksize: usize,
) -> Result<(), FabricError> {
    let mut recvs: Vec<(Box<dyn PendingRecv>, usize, usize)> = Vec::new();
    if comm.rank() == root {
        for peer in 0..comm.size() {
            let base = displs[peer] as usize;
            for (offset, len) in chunks(recvcounts[peer] as usize, chunksize) {
                recvs.push((comm.irecv(peer, TAG)?, base + offset, len));
            }
        }
    }

    let mut sends = Vec::new();
    for (offset, len) in chunks(sendbuf.len(), chunksize) {
        sends.push(comm.isend(root, TAG, &sendbuf[offset..offset + len])?);
    }

    for (request, offset, len) in recvs {
        let message = request.wait()?;
        if message.len() != len {
            return Err(FabricError::LengthMismatch {
                expected: len,
                got: message.len(),
            });
        }
        recvbuf[offset..offset + len].copy_from_slice(&message);
    }
    waitall_sends(sends)
}

/// One-sided pull variant: every rank exposes its send buffer as a window
/// and the root issues chunked gets; the collective free completes the
/// epoch.
pub fn gatherv64_one_sided_pull(
    comm: &dyn Comm,
    sendbuf: &[u8],
    recvbuf: &mut [u8],
    recvcounts: &[u64],
    displs: &[u64],
    root: usize,
    chunksize: usize,
) -> Result<(), FabricError> {
    let win = comm.win_create(SharedBuffer::from_vec(sendbuf.to_vec()))?;
    if comm.rank() == root {
        for peer in 0..comm.size() {
            let base = displs[peer] as usize;
            for (offset, len) in chunks(recvcounts[peer] as usize, chunksize) {
                win.get(
                    &mut recvbuf[base + offset..base + offset + len],
                    peer,
                    offset as u64,
                )?;
            }
        }
    }
    win.free()
}

/// One-sided push variant: the root exposes the receive buffer and every
/// rank issues chunked puts targeting its own displacement.
pub fn gatherv64_one_sided_push(
    comm: &dyn Comm,
    sendbuf: &[u8],
    recvbuf: &mut [u8],
    recvcounts: &[u64],
    displs: &[u64],
    root: usize,
    chunksize: usize,
) -> Result<(), FabricError> {
    let size = comm.size();
    let recv_total = (displs[size - 1] + recvcounts[size - 1]) as usize;

    let exposed = if comm.rank() == root {
        SharedBuffer::from_vec(vec![0u8; recv_total])
    } else {
        SharedBuffer::new()
    };
    let mirror = exposed.clone();
    let win = comm.win_create(exposed)?;

    let base = displs[comm.rank()] as usize;
    for (offset, len) in chunks(sendbuf.len(), chunksize) {
        win.put(&sendbuf[offset..offset + len], root, (base + offset) as u64)?;
    }
    win.free()?;

    if comm.rank() == root {
        recvbuf[..recv_total].copy_from_slice(&mirror.to_vec());
    }
    Ok(())
}

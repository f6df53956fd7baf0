// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # SSC Fabric
//!
//! Message-passing fabric abstraction for the SSC staging coupler.
//!
//! The coupler core talks to the fabric exclusively through the [`Comm`] and
//! [`Window`] interfaces: point-to-point non-blocking send/receive,
//! the collectives (gather, gatherv, broadcast, allgather, allreduce,
//! barrier), and remote-memory windows with both fence and post/start/
//! complete/wait synchronization. This crate ships an in-process backend
//! ([`local::LocalCluster`]) that drives N ranks from N threads of one
//! process, which is what the test suites and single-node runs use. A
//! production MPI backend implements the same traits out of tree.
//!
//! The chunked large-count gather variants live in [`gatherv`]; they share
//! the native gatherv signature (counts and displacement arrays) so callers
//! can swap them in once payloads outgrow a 32-bit element count.

pub mod gatherv;
mod handshake;
pub mod local;

pub use handshake::{handshake, Role, StreamContext};

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Errors surfaced by fabric operations. The coupler treats all of these as
/// fatal for the step that triggered them.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("rank {rank} out of range for communicator of size {size}")]
    RankOutOfRange { rank: usize, size: usize },

    #[error("message length {got} does not match expected {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("window access of {len} bytes at displacement {disp} exceeds exposed region of {exposed} bytes")]
    WindowOverrun { disp: u64, len: usize, exposed: usize },

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A completed or in-flight non-blocking send.
pub trait PendingSend: Send {
    fn wait(self: Box<Self>) -> Result<(), FabricError>;
}

/// An in-flight non-blocking receive. `wait` blocks until the matching
/// message arrives and yields its payload.
pub trait PendingRecv: Send {
    fn wait(self: Box<Self>) -> Result<Vec<u8>, FabricError>;
}

/// Collective-call counters for one communicator handle. Tests use these to
/// prove that the locked fast path performs zero collectives per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommStats {
    pub gathers: u64,
    pub bcasts: u64,
    pub barriers: u64,
    pub allgathers: u64,
    pub allreduces: u64,
    pub sends: u64,
}

impl CommStats {
    pub fn total_collectives(&self) -> u64 {
        self.gathers + self.bcasts + self.barriers + self.allgathers + self.allreduces
    }
}

/// A group of ranks within a communicator, used to scope post/start window
/// synchronization to one side of the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    ranks: Vec<usize>,
}

impl Group {
    pub fn new(mut ranks: Vec<usize>) -> Self {
        ranks.sort_unstable();
        ranks.dedup();
        Self { ranks }
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }
}

/// A byte buffer shared between the engine and any window exposing it.
///
/// Push transports write into the target's shared buffer and pull transports
/// read from it, so the payload and receive buffers must stay addressable
/// while a window over them is open. Callers must not hold a guard across a
/// fabric call.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(bytes)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.write()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Replace the contents with `len` zero bytes.
    pub fn reset(&self, len: usize) {
        let mut guard = self.inner.write();
        guard.clear();
        guard.resize(len, 0);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.read().clone()
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// Backend hook for [`Window`].
pub trait WindowImpl: Send {
    fn fence(&self) -> Result<(), FabricError>;
    fn post(&self, group: &Group) -> Result<(), FabricError>;
    fn start(&self, group: &Group) -> Result<(), FabricError>;
    fn complete(&self) -> Result<(), FabricError>;
    fn wait(&self) -> Result<(), FabricError>;
    fn put(&self, origin: &[u8], target: usize, disp: u64) -> Result<(), FabricError>;
    fn get(&self, out: &mut [u8], target: usize, disp: u64) -> Result<(), FabricError>;
    fn free(self: Box<Self>) -> Result<(), FabricError>;
}

/// A remote-memory window collectively created over a communicator. Every
/// rank exposes its own [`SharedBuffer`]; `put` addresses the target's
/// exposed region and `get` reads from it. `free` is collective and consumes
/// the window.
pub struct Window {
    inner: Box<dyn WindowImpl>,
}

impl Window {
    pub fn from_impl(inner: Box<dyn WindowImpl>) -> Self {
        Self { inner }
    }

    pub fn fence(&self) -> Result<(), FabricError> {
        self.inner.fence()
    }

    /// Open an exposure epoch for the origin ranks in `group`.
    pub fn post(&self, group: &Group) -> Result<(), FabricError> {
        self.inner.post(group)
    }

    /// Open an access epoch targeting the ranks in `group`. Blocks until all
    /// of them have posted.
    pub fn start(&self, group: &Group) -> Result<(), FabricError> {
        self.inner.start(group)
    }

    /// Close the access epoch opened by `start`.
    pub fn complete(&self) -> Result<(), FabricError> {
        self.inner.complete()
    }

    /// Close the exposure epoch opened by `post`. Blocks until every origin
    /// in the posted group has called `complete`.
    pub fn wait(&self) -> Result<(), FabricError> {
        self.inner.wait()
    }

    pub fn put(&self, origin: &[u8], target: usize, disp: u64) -> Result<(), FabricError> {
        self.inner.put(origin, target, disp)
    }

    pub fn get(&self, out: &mut [u8], target: usize, disp: u64) -> Result<(), FabricError> {
        self.inner.get(out, target, disp)
    }

    pub fn free(self) -> Result<(), FabricError> {
        self.inner.free()
    }
}

/// A communicator handle for one rank.
///
/// All collective methods must be called by every rank of the communicator
/// in the same program order; point-to-point messages between a (source,
/// tag) pair are non-overtaking. `isend` is buffered and never blocks.
pub trait Comm: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Split into sub-communicators by color. Collective.
    fn split(&self, color: u32) -> Result<Arc<dyn Comm>, FabricError>;

    fn barrier(&self) -> Result<(), FabricError>;

    /// Gather one u64 per rank to `root`. The root receives the values in
    /// rank order; every other rank receives an empty vector.
    fn gather_u64(&self, value: u64, root: usize) -> Result<Vec<u64>, FabricError>;

    /// Byte gatherv with per-rank counts and displacements. Only the root's
    /// `recv`, `counts` and `displs` are read.
    fn gatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[u64],
        displs: &[u64],
        root: usize,
    ) -> Result<(), FabricError>;

    fn bcast_u64(&self, value: u64, root: usize) -> Result<u64, FabricError>;

    /// Broadcast `buf` from `root`; every rank must pass a buffer of the
    /// same length.
    fn bcast(&self, buf: &mut [u8], root: usize) -> Result<(), FabricError>;

    fn allgather_u8(&self, value: u8) -> Result<Vec<u8>, FabricError>;

    fn allreduce_max_i64(&self, value: i64) -> Result<i64, FabricError>;

    fn isend(
        &self,
        dest: usize,
        tag: u32,
        data: &[u8],
    ) -> Result<Box<dyn PendingSend>, FabricError>;

    fn irecv(&self, src: usize, tag: u32) -> Result<Box<dyn PendingRecv>, FabricError>;

    /// Collectively create a window; every rank exposes its own buffer.
    fn win_create(&self, buffer: SharedBuffer) -> Result<Window, FabricError>;

    /// Whether the fabric was initialized with full multi-thread support.
    fn thread_multiple(&self) -> bool;

    fn stats(&self) -> CommStats;
}

/// Wait on a batch of sends, surfacing the first failure.
pub fn waitall_sends(requests: Vec<Box<dyn PendingSend>>) -> Result<(), FabricError> {
    for request in requests {
        request.wait()?;
    }
    Ok(())
}

// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process fabric backend.
//!
//! [`LocalCluster::comms`] materializes a world of N ranks inside one
//! process; each rank's [`Comm`] handle is meant to be driven from its own
//! thread. Point-to-point messaging uses per-rank mailboxes keyed by
//! `(source, tag)` with FIFO ordering, which is the same non-overtaking rule
//! the MPI standard gives, and the collectives are built on top of reserved
//! internal tags. Window put/get move bytes immediately through the shared
//! buffers; the epoch primitives (fence, post/start/complete/wait) carry the
//! ordering obligations.
//!
//! Tags with the high bit set are reserved for the backend's collectives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{
    Comm, CommStats, FabricError, Group, PendingRecv, PendingSend, SharedBuffer, Window,
    WindowImpl,
};

const TAG_GATHER: u32 = 0x8000_0001;
const TAG_GATHERV: u32 = 0x8000_0002;
const TAG_BCAST: u32 = 0x8000_0003;
const TAG_ALLGATHER: u32 = 0x8000_0004;
const TAG_REDUCE: u32 = 0x8000_0005;
const TAG_SPLIT: u32 = 0x8000_0006;

/// Builder for in-process worlds.
pub struct LocalCluster;

impl LocalCluster {
    /// Create a world of `world_size` ranks. Element `i` of the returned
    /// vector is rank `i`'s communicator handle.
    pub fn comms(world_size: usize) -> Vec<Arc<dyn Comm>> {
        assert!(world_size > 0, "world must have at least one rank");
        let cluster = Arc::new(ClusterState::new());
        let state = Arc::new(CommState::new(
            cluster.next_comm_id(),
            world_size,
            cluster.clone(),
        ));
        (0..world_size)
            .map(|rank| Arc::new(LocalComm::new(rank, state.clone())) as Arc<dyn Comm>)
            .collect()
    }
}

/// Process-wide state shared by every communicator of one cluster: comm id
/// allocation and the rendezvous table used by `split` and `win_create`.
struct ClusterState {
    next_comm_id: AtomicU64,
    rendezvous: Mutex<HashMap<RendezvousKey, RendezvousEntry>>,
    rendezvous_cv: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RendezvousKey {
    Split { parent: u64, seq: u64, color: u32 },
    Window { comm: u64, seq: u64 },
}

enum RendezvousEntry {
    Comm { state: Arc<CommState>, taken: usize },
    Window { shared: Arc<WindowShared>, arrived: usize },
}

impl ClusterState {
    fn new() -> Self {
        Self {
            next_comm_id: AtomicU64::new(0),
            rendezvous: Mutex::new(HashMap::new()),
            rendezvous_cv: Condvar::new(),
        }
    }

    fn next_comm_id(&self) -> u64 {
        self.next_comm_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct Mailbox {
    queues: Mutex<HashMap<(usize, u32), VecDeque<Vec<u8>>>>,
    cv: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, src: usize, tag: u32, data: Vec<u8>) {
        let mut queues = self.queues.lock();
        queues.entry((src, tag)).or_default().push_back(data);
        self.cv.notify_all();
    }

    fn pop_blocking(&self, src: usize, tag: u32) -> Vec<u8> {
        let mut queues = self.queues.lock();
        loop {
            if let Some(queue) = queues.get_mut(&(src, tag)) {
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            self.cv.wait(&mut queues);
        }
    }
}

struct BarrierState {
    state: Mutex<(usize, u64)>,
    cv: Condvar,
}

impl BarrierState {
    fn new() -> Self {
        Self {
            state: Mutex::new((0, 0)),
            cv: Condvar::new(),
        }
    }

    fn wait(&self, size: usize) {
        let mut state = self.state.lock();
        let generation = state.1;
        state.0 += 1;
        if state.0 == size {
            state.0 = 0;
            state.1 += 1;
            self.cv.notify_all();
        } else {
            while state.1 == generation {
                self.cv.wait(&mut state);
            }
        }
    }
}

struct CommState {
    id: u64,
    size: usize,
    cluster: Arc<ClusterState>,
    mailboxes: Vec<Mailbox>,
    barrier: BarrierState,
}

impl CommState {
    fn new(id: u64, size: usize, cluster: Arc<ClusterState>) -> Self {
        Self {
            id,
            size,
            cluster,
            mailboxes: (0..size).map(|_| Mailbox::new()).collect(),
            barrier: BarrierState::new(),
        }
    }
}

/// One rank's handle onto a [`CommState`].
struct LocalComm {
    rank: usize,
    state: Arc<CommState>,
    split_seq: AtomicU64,
    win_seq: AtomicU64,
    gathers: AtomicU64,
    bcasts: AtomicU64,
    barriers: AtomicU64,
    allgathers: AtomicU64,
    allreduces: AtomicU64,
    sends: AtomicU64,
}

impl LocalComm {
    fn new(rank: usize, state: Arc<CommState>) -> Self {
        Self {
            rank,
            state,
            split_seq: AtomicU64::new(0),
            win_seq: AtomicU64::new(0),
            gathers: AtomicU64::new(0),
            bcasts: AtomicU64::new(0),
            barriers: AtomicU64::new(0),
            allgathers: AtomicU64::new(0),
            allreduces: AtomicU64::new(0),
            sends: AtomicU64::new(0),
        }
    }

    fn check_rank(&self, rank: usize) -> Result<(), FabricError> {
        if rank >= self.state.size {
            return Err(FabricError::RankOutOfRange {
                rank,
                size: self.state.size,
            });
        }
        Ok(())
    }

    fn send_bytes(&self, dest: usize, tag: u32, data: Vec<u8>) -> Result<(), FabricError> {
        self.check_rank(dest)?;
        self.state.mailboxes[dest].push(self.rank, tag, data);
        Ok(())
    }

    fn recv_bytes(&self, src: usize, tag: u32) -> Result<Vec<u8>, FabricError> {
        self.check_rank(src)?;
        Ok(self.state.mailboxes[self.rank].pop_blocking(src, tag))
    }

    fn recv_exact(&self, src: usize, tag: u32, expected: usize) -> Result<Vec<u8>, FabricError> {
        let message = self.recv_bytes(src, tag)?;
        if message.len() != expected {
            return Err(FabricError::LengthMismatch {
                expected,
                got: message.len(),
            });
        }
        Ok(message)
    }

    /// Internal fixed-width allgather used by `split` and `allgather_u8`.
    fn allgather_words(&self, word: &[u8], tag: u32) -> Result<Vec<Vec<u8>>, FabricError> {
        let size = self.state.size;
        let width = word.len();
        if self.rank != 0 {
            self.send_bytes(0, tag, word.to_vec())?;
            let packed = self.recv_exact(0, tag, width * size)?;
            return Ok(packed.chunks(width).map(<[u8]>::to_vec).collect());
        }
        let mut words = vec![Vec::new(); size];
        words[0] = word.to_vec();
        for src in 1..size {
            words[src] = self.recv_exact(src, tag, width)?;
        }
        let packed: Vec<u8> = words.iter().flatten().copied().collect();
        for dest in 1..size {
            self.send_bytes(dest, tag, packed.clone())?;
        }
        Ok(words)
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn split(&self, color: u32) -> Result<Arc<dyn Comm>, FabricError> {
        let colors = self.allgather_words(&color.to_le_bytes(), TAG_SPLIT)?;
        let members: Vec<usize> = colors
            .iter()
            .enumerate()
            .filter(|(_, c)| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) == color)
            .map(|(rank, _)| rank)
            .collect();
        let new_rank = members
            .iter()
            .position(|&r| r == self.rank)
            .expect("split caller is a member of its own color");

        let seq = self.split_seq.fetch_add(1, Ordering::Relaxed);
        let key = RendezvousKey::Split {
            parent: self.state.id,
            seq,
            color,
        };

        let cluster = self.state.cluster.clone();
        let mut table = cluster.rendezvous.lock();
        let (state, last) = {
            let entry = table.entry(key).or_insert_with(|| RendezvousEntry::Comm {
                state: Arc::new(CommState::new(
                    cluster.next_comm_id(),
                    members.len(),
                    cluster.clone(),
                )),
                taken: 0,
            });
            match entry {
                RendezvousEntry::Comm { state, taken } => {
                    *taken += 1;
                    (state.clone(), *taken == members.len())
                }
                RendezvousEntry::Window { .. } => unreachable!("split key maps to a comm entry"),
            }
        };
        if last {
            table.remove(&key);
        }
        drop(table);

        Ok(Arc::new(LocalComm::new(new_rank, state)))
    }

    fn barrier(&self) -> Result<(), FabricError> {
        self.barriers.fetch_add(1, Ordering::Relaxed);
        self.state.barrier.wait(self.state.size);
        Ok(())
    }

    fn gather_u64(&self, value: u64, root: usize) -> Result<Vec<u64>, FabricError> {
        self.check_rank(root)?;
        self.gathers.fetch_add(1, Ordering::Relaxed);
        if self.rank != root {
            self.send_bytes(root, TAG_GATHER, value.to_le_bytes().to_vec())?;
            return Ok(Vec::new());
        }
        let mut values = vec![0u64; self.state.size];
        values[root] = value;
        for src in (0..self.state.size).filter(|&r| r != root) {
            let message = self.recv_exact(src, TAG_GATHER, 8)?;
            values[src] = u64::from_le_bytes(message.try_into().expect("checked length"));
        }
        Ok(values)
    }

    fn gatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[u64],
        displs: &[u64],
        root: usize,
    ) -> Result<(), FabricError> {
        self.check_rank(root)?;
        self.gathers.fetch_add(1, Ordering::Relaxed);
        if self.rank != root {
            return self.send_bytes(root, TAG_GATHERV, send.to_vec());
        }
        if counts.len() != self.state.size || displs.len() != self.state.size {
            return Err(FabricError::LengthMismatch {
                expected: self.state.size,
                got: counts.len().min(displs.len()),
            });
        }
        let place = |recv: &mut [u8], rank: usize, data: &[u8]| -> Result<(), FabricError> {
            let expected = counts[rank] as usize;
            if data.len() != expected {
                return Err(FabricError::LengthMismatch {
                    expected,
                    got: data.len(),
                });
            }
            let offset = displs[rank] as usize;
            if offset + expected > recv.len() {
                return Err(FabricError::LengthMismatch {
                    expected: offset + expected,
                    got: recv.len(),
                });
            }
            recv[offset..offset + expected].copy_from_slice(data);
            Ok(())
        };
        place(recv, root, send)?;
        for src in (0..self.state.size).filter(|&r| r != root) {
            let message = self.recv_bytes(src, TAG_GATHERV)?;
            place(recv, src, &message)?;
        }
        Ok(())
    }

    fn bcast_u64(&self, value: u64, root: usize) -> Result<u64, FabricError> {
        let mut bytes = value.to_le_bytes();
        self.bcast(&mut bytes, root)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn bcast(&self, buf: &mut [u8], root: usize) -> Result<(), FabricError> {
        self.check_rank(root)?;
        self.bcasts.fetch_add(1, Ordering::Relaxed);
        if self.rank == root {
            for dest in (0..self.state.size).filter(|&r| r != root) {
                self.send_bytes(dest, TAG_BCAST, buf.to_vec())?;
            }
            return Ok(());
        }
        let message = self.recv_exact(root, TAG_BCAST, buf.len())?;
        buf.copy_from_slice(&message);
        Ok(())
    }

    fn allgather_u8(&self, value: u8) -> Result<Vec<u8>, FabricError> {
        self.allgathers.fetch_add(1, Ordering::Relaxed);
        let words = self.allgather_words(&[value], TAG_ALLGATHER)?;
        Ok(words.into_iter().map(|w| w[0]).collect())
    }

    fn allreduce_max_i64(&self, value: i64) -> Result<i64, FabricError> {
        self.allreduces.fetch_add(1, Ordering::Relaxed);
        let words = self.allgather_words(&value.to_le_bytes(), TAG_REDUCE)?;
        Ok(words
            .into_iter()
            .map(|w| i64::from_le_bytes(w.try_into().expect("fixed width word")))
            .max()
            .expect("non-empty communicator"))
    }

    fn isend(
        &self,
        dest: usize,
        tag: u32,
        data: &[u8],
    ) -> Result<Box<dyn PendingSend>, FabricError> {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.send_bytes(dest, tag, data.to_vec())?;
        Ok(Box::new(BufferedSend))
    }

    fn irecv(&self, src: usize, tag: u32) -> Result<Box<dyn PendingRecv>, FabricError> {
        self.check_rank(src)?;
        Ok(Box::new(MailboxRecv {
            state: self.state.clone(),
            rank: self.rank,
            src,
            tag,
        }))
    }

    fn win_create(&self, buffer: SharedBuffer) -> Result<Window, FabricError> {
        let seq = self.win_seq.fetch_add(1, Ordering::Relaxed);
        let key = RendezvousKey::Window {
            comm: self.state.id,
            seq,
        };
        let size = self.state.size;

        let cluster = self.state.cluster.clone();
        let mut table = cluster.rendezvous.lock();
        let (shared, last) = {
            let entry = table.entry(key).or_insert_with(|| RendezvousEntry::Window {
                shared: Arc::new(WindowShared::new(size)),
                arrived: 0,
            });
            match entry {
                RendezvousEntry::Window { shared, arrived } => {
                    shared.buffers.lock()[self.rank] = Some(buffer);
                    *arrived += 1;
                    (shared.clone(), *arrived == size)
                }
                RendezvousEntry::Comm { .. } => unreachable!("window key maps to a window entry"),
            }
        };
        if last {
            table.remove(&key);
            cluster.rendezvous_cv.notify_all();
        } else {
            // Window creation is collective; block until the whole
            // communicator has exposed its buffer.
            while table.contains_key(&key) {
                cluster.rendezvous_cv.wait(&mut table);
            }
        }
        drop(table);

        Ok(Window::from_impl(Box::new(LocalWindow {
            rank: self.rank,
            size,
            shared,
        })))
    }

    fn thread_multiple(&self) -> bool {
        true
    }

    fn stats(&self) -> CommStats {
        CommStats {
            gathers: self.gathers.load(Ordering::Relaxed),
            bcasts: self.bcasts.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            allgathers: self.allgathers.load(Ordering::Relaxed),
            allreduces: self.allreduces.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
        }
    }
}

struct BufferedSend;

impl PendingSend for BufferedSend {
    fn wait(self: Box<Self>) -> Result<(), FabricError> {
        Ok(())
    }
}

struct MailboxRecv {
    state: Arc<CommState>,
    rank: usize,
    src: usize,
    tag: u32,
}

impl PendingRecv for MailboxRecv {
    fn wait(self: Box<Self>) -> Result<Vec<u8>, FabricError> {
        Ok(self.state.mailboxes[self.rank].pop_blocking(self.src, self.tag))
    }
}

struct WindowShared {
    buffers: Mutex<Vec<Option<SharedBuffer>>>,
    barrier: BarrierState,
    sync: Mutex<EpochSync>,
    sync_cv: Condvar,
}

struct EpochSync {
    posted: Vec<bool>,
    post_group_size: Vec<usize>,
    completes: Vec<usize>,
    started: Vec<Vec<usize>>,
}

impl WindowShared {
    fn new(size: usize) -> Self {
        Self {
            buffers: Mutex::new(vec![None; size]),
            barrier: BarrierState::new(),
            sync: Mutex::new(EpochSync {
                posted: vec![false; size],
                post_group_size: vec![0; size],
                completes: vec![0; size],
                started: vec![Vec::new(); size],
            }),
            sync_cv: Condvar::new(),
        }
    }

    fn buffer(&self, rank: usize) -> SharedBuffer {
        self.buffers.lock()[rank]
            .clone()
            .expect("window creation registered every rank's buffer")
    }
}

struct LocalWindow {
    rank: usize,
    size: usize,
    shared: Arc<WindowShared>,
}

impl LocalWindow {
    fn check_target(&self, target: usize) -> Result<(), FabricError> {
        if target >= self.size {
            return Err(FabricError::RankOutOfRange {
                rank: target,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl WindowImpl for LocalWindow {
    fn fence(&self) -> Result<(), FabricError> {
        self.shared.barrier.wait(self.size);
        Ok(())
    }

    fn post(&self, group: &Group) -> Result<(), FabricError> {
        let mut sync = self.shared.sync.lock();
        sync.posted[self.rank] = true;
        sync.post_group_size[self.rank] = group.len();
        sync.completes[self.rank] = 0;
        self.shared.sync_cv.notify_all();
        Ok(())
    }

    fn start(&self, group: &Group) -> Result<(), FabricError> {
        let mut sync = self.shared.sync.lock();
        while !group.ranks().iter().all(|&t| sync.posted[t]) {
            self.shared.sync_cv.wait(&mut sync);
        }
        sync.started[self.rank] = group.ranks().to_vec();
        Ok(())
    }

    fn complete(&self) -> Result<(), FabricError> {
        let mut sync = self.shared.sync.lock();
        let targets = std::mem::take(&mut sync.started[self.rank]);
        for target in targets {
            sync.completes[target] += 1;
        }
        self.shared.sync_cv.notify_all();
        Ok(())
    }

    fn wait(&self) -> Result<(), FabricError> {
        let mut sync = self.shared.sync.lock();
        while sync.completes[self.rank] < sync.post_group_size[self.rank] {
            self.shared.sync_cv.wait(&mut sync);
        }
        sync.posted[self.rank] = false;
        sync.post_group_size[self.rank] = 0;
        sync.completes[self.rank] = 0;
        self.shared.sync_cv.notify_all();
        Ok(())
    }

    fn put(&self, origin: &[u8], target: usize, disp: u64) -> Result<(), FabricError> {
        self.check_target(target)?;
        let buffer = self.shared.buffer(target);
        let mut guard = buffer.write();
        let end = disp as usize + origin.len();
        if end > guard.len() {
            return Err(FabricError::WindowOverrun {
                disp,
                len: origin.len(),
                exposed: guard.len(),
            });
        }
        guard[disp as usize..end].copy_from_slice(origin);
        Ok(())
    }

    fn get(&self, out: &mut [u8], target: usize, disp: u64) -> Result<(), FabricError> {
        self.check_target(target)?;
        let buffer = self.shared.buffer(target);
        let guard = buffer.read();
        let end = disp as usize + out.len();
        if end > guard.len() {
            return Err(FabricError::WindowOverrun {
                disp,
                len: out.len(),
                exposed: guard.len(),
            });
        }
        out.copy_from_slice(&guard[disp as usize..end]);
        Ok(())
    }

    fn free(self: Box<Self>) -> Result<(), FabricError> {
        // Freeing is collective; the barrier is the completion boundary for
        // any epoch that relied on create/free bracketing.
        self.shared.barrier.wait(self.size);
        Ok(())
    }
}

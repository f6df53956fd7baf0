// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reader step engine, the dual of the writer.
//!
//! Step 0 receives the writer pattern (registering unknown variables and
//! attributes), pulls step-0 payload inside the brief exchange epoch, and
//! publishes the aggregated read selections. From step 1 on, a fully locked
//! session receives through the persistent window with the cached positions;
//! a flexible session re-receives the pattern every step, re-resolves
//! against its local selections, and pulls inside the per-step epoch.
//!
//! Incoming contributions mirror each writer's payload buffer, whose leading
//! byte is the final-step marker; the first contribution starts at offset 0
//! of the receive buffer, so `recv[0] == 1` signals end-of-stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use ssc_fabric::{handshake, Comm, Role, SharedBuffer, StreamContext, Window};

use crate::aggregate::{aggregate_metadata, broadcast_metadata};
use crate::block::{
    bytes_to_elements, total_data_size_of, Block, BlockVec, BlockVecVec, DataType, Dims, Element,
    RankPosMap, ShapeId,
};
use crate::codec::{serialize_variables, PatternBuffer};
use crate::config::EngineConfig;
use crate::engine::transport::{MpiMode, DATA_TAG};
use crate::engine::{copy_block_overlap, dims_product, receive_pattern, StepStatus};
use crate::io::Io;
use crate::overlap::reader_positions;
use crate::{Result, SscError};

struct ReaderOutcome {
    recv_map: Option<RankPosMap>,
    win: Option<Window>,
}

/// The step-0 `end_step` work: pull step-0 payload, publish selections,
/// open the persistent window when both sides locked. Owns everything it
/// touches and hands the results back at the `begin_step` join.
struct ReaderFirstJob {
    ctx: StreamContext,
    io: Io,
    local_reads: BlockVec,
    write_pattern: BlockVecVec,
    recv_buffer: SharedBuffer,
    writer_locked: bool,
    reader_locked: bool,
    chunksize: usize,
    verbose: u32,
}

impl ReaderFirstJob {
    fn run(self) -> Result<ReaderOutcome> {
        let stream = self.ctx.stream();
        let (recv_map, total) = reader_positions(&self.write_pattern, &self.local_reads)?;
        self.recv_buffer.reset(total as usize);
        if self.verbose >= 10 {
            tracing::info!(rank = stream.rank(), ?recv_map, "reader source positions");
        }

        // Step-0 payload rides the brief exchange epoch the writers open.
        let exchange = stream.win_create(self.recv_buffer.clone())?;
        pull_contributions(&exchange, &self.recv_buffer, &recv_map)?;
        exchange.free()?;

        let mut local = PatternBuffer::new();
        serialize_variables(&self.local_reads, &mut local, stream.rank() as i32)?;
        let mut global = aggregate_metadata(
            self.ctx.side().as_ref(),
            &local,
            false,
            self.reader_locked,
            self.chunksize,
        )?;
        broadcast_metadata(
            stream.as_ref(),
            &mut global,
            *self.ctx.reader_master_stream_rank(),
        )?;

        let win = if self.writer_locked && self.reader_locked {
            Some(stream.win_create(self.recv_buffer.clone())?)
        } else {
            None
        };

        Ok(ReaderOutcome {
            recv_map: Some(recv_map),
            win,
        })
    }
}

/// Pull every overlapping writer's whole contribution into the receive
/// buffer at its assigned offset.
fn pull_contributions(
    win: &Window,
    recv_buffer: &SharedBuffer,
    recv_map: &RankPosMap,
) -> Result<()> {
    for (&writer, &(offset, len)) in recv_map {
        let mut guard = recv_buffer.write();
        let offset = offset as usize;
        win.get(&mut guard[offset..offset + len as usize], writer, 0)?;
    }
    Ok(())
}

/// Reader-side engine: declares read selections, receives each step's
/// payload, and serves typed reads out of the receive buffer.
pub struct SscReader {
    io: Io,
    config: EngineConfig,
    ctx: StreamContext,
    threading: bool,
    current_step: i64,
    recv_buffer: SharedBuffer,
    write_pattern: BlockVecVec,
    selections: BTreeMap<String, (Dims, Dims)>,
    recv_map: RankPosMap,
    win: Option<Window>,
    worker: Option<JoinHandle<Result<ReaderOutcome>>>,
    writer_locked: bool,
    reader_locked: bool,
    finished: bool,
    closed: bool,
}

impl SscReader {
    /// Join a stream as a reader and construct the engine.
    pub fn open(io: Io, world: Arc<dyn Comm>, config: EngineConfig) -> Result<Self> {
        let ctx = handshake(world, Role::Reader, config.open_timeout_secs)?;
        Self::new(io, ctx, config)
    }

    pub fn new(io: Io, ctx: StreamContext, config: EngineConfig) -> Result<Self> {
        if ctx.is_writer() {
            return Err(SscError::InvalidState("reader engine on a writer context"));
        }
        let mut threading = config.threading;
        if threading && !ctx.stream().thread_multiple() {
            threading = false;
            if ctx.side().rank() == 0 {
                tracing::info!("threading disabled: fabric lacks multi-thread support");
            }
        }
        let reader_locked = config.lock_selections;
        Ok(Self {
            io,
            config,
            ctx,
            threading,
            current_step: -1,
            recv_buffer: SharedBuffer::new(),
            write_pattern: Vec::new(),
            selections: BTreeMap::new(),
            recv_map: RankPosMap::new(),
            win: None,
            worker: None,
            writer_locked: false,
            reader_locked,
            finished: false,
            closed: false,
        })
    }

    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    fn stream_rank(&self) -> usize {
        self.ctx.stream().rank()
    }

    fn fully_locked(&self) -> bool {
        self.writer_locked && self.reader_locked
    }

    fn window(&self) -> Result<&Window> {
        self.win
            .as_ref()
            .ok_or(SscError::InvalidState("no open window"))
    }

    fn join_worker(&mut self) -> Result<()> {
        if let Some(handle) = self.worker.take() {
            let outcome = handle
                .join()
                .map_err(|_| SscError::InvalidState("pattern worker panicked"))??;
            self.install(outcome);
        }
        Ok(())
    }

    fn install(&mut self, outcome: ReaderOutcome) {
        if let Some(recv_map) = outcome.recv_map {
            self.recv_map = recv_map;
        }
        if let Some(win) = outcome.win {
            self.win = Some(win);
        }
    }

    /// Declare the region of `name` this rank will read.
    pub fn set_selection(&mut self, name: &str, start: Dims, count: Dims) -> Result<()> {
        if let Some(def) = self.io.inquire_variable(name) {
            if def.shape_id == ShapeId::GlobalArray
                && (start.len() != def.shape.len() || count.len() != def.shape.len())
            {
                return Err(SscError::DimsMismatch {
                    name: name.to_string(),
                });
            }
        }
        self.selections.insert(name.to_string(), (start, count));
        Ok(())
    }

    pub fn begin_step(&mut self) -> Result<StepStatus> {
        if self.closed {
            return Err(SscError::InvalidState("begin_step after close"));
        }
        if self.finished {
            return Ok(StepStatus::EndOfStream);
        }
        self.join_worker()?;
        self.current_step += 1;
        let step = self.current_step;
        if self.config.verbose >= 5 {
            tracing::info!(
                stream_rank = self.stream_rank(),
                step,
                "reader begin step"
            );
        }

        if step == 0 {
            let received = receive_pattern(
                &self.ctx,
                &self.io,
                *self.ctx.writer_master_stream_rank(),
                true,
            )?;
            self.writer_locked = received.locked;
            self.write_pattern = received.pattern;
            if received.final_step {
                self.finished = true;
                return Ok(StepStatus::EndOfStream);
            }
            return Ok(StepStatus::Ok);
        }

        if self.fully_locked() {
            let final_step = self.fixed_receive()?;
            if final_step {
                self.finished = true;
                return Ok(StepStatus::EndOfStream);
            }
            return Ok(StepStatus::Ok);
        }

        // Flexible: the collective free of the previous epoch is the
        // completion barrier for the transfer consumed last step.
        if let Some(win) = self.win.take() {
            win.free()?;
        }
        let received = receive_pattern(
            &self.ctx,
            &self.io,
            *self.ctx.writer_master_stream_rank(),
            true,
        )?;
        if received.final_step {
            self.finished = true;
            return Ok(StepStatus::EndOfStream);
        }
        self.writer_locked = received.locked;
        self.write_pattern = received.pattern;
        self.flexible_pull()?;
        Ok(StepStatus::Ok)
    }

    /// Locked-mode receive through the persistent window (or matched
    /// non-blocking receives). Returns whether the final-step marker
    /// arrived.
    fn fixed_receive(&mut self) -> Result<bool> {
        match self.config.mpi_mode {
            MpiMode::TwoSided => {
                let mut pending = Vec::new();
                for (&writer, &(offset, len)) in &self.recv_map {
                    pending.push((self.ctx.stream().irecv(writer, DATA_TAG)?, offset, len));
                }
                for (request, offset, len) in pending {
                    let message = request.wait().map_err(SscError::from)?;
                    if message.len() as u64 > len {
                        return Err(SscError::CountMismatch {
                            expected: len as usize,
                            got: message.len(),
                        });
                    }
                    let mut guard = self.recv_buffer.write();
                    let offset = offset as usize;
                    guard[offset..offset + message.len()].copy_from_slice(&message);
                }
            }
            MpiMode::OneSidedFencePush => {
                let win = self.window()?;
                win.fence()?;
                win.fence()?;
            }
            MpiMode::OneSidedPostPush => {
                let win = self.window()?;
                win.post(self.ctx.peer_group())?;
                win.wait()?;
            }
            MpiMode::OneSidedFencePull => {
                let win = self.window()?;
                win.fence()?;
                pull_contributions(win, &self.recv_buffer, &self.recv_map)?;
                win.fence()?;
            }
            MpiMode::OneSidedPostPull => {
                let win = self.window()?;
                win.start(self.ctx.peer_group())?;
                pull_contributions(win, &self.recv_buffer, &self.recv_map)?;
                win.complete()?;
            }
        }

        let final_step = !self.recv_map.is_empty() && self.recv_buffer.read()[0] == 1;
        Ok(final_step)
    }

    /// Flexible-mode receive: re-resolve against the fresh write pattern
    /// and pull inside the new epoch. The window stays open until the next
    /// `begin_step` frees it.
    fn flexible_pull(&mut self) -> Result<()> {
        let local_reads = build_read_blocks(&self.io, &self.selections)?;
        let (recv_map, total) = reader_positions(&self.write_pattern, &local_reads)?;
        self.recv_buffer.reset(total as usize);

        let win = self.ctx.stream().win_create(self.recv_buffer.clone())?;
        pull_contributions(&win, &self.recv_buffer, &recv_map)?;
        self.recv_map = recv_map;
        self.win = Some(win);
        Ok(())
    }

    pub fn end_step(&mut self) -> Result<()> {
        if self.current_step < 0 {
            return Err(SscError::InvalidState("end_step before begin_step"));
        }
        if self.finished {
            return Ok(());
        }
        if self.config.verbose >= 5 {
            tracing::info!(
                stream_rank = self.stream_rank(),
                step = self.current_step,
                "reader end step"
            );
        }

        if self.current_step == 0 {
            let job = ReaderFirstJob {
                ctx: self.ctx.clone(),
                io: self.io.clone(),
                local_reads: build_read_blocks(&self.io, &self.selections)?,
                write_pattern: self.write_pattern.clone(),
                recv_buffer: self.recv_buffer.clone(),
                writer_locked: self.writer_locked,
                reader_locked: self.reader_locked,
                chunksize: self.config.chunksize,
                verbose: self.config.verbose,
            };
            if self.threading {
                self.worker = Some(std::thread::spawn(move || job.run()));
            } else {
                let outcome = job.run()?;
                self.install(outcome);
            }
        }
        Ok(())
    }

    pub fn perform_gets(&mut self) -> Result<()> {
        Ok(())
    }

    /// Deferred read. The receive buffer already holds the step's payload
    /// when reads are legal, so this is the same copy as [`Self::get`].
    pub fn get_deferred<T: Element>(&self, name: &str, dest: &mut [T]) -> Result<()> {
        self.get(name, dest)
    }

    /// Read the declared selection of `name` out of the receive buffer.
    /// Valid from step 1 on, and for step 0 once `end_step` has pulled.
    pub fn get<T: Element>(&self, name: &str, dest: &mut [T]) -> Result<()> {
        let def = self
            .io
            .inquire_variable(name)
            .ok_or_else(|| SscError::UnknownVariable(name.to_string()))?;
        if def.dtype != T::DATA_TYPE {
            return Err(SscError::TypeMismatch {
                name: name.to_string(),
                declared: def.dtype,
                requested: T::DATA_TYPE,
            });
        }

        match def.shape_id {
            ShapeId::GlobalValue => {
                if dest.len() != 1 {
                    return Err(SscError::CountMismatch {
                        expected: 1,
                        got: dest.len(),
                    });
                }
                dest[0] = self.read_scalar::<T>(name)?;
                Ok(())
            }
            ShapeId::GlobalArray => {
                let (sel_start, sel_count) = match self.selections.get(name) {
                    Some((start, count)) => (start.clone(), count.clone()),
                    None => (def.start.clone(), def.count.clone()),
                };
                let expected = dims_product(&sel_count) as usize;
                if dest.len() != expected {
                    return Err(SscError::CountMismatch {
                        expected,
                        got: dest.len(),
                    });
                }
                let mut staging = vec![0u8; expected * T::SIZE];
                let guard = self.recv_buffer.read();
                for (&writer, &(offset, _)) in &self.recv_map {
                    for block in self.write_pattern[writer]
                        .iter()
                        .filter(|b| b.name == name && b.shape_id == ShapeId::GlobalArray)
                    {
                        let base = (offset + block.buffer_start) as usize;
                        let len =
                            total_data_size_of(&block.count, block.dtype, block.shape_id)? as usize;
                        copy_block_overlap(
                            &guard[base..base + len],
                            &block.start,
                            &block.count,
                            &mut staging,
                            &sel_start,
                            &sel_count,
                            T::SIZE,
                        )?;
                    }
                }
                drop(guard);
                let values: Vec<T> = bytes_to_elements(&staging)?;
                dest.copy_from_slice(&values);
                Ok(())
            }
            ShapeId::LocalValue | ShapeId::LocalArray => Err(SscError::Unsupported(
                "local blocks are not routed across ranks",
            )),
        }
    }

    fn read_scalar<T: Element>(&self, name: &str) -> Result<T> {
        // Prefer the transferred payload, which is fresh every step even
        // under lock; fall back to the inline metadata value.
        let guard = self.recv_buffer.read();
        for (&writer, &(offset, _)) in &self.recv_map {
            if let Some(block) = self.write_pattern[writer]
                .iter()
                .find(|b| b.name == name && b.dtype != DataType::String)
            {
                let base = (offset + block.buffer_start) as usize;
                if base + T::SIZE <= guard.len() {
                    return Ok(T::read_le(&guard[base..base + T::SIZE]));
                }
            }
        }
        drop(guard);
        for blocks in &self.write_pattern {
            if let Some(block) = blocks
                .iter()
                .find(|b| b.name == name && b.value.len() >= T::SIZE)
            {
                return Ok(T::read_le(&block.value[..T::SIZE]));
            }
        }
        Err(SscError::UnknownVariable(name.to_string()))
    }

    /// Read a string variable's bytes out of the receive buffer.
    pub fn get_string(&self, name: &str) -> Result<String> {
        let guard = self.recv_buffer.read();
        for (&writer, &(offset, _)) in &self.recv_map {
            if let Some(block) = self.write_pattern[writer]
                .iter()
                .find(|b| b.name == name && b.dtype == DataType::String)
            {
                let base = (offset + block.buffer_start) as usize;
                let len = block.buffer_count as usize;
                if base + len > guard.len() {
                    return Err(SscError::MalformedBuffer {
                        cursor: base + len,
                        valid: guard.len(),
                    });
                }
                return String::from_utf8(guard[base..base + len].to_vec()).map_err(|_| {
                    SscError::MalformedBuffer {
                        cursor: base + len,
                        valid: guard.len(),
                    }
                });
            }
        }
        Err(SscError::UnknownVariable(name.to_string()))
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.join_worker()?;
        if self.config.verbose >= 5 {
            tracing::info!(stream_rank = self.stream_rank(), "reader close");
        }
        if let Some(win) = self.win.take() {
            win.free()?;
        }
        self.closed = true;
        Ok(())
    }
}

/// Build this rank's read-declaration blocks from its selections.
fn build_read_blocks(io: &Io, selections: &BTreeMap<String, (Dims, Dims)>) -> Result<BlockVec> {
    let mut blocks = BlockVec::new();
    for (name, (start, count)) in selections {
        let def = io
            .inquire_variable(name)
            .ok_or_else(|| SscError::UnknownVariable(name.clone()))?;
        let shape = match def.shape_id {
            ShapeId::GlobalArray => def.shape.clone(),
            _ => Dims::new(),
        };
        blocks.push(Block {
            name: name.clone(),
            shape_id: def.shape_id,
            dtype: def.dtype,
            shape,
            start: start.clone(),
            count: count.clone(),
            buffer_start: 0,
            buffer_count: 0,
            value: Vec::new(),
        });
    }
    Ok(blocks)
}

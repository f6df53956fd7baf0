// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Writer step engine.
//!
//! Byte 0 of the payload buffer is the final-step marker, so every block's
//! `buffer_start` begins at 1 and a writer's contribution to a reader is
//! `TotalDataSize + 1` bytes. The step-0 `end_step` publishes the write
//! pattern, exchanges step-0 payload through a brief window epoch, receives
//! the readers' selections, and resolves routing; locked sessions keep a
//! persistent window from then on, flexible sessions re-publish per step.

use std::sync::Arc;
use std::thread::JoinHandle;

use ssc_fabric::{
    handshake, waitall_sends, Comm, PendingSend, Role, SharedBuffer, StreamContext, Window,
};

use crate::aggregate::{aggregate_metadata, broadcast_metadata};
use crate::block::{
    elements_to_bytes, pattern_summary, same_dims, Block, BlockVecVec, DataType, Element,
    RankPosMap, ShapeId,
};
use crate::codec::{serialize_attributes, serialize_variables, PatternBuffer};
use crate::config::EngineConfig;
use crate::engine::transport::{MpiMode, DATA_TAG};
use crate::engine::{dims_product, receive_pattern, StepStatus};
use crate::io::{Io, VariableDef};
use crate::overlap::{calculate_overlap, calculate_position};
use crate::{Result, SscError};

/// State a pattern-synchronization job hands back at the `begin_step` join.
struct WriterOutcome {
    write_pattern: BlockVecVec,
    send_map: Option<RankPosMap>,
    reader_locked: Option<bool>,
    win: Option<Window>,
}

enum SyncKind {
    /// Step 0: publish, exchange step-0 payload, receive selections, resolve.
    First,
    /// Flexible steps: re-publish the pattern and open a fresh window.
    Flexible,
    /// Close: publish one final pattern with the final-step flag.
    FinalPattern,
}

/// The fields a sync job owns while it runs; nothing here is shared with
/// the foreground engine.
struct WriterSyncJob {
    kind: SyncKind,
    ctx: StreamContext,
    io: Io,
    local: Vec<Block>,
    payload: SharedBuffer,
    writer_locked: bool,
    chunksize: usize,
    verbose: u32,
}

impl WriterSyncJob {
    fn run(self) -> Result<WriterOutcome> {
        match self.kind {
            SyncKind::First => self.run_first(),
            SyncKind::Flexible => self.run_flexible(),
            SyncKind::FinalPattern => {
                self.publish_write_pattern(true)?;
                Ok(WriterOutcome {
                    write_pattern: Vec::new(),
                    send_map: None,
                    reader_locked: None,
                    win: None,
                })
            }
        }
    }

    fn run_first(self) -> Result<WriterOutcome> {
        let write_pattern = self.publish_write_pattern(false)?;

        // Brief payload epoch: readers pull step-0 contributions between
        // the collective create and free.
        let stream = self.ctx.stream();
        let exchange = stream.win_create(self.payload.clone())?;
        exchange.free()?;

        let received = receive_pattern(
            &self.ctx,
            &self.io,
            *self.ctx.reader_master_stream_rank(),
            false,
        )?;
        let reader_locked = received.locked;
        let read_pattern = received.pattern;

        let rank = stream.rank();
        let mut send_map = calculate_overlap(&read_pattern, &write_pattern[rank]);
        calculate_position(&write_pattern, &read_pattern, rank, &mut send_map)?;
        if self.verbose >= 10 {
            tracing::info!(rank, ?send_map, "writer target positions");
        }

        let win = if self.writer_locked && reader_locked {
            Some(stream.win_create(self.payload.clone())?)
        } else {
            None
        };

        Ok(WriterOutcome {
            write_pattern,
            send_map: Some(send_map),
            reader_locked: Some(reader_locked),
            win,
        })
    }

    fn run_flexible(self) -> Result<WriterOutcome> {
        let write_pattern = self.publish_write_pattern(false)?;
        let win = self.ctx.stream().win_create(self.payload.clone())?;
        Ok(WriterOutcome {
            write_pattern,
            send_map: None,
            reader_locked: None,
            win: Some(win),
        })
    }

    /// Serialize the local pattern, aggregate it across the writer side,
    /// broadcast it on the stream, and decode the full side pattern back.
    fn publish_write_pattern(&self, final_step: bool) -> Result<BlockVecVec> {
        let stream = self.ctx.stream();
        let mut local = PatternBuffer::new();
        serialize_variables(&self.local, &mut local, stream.rank() as i32)?;
        if self.ctx.side().rank() == 0 {
            serialize_attributes(&self.io, &mut local)?;
        }

        let mut global = aggregate_metadata(
            self.ctx.side().as_ref(),
            &local,
            final_step,
            self.writer_locked,
            self.chunksize,
        )?;
        broadcast_metadata(
            stream.as_ref(),
            &mut global,
            *self.ctx.writer_master_stream_rank(),
        )?;

        let mut pattern = vec![Vec::new(); stream.size()];
        crate::codec::deserialize(&global, &mut pattern, &self.io, false, false)?;
        if self.verbose >= 20 && self.ctx.side().rank() == 0 {
            tracing::info!("global write pattern:\n{}", pattern_summary(&pattern));
        }
        Ok(pattern)
    }
}

/// Writer-side engine: declares variables per step, fills the payload
/// buffer, and drives the per-step transfer handshake.
pub struct SscWriter {
    io: Io,
    config: EngineConfig,
    ctx: StreamContext,
    threading: bool,
    current_step: i64,
    payload: SharedBuffer,
    write_pattern: BlockVecVec,
    send_map: RankPosMap,
    win: Option<Window>,
    pending_sends: Vec<Box<dyn PendingSend>>,
    worker: Option<JoinHandle<Result<WriterOutcome>>>,
    writer_locked: bool,
    reader_locked: bool,
    closed: bool,
}

impl SscWriter {
    /// Join a stream as a writer and construct the engine.
    pub fn open(io: Io, world: Arc<dyn Comm>, config: EngineConfig) -> Result<Self> {
        let ctx = handshake(world, Role::Writer, config.open_timeout_secs)?;
        Self::new(io, ctx, config)
    }

    pub fn new(io: Io, ctx: StreamContext, config: EngineConfig) -> Result<Self> {
        if !ctx.is_writer() {
            return Err(SscError::InvalidState("writer engine on a reader context"));
        }
        let mut threading = config.threading;
        if threading && !ctx.stream().thread_multiple() {
            threading = false;
            if ctx.side().rank() == 0 {
                tracing::info!("threading disabled: fabric lacks multi-thread support");
            }
        }
        let writer_locked = config.lock_definitions;
        Ok(Self {
            io,
            config,
            ctx,
            threading,
            current_step: -1,
            payload: SharedBuffer::new(),
            write_pattern: Vec::new(),
            send_map: RankPosMap::new(),
            win: None,
            pending_sends: Vec::new(),
            worker: None,
            writer_locked,
            reader_locked: false,
            closed: false,
        })
    }

    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    fn stream_rank(&self) -> usize {
        self.ctx.stream().rank()
    }

    fn stream_size(&self) -> usize {
        self.ctx.stream().size()
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

    fn install(&mut self, outcome: WriterOutcome) {
        if !outcome.write_pattern.is_empty() {
            self.write_pattern = outcome.write_pattern;
        }
        if let Some(send_map) = outcome.send_map {
            self.send_map = send_map;
        }
        if let Some(locked) = outcome.reader_locked {
            self.reader_locked = locked;
        }
        if let Some(win) = outcome.win {
            self.win = Some(win);
        }
    }

    pub fn begin_step(&mut self) -> Result<StepStatus> {
        if self.closed {
            return Err(SscError::InvalidState("begin_step after close"));
        }
        self.join_worker()?;
        self.current_step += 1;
        let step = self.current_step;
        if self.config.verbose >= 5 {
            tracing::info!(
                stream_rank = self.stream_rank(),
                step,
                "writer begin step"
            );
        }

        if step == 0 || !self.fully_locked() {
            self.payload.reset(1);
            self.write_pattern = vec![Vec::new(); self.stream_size()];
        }

        if step > 1 {
            if self.fully_locked() {
                self.transport_wait()?;
            } else if let Some(win) = self.win.take() {
                win.free()?;
            }
        }
        Ok(StepStatus::Ok)
    }

    /// Synchronous put: data is copied into the payload buffer immediately,
    /// so the slice is free for reuse on return.
    pub fn put<T: Element>(&mut self, name: &str, data: &[T]) -> Result<()> {
        self.put_deferred(name, data)
    }

    /// Deferred put. The coupler copies at call time either way, so this is
    /// the same operation as [`Self::put`].
    pub fn put_deferred<T: Element>(&mut self, name: &str, data: &[T]) -> Result<()> {
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
        let expected = match def.shape_id {
            ShapeId::GlobalArray | ShapeId::LocalArray => dims_product(&def.count) as usize,
            ShapeId::GlobalValue | ShapeId::LocalValue => 1,
        };
        if data.len() != expected {
            return Err(SscError::CountMismatch {
                expected,
                got: data.len(),
            });
        }
        self.put_bytes(&def, elements_to_bytes(data))
    }

    /// Put a string variable; its byte length travels in `buffer_count`.
    pub fn put_string(&mut self, name: &str, value: &str) -> Result<()> {
        let def = self
            .io
            .inquire_variable(name)
            .ok_or_else(|| SscError::UnknownVariable(name.to_string()))?;
        if def.dtype != DataType::String {
            return Err(SscError::TypeMismatch {
                name: name.to_string(),
                declared: def.dtype,
                requested: DataType::String,
            });
        }
        self.put_bytes(&def, value.as_bytes().to_vec())
    }

    fn put_bytes(&mut self, def: &VariableDef, bytes: Vec<u8>) -> Result<()> {
        let rank = self.stream_rank();
        if self.write_pattern.len() <= rank {
            return Err(SscError::InvalidState("put before begin_step"));
        }

        if let Some(existing) = self.write_pattern[rank]
            .iter_mut()
            .find(|b| b.name == def.name)
        {
            // Locked mode reuses the recorded layout; the declaration must
            // not have changed.
            if existing.dtype != def.dtype {
                return Err(SscError::LockedPatternMismatch {
                    name: def.name.clone(),
                    what: "type",
                });
            }
            if def.shape_id == ShapeId::GlobalArray
                && (!same_dims(&existing.start, &def.start)
                    || !same_dims(&existing.count, &def.count))
            {
                return Err(SscError::LockedPatternMismatch {
                    name: def.name.clone(),
                    what: "selection",
                });
            }
            if bytes.len() as u64 != existing.buffer_count {
                return Err(SscError::CountMismatch {
                    expected: existing.buffer_count as usize,
                    got: bytes.len(),
                });
            }
            let start = existing.buffer_start as usize;
            if existing.shape_id.is_value() {
                existing.value = bytes.clone();
            }
            let mut guard = self.payload.write();
            guard[start..start + bytes.len()].copy_from_slice(&bytes);
            return Ok(());
        }

        let buffer_start = {
            let mut guard = self.payload.write();
            let start = guard.len();
            guard.extend_from_slice(&bytes);
            start as u64
        };
        let buffer_count = bytes.len() as u64;

        let (shape, start, count) = match def.shape_id {
            // Local arrays carry their extent in all three wire slots so
            // the record stays self-consistent.
            ShapeId::LocalArray => (
                def.count.clone(),
                vec![0; def.count.len()],
                def.count.clone(),
            ),
            _ => (def.shape.clone(), def.start.clone(), def.count.clone()),
        };
        let value = if def.shape_id.is_value() && bytes.len() <= 255 {
            bytes
        } else {
            Vec::new()
        };
        self.write_pattern[rank].push(Block {
            name: def.name.clone(),
            shape_id: def.shape_id,
            dtype: def.dtype,
            shape,
            start,
            count,
            buffer_start,
            buffer_count,
            value,
        });
        Ok(())
    }

    pub fn perform_puts(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync_job(&self, kind: SyncKind) -> WriterSyncJob {
        WriterSyncJob {
            kind,
            ctx: self.ctx.clone(),
            io: self.io.clone(),
            local: self
                .write_pattern
                .get(self.stream_rank())
                .cloned()
                .unwrap_or_default(),
            payload: self.payload.clone(),
            writer_locked: self.writer_locked,
            chunksize: self.config.chunksize,
            verbose: self.config.verbose,
        }
    }

    fn run_sync(&mut self, kind: SyncKind) -> Result<()> {
        let job = self.sync_job(kind);
        if self.threading {
            self.worker = Some(std::thread::spawn(move || job.run()));
        } else {
            let outcome = job.run()?;
            self.install(outcome);
        }
        Ok(())
    }

    pub fn end_step(&mut self) -> Result<()> {
        if self.current_step < 0 {
            return Err(SscError::InvalidState("end_step before begin_step"));
        }
        if self.config.verbose >= 5 {
            tracing::info!(
                stream_rank = self.stream_rank(),
                step = self.current_step,
                "writer end step"
            );
        }

        if self.current_step == 0 {
            self.run_sync(SyncKind::First)
        } else if self.fully_locked() {
            self.transport_send()
        } else {
            self.run_sync(SyncKind::Flexible)
        }
    }

    /// Dispatch one locked-mode transfer against the open window.
    fn transport_send(&mut self) -> Result<()> {
        let payload = self.payload.clone();
        let guard = payload.read();
        match self.config.mpi_mode {
            MpiMode::TwoSided => {
                for &reader in self.send_map.keys() {
                    self.pending_sends
                        .push(self.ctx.stream().isend(reader, DATA_TAG, &guard)?);
                }
            }
            MpiMode::OneSidedFencePush => {
                let win = self.window()?;
                win.fence()?;
                for (&reader, &(offset, _)) in &self.send_map {
                    win.put(&guard, reader, offset)?;
                }
            }
            MpiMode::OneSidedPostPush => {
                let win = self.window()?;
                win.start(self.ctx.peer_group())?;
                for (&reader, &(offset, _)) in &self.send_map {
                    win.put(&guard, reader, offset)?;
                }
            }
            MpiMode::OneSidedFencePull => {
                self.window()?.fence()?;
            }
            MpiMode::OneSidedPostPull => {
                self.window()?.post(self.ctx.peer_group())?;
            }
        }
        Ok(())
    }

    /// Complete the transfer launched by the previous `end_step`.
    fn transport_wait(&mut self) -> Result<()> {
        match self.config.mpi_mode {
            MpiMode::TwoSided => {
                let sends = std::mem::take(&mut self.pending_sends);
                waitall_sends(sends)?;
            }
            MpiMode::OneSidedFencePush | MpiMode::OneSidedFencePull => {
                self.window()?.fence()?;
            }
            MpiMode::OneSidedPostPush => self.window()?.complete()?,
            MpiMode::OneSidedPostPull => self.window()?.wait()?,
        }
        Ok(())
    }

    /// Close the stream. In locked mode the final-step marker is pushed to
    /// every target with the mode's completion sequence; otherwise one final
    /// pattern with the final-step flag is published.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.join_worker()?;
        if self.config.verbose >= 5 {
            tracing::info!(stream_rank = self.stream_rank(), "writer close");
        }

        if self.fully_locked() {
            if self.current_step > 0 {
                self.transport_wait()?;
            }
            self.payload.write()[0] = 1;
            let marker = [1u8];
            match self.config.mpi_mode {
                MpiMode::TwoSided => {
                    let mut sends = Vec::new();
                    for &reader in self.send_map.keys() {
                        sends.push(self.ctx.stream().isend(reader, DATA_TAG, &marker)?);
                    }
                    waitall_sends(sends)?;
                }
                MpiMode::OneSidedFencePush => {
                    let win = self.window()?;
                    win.fence()?;
                    for &reader in self.send_map.keys() {
                        win.put(&marker, reader, 0)?;
                    }
                    win.fence()?;
                }
                MpiMode::OneSidedPostPush => {
                    let win = self.window()?;
                    win.start(self.ctx.peer_group())?;
                    for &reader in self.send_map.keys() {
                        win.put(&marker, reader, 0)?;
                    }
                    win.complete()?;
                }
                MpiMode::OneSidedFencePull => {
                    let win = self.window()?;
                    win.fence()?;
                    win.fence()?;
                }
                MpiMode::OneSidedPostPull => {
                    let win = self.window()?;
                    win.post(self.ctx.peer_group())?;
                    win.wait()?;
                }
            }
            if let Some(win) = self.win.take() {
                win.free()?;
            }
        } else {
            if let Some(win) = self.win.take() {
                win.free()?;
            }
            let job = self.sync_job(SyncKind::FinalPattern);
            let outcome = job.run()?;
            self.install(outcome);
        }

        self.closed = true;
        Ok(())
    }
}

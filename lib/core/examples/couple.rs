// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Minimal coupling demo: two writers stream halves of a 1-D field to one
//! reader over the in-process fabric, all ranks on their own threads.
//!
//! Run with `cargo run -p ssc-core --example couple`.

use std::sync::Arc;

use anyhow::Result;
use ssc_core::{EngineConfig, Io, MpiMode, SscReader, SscWriter, StepStatus};
use ssc_fabric::local::LocalCluster;
use ssc_fabric::Comm;

const DOMAIN: u64 = 64;
const STEPS: u64 = 5;

fn writer_rank(comm: Arc<dyn Comm>, index: u64) -> Result<()> {
    let io = Io::new();
    let half = DOMAIN / 2;
    let start = index * half;
    io.define_variable::<f64>("field", vec![DOMAIN], vec![start], vec![half])?;
    io.define_attribute_string("units", "kelvin")?;

    let config = EngineConfig::builder()
        .mpi_mode(MpiMode::TwoSided)
        .lock_definitions(true)
        .lock_selections(true)
        .build()?;
    let mut writer = SscWriter::open(io, comm, config)?;

    for step in 0..STEPS {
        writer.begin_step()?;
        let data: Vec<f64> = (0..half)
            .map(|i| (step * 1000 + start + i) as f64)
            .collect();
        writer.put("field", &data)?;
        writer.end_step()?;
    }
    writer.close()?;
    Ok(())
}

fn reader_rank(comm: Arc<dyn Comm>) -> Result<()> {
    let io = Io::new();
    let config = EngineConfig::builder()
        .mpi_mode(MpiMode::TwoSided)
        .lock_definitions(true)
        .lock_selections(true)
        .build()?;
    let mut reader = SscReader::open(io.clone(), comm, config)?;

    reader.begin_step()?;
    reader.set_selection("field", vec![0], vec![DOMAIN])?;
    reader.end_step()?;
    if let Some(units) = io.inquire_attribute("units") {
        println!("reader: units attribute = {:?}", units.value);
    }

    let mut field = vec![0f64; DOMAIN as usize];
    loop {
        match reader.begin_step()? {
            StepStatus::EndOfStream => break,
            StepStatus::Ok => {}
        }
        reader.get("field", &mut field)?;
        println!(
            "reader: step {} field[0]={} field[{}]={}",
            reader.current_step(),
            field[0],
            DOMAIN - 1,
            field[DOMAIN as usize - 1],
        );
        reader.end_step()?;
    }
    reader.close()?;
    println!("reader: end of stream");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let comms = LocalCluster::comms(3);
    let mut handles = Vec::new();
    for (rank, comm) in comms.into_iter().enumerate() {
        handles.push(std::thread::spawn(move || match rank {
            0 | 1 => writer_rank(comm, rank as u64),
            _ => reader_rank(comm),
        }));
    }
    for handle in handles {
        handle.join().expect("rank thread panicked")?;
    }
    Ok(())
}

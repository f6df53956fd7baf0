// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end coupling scenarios over the in-process fabric: writers and
//! readers on their own threads, every transport variant, locked and
//! flexible sessions.

use std::thread::JoinHandle;

use rstest::rstest;
use ssc_core::{EngineConfig, Io, MpiMode, SscReader, SscWriter, StepStatus};
use ssc_fabric::local::LocalCluster;
use ssc_fabric::Comm;

fn config(mode: MpiMode, locked: bool, threading: bool) -> EngineConfig {
    EngineConfig::builder()
        .mpi_mode(mode)
        .threading(threading)
        .lock_definitions(locked)
        .lock_selections(locked)
        .build()
        .expect("valid config")
}

fn spawn<F>(f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::spawn(f)
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.join().expect("rank thread panicked");
    }
}

#[rstest]
#[case::twosided(MpiMode::TwoSided)]
#[case::fencepush(MpiMode::OneSidedFencePush)]
#[case::postpush(MpiMode::OneSidedPostPush)]
#[case::fencepull(MpiMode::OneSidedFencePull)]
#[case::postpull(MpiMode::OneSidedPostPull)]
fn locked_single_writer_single_reader(#[case] mode: MpiMode) {
    let comms = LocalCluster::comms(2);
    let steps = 3u64;

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<f32>("u", vec![10], vec![0], vec![10])
            .unwrap();
        let mut writer = SscWriter::open(io, writer_comm, config(mode, true, false)).unwrap();
        for step in 0..steps {
            writer.begin_step().unwrap();
            let data: Vec<f32> = (0..10).map(|i| (step * 100 + i) as f32).collect();
            writer.put("u", &data).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader = SscReader::open(io, reader_comm, config(mode, true, false)).unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("u", vec![0], vec![10]).unwrap();
        reader.end_step().unwrap();

        // Step-0 payload was pulled inside the exchange epoch.
        let mut out = vec![0f32; 10];
        reader.get("u", &mut out).unwrap();
        assert_eq!(out, (0..10).map(|i| i as f32).collect::<Vec<_>>());

        for step in 1..steps {
            assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
            reader.get("u", &mut out).unwrap();
            let expected: Vec<f32> = (0..10).map(|i| (step * 100 + i) as f32).collect();
            assert_eq!(out, expected);
            reader.end_step().unwrap();
        }

        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[rstest]
#[case::twosided(MpiMode::TwoSided)]
#[case::fencepush(MpiMode::OneSidedFencePush)]
#[case::postpush(MpiMode::OneSidedPostPush)]
#[case::fencepull(MpiMode::OneSidedFencePull)]
#[case::postpull(MpiMode::OneSidedPostPull)]
fn locked_two_writers_one_reader(#[case] mode: MpiMode) {
    // W0 holds {0,50}, W1 holds {50,50} of a shape-{100} array; the reader
    // requests the whole domain and sees both halves stitched in rank order.
    let comms = LocalCluster::comms(3);
    let steps = 2u64;

    let mut handles = Vec::new();
    for writer_rank in 0..2usize {
        let comm = comms[writer_rank].clone();
        handles.push(spawn(move || {
            let io = Io::new();
            let start = writer_rank as u64 * 50;
            io.define_variable::<f64>("field", vec![100], vec![start], vec![50])
                .unwrap();
            let mut writer = SscWriter::open(io, comm, config(mode, true, false)).unwrap();
            for step in 0..steps {
                writer.begin_step().unwrap();
                let data: Vec<f64> = (0..50)
                    .map(|i| (step * 1000 + start + i) as f64)
                    .collect();
                writer.put("field", &data).unwrap();
                writer.end_step().unwrap();
            }
            writer.close().unwrap();
        }));
    }

    let reader_comm = comms[2].clone();
    handles.push(spawn(move || {
        let io = Io::new();
        let mut reader = SscReader::open(io, reader_comm, config(mode, true, false)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("field", vec![0], vec![100]).unwrap();
        reader.end_step().unwrap();

        let mut out = vec![0f64; 100];
        for step in 1..steps {
            assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
            reader.get("field", &mut out).unwrap();
            for (i, &v) in out.iter().enumerate() {
                assert_eq!(v, (step * 1000) as f64 + i as f64, "index {i}");
            }
            reader.end_step().unwrap();
        }
        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    }));

    join_all(handles);
}

#[test]
fn disjoint_selections_transfer_nothing() {
    // Writer fills {0,5}; reader wants {5,5}. No overlap, no payload.
    let comms = LocalCluster::comms(2);

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<f32>("u", vec![10], vec![0], vec![5])
            .unwrap();
        let mut writer =
            SscWriter::open(io, writer_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        for _ in 0..2 {
            writer.begin_step().unwrap();
            writer.put("u", &[1.0f32; 5]).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io, reader_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("u", vec![5], vec![5]).unwrap();
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        let mut out = vec![-1.0f32; 5];
        reader.get("u", &mut out).unwrap();
        // Nothing overlapped, so nothing was written over the staging zeros.
        assert_eq!(out, vec![0.0; 5]);
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[test]
fn locked_fast_path_performs_no_collectives() {
    let comms = LocalCluster::comms(2);
    let probe = comms[0].clone();

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<f32>("u", vec![4], vec![0], vec![4])
            .unwrap();
        let mut writer =
            SscWriter::open(io, writer_comm, config(MpiMode::TwoSided, true, false)).unwrap();

        writer.begin_step().unwrap();
        writer.put("u", &[0.0f32; 4]).unwrap();
        writer.end_step().unwrap();

        // Steady state: from here on, locked steps are pure point-to-point.
        writer.begin_step().unwrap();
        let baseline = probe.stats().total_collectives();
        writer.put("u", &[1.0f32; 4]).unwrap();
        writer.end_step().unwrap();
        writer.begin_step().unwrap();
        assert_eq!(probe.stats().total_collectives(), baseline);
        writer.put("u", &[2.0f32; 4]).unwrap();
        writer.end_step().unwrap();

        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io, reader_comm, config(MpiMode::TwoSided, true, false)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("u", vec![0], vec![4]).unwrap();
        reader.end_step().unwrap();
        let mut out = vec![0f32; 4];
        for expected in [1.0f32, 2.0] {
            assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
            reader.get("u", &mut out).unwrap();
            assert_eq!(out, vec![expected; 4]);
            reader.end_step().unwrap();
        }
        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[test]
fn flexible_reshape_between_steps() {
    // Step 0 publishes count {10}, step 1 count {20}; both steps aggregate
    // and broadcast, and the second step's routing reflects the new count.
    let comms = LocalCluster::comms(2);

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<f32>("u", vec![20], vec![0], vec![10])
            .unwrap();
        let mut writer =
            SscWriter::open(io.clone(), writer_comm, config(MpiMode::TwoSided, false, false))
                .unwrap();

        writer.begin_step().unwrap();
        writer.put("u", &vec![1.0f32; 10]).unwrap();
        writer.end_step().unwrap();

        writer.begin_step().unwrap();
        io.set_selection("u", vec![0], vec![20]).unwrap();
        writer.put("u", &vec![2.0f32; 20]).unwrap();
        writer.end_step().unwrap();

        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io, reader_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("u", vec![0], vec![20]).unwrap();
        reader.end_step().unwrap();

        let mut out = vec![0f32; 20];
        reader.get("u", &mut out).unwrap();
        assert_eq!(&out[..10], &[1.0f32; 10][..]);
        assert_eq!(&out[10..], &[0.0f32; 10][..]);

        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.get("u", &mut out).unwrap();
        assert_eq!(out, vec![2.0f32; 20]);
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[test]
fn flexible_with_background_threading() {
    let comms = LocalCluster::comms(2);
    let steps = 4u64;

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<i64>("ticks", vec![8], vec![0], vec![8])
            .unwrap();
        let mut writer =
            SscWriter::open(io, writer_comm, config(MpiMode::TwoSided, false, true)).unwrap();
        for step in 0..steps {
            writer.begin_step().unwrap();
            let data: Vec<i64> = (0..8).map(|i| (step * 10 + i) as i64).collect();
            writer.put("ticks", &data).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io, reader_comm, config(MpiMode::TwoSided, false, true)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("ticks", vec![0], vec![8]).unwrap();
        reader.end_step().unwrap();

        let mut out = vec![0i64; 8];
        for step in 1..steps {
            assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
            reader.get("ticks", &mut out).unwrap();
            assert_eq!(out[5], (step * 10 + 5) as i64);
            reader.end_step().unwrap();
        }
        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[test]
fn scalars_strings_and_attributes_travel() {
    let comms = LocalCluster::comms(2);

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<u64>("step_id", vec![], vec![], vec![])
            .unwrap();
        io.define_string_variable("title").unwrap();
        io.define_variable::<f32>("u", vec![4], vec![0], vec![4])
            .unwrap();
        io.define_attribute("schema_version", 3i32).unwrap();
        io.define_attribute_array("origin", &[0.0f64, 0.5]).unwrap();
        io.define_attribute_string("units", "kelvin").unwrap();

        let mut writer =
            SscWriter::open(io, writer_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        for step in 0..2u64 {
            writer.begin_step().unwrap();
            writer.put("step_id", &[step]).unwrap();
            writer.put_string("title", "gray-scott").unwrap();
            writer.put("u", &[step as f32; 4]).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io.clone(), reader_comm, config(MpiMode::TwoSided, false, false))
                .unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);

        // Attributes and variables were registered off the step-0 pattern.
        assert_eq!(
            io.inquire_attribute("schema_version").unwrap().value,
            ssc_core::AttributeValue::Int32(vec![3])
        );
        assert_eq!(
            io.inquire_attribute("units").unwrap().value,
            ssc_core::AttributeValue::String("kelvin".to_string())
        );
        assert!(io.inquire_variable("title").is_some());

        reader.set_selection("u", vec![0], vec![4]).unwrap();
        reader
            .set_selection("step_id", Vec::new(), Vec::new())
            .unwrap();
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        let mut scalar = [0u64];
        reader.get("step_id", &mut scalar).unwrap();
        assert_eq!(scalar[0], 1);
        assert_eq!(reader.get_string("title").unwrap(), "gray-scott");
        let mut field = [0f32; 4];
        reader.get("u", &mut field).unwrap();
        assert_eq!(field, [1.0f32; 4]);
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[test]
fn two_writers_two_readers_flexible() {
    // Each reader takes a sliding window that straddles both writers.
    let comms = LocalCluster::comms(4);
    let steps = 3u64;
    let mut handles = Vec::new();

    for writer_rank in 0..2usize {
        let comm = comms[writer_rank].clone();
        handles.push(spawn(move || {
            let io = Io::new();
            let start = writer_rank as u64 * 32;
            io.define_variable::<u32>("grid", vec![64], vec![start], vec![32])
                .unwrap();
            let mut writer =
                SscWriter::open(io, comm, config(MpiMode::TwoSided, false, false)).unwrap();
            for step in 0..steps {
                writer.begin_step().unwrap();
                let data: Vec<u32> = (0..32).map(|i| (step * 100) as u32 + start as u32 + i).collect();
                writer.put("grid", &data).unwrap();
                writer.end_step().unwrap();
            }
            writer.close().unwrap();
        }));
    }

    for reader_idx in 0..2usize {
        let comm = comms[2 + reader_idx].clone();
        handles.push(spawn(move || {
            let io = Io::new();
            let mut reader =
                SscReader::open(io, comm, config(MpiMode::TwoSided, false, false)).unwrap();
            assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
            let start = 16 + reader_idx as u64 * 8;
            reader.set_selection("grid", vec![start], vec![32]).unwrap();
            reader.end_step().unwrap();

            let mut out = vec![0u32; 32];
            for step in 1..steps {
                assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
                reader.get("grid", &mut out).unwrap();
                for (i, &v) in out.iter().enumerate() {
                    assert_eq!(v, (step * 100) as u32 + start as u32 + i as u32);
                }
                reader.end_step().unwrap();
            }
            assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
            reader.close().unwrap();
        }));
    }

    join_all(handles);
}

#[test]
fn mixed_lock_flags_fall_back_to_flexible() {
    // Writer locks, reader does not: the session must stay flexible and
    // still deliver every step.
    let comms = LocalCluster::comms(2);

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        io.define_variable::<f32>("u", vec![6], vec![0], vec![6])
            .unwrap();
        let mut config = config(MpiMode::TwoSided, false, false);
        config.lock_definitions = true;
        let mut writer = SscWriter::open(io, writer_comm, config).unwrap();
        for step in 0..2 {
            writer.begin_step().unwrap();
            writer.put("u", &[step as f32; 6]).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io, reader_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        reader.set_selection("u", vec![0], vec![6]).unwrap();
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
        let mut out = vec![0f32; 6];
        reader.get("u", &mut out).unwrap();
        assert_eq!(out, vec![1.0f32; 6]);
        reader.end_step().unwrap();

        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

#[test]
fn writer_close_without_steps_ends_stream() {
    let comms = LocalCluster::comms(2);

    let writer_comm = comms[0].clone();
    let writer = spawn(move || {
        let io = Io::new();
        let mut writer =
            SscWriter::open(io, writer_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        writer.close().unwrap();
    });

    let reader_comm = comms[1].clone();
    let reader = spawn(move || {
        let io = Io::new();
        let mut reader =
            SscReader::open(io, reader_comm, config(MpiMode::TwoSided, false, false)).unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
        reader.close().unwrap();
    });

    join_all(vec![writer, reader]);
}

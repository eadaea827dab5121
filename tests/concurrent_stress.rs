//! Multi-threaded engine tests: concurrent inserts driving splits and
//! root growth, conflicting read-write transactions, and concurrent
//! array counters.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};

use ironwood::config::EngineOptions;
use ironwood::engine::Engine;
use ironwood::error::ErrorCode;
use ironwood::storage::{ArrayMetadata, MasstreeMetadata, Metadata};
use ironwood::xct::IsolationLevel;

fn engine_with_workers(workers: u16) -> Engine {
    common::init_tracing();
    let mut options = EngineOptions::tiny();
    options.thread.thread_count_per_group = workers;
    options.memory.page_pool_size_mb_per_node = 16;
    let engine = Engine::new(options).unwrap();
    engine.initialize().unwrap();
    engine
}

/// Two workers repeatedly insert keys designed to force foster splits
/// at the root; after quiescence every committed key must be readable
/// and the total record count must equal the successful commits.
#[test]
fn test_concurrent_inserts_with_growth() {
    let engine = engine_with_workers(2);
    let mut ddl_context = engine.attach_thread(0, 0).unwrap();
    engine
        .create_storage(
            &mut ddl_context,
            Metadata::Masstree(MasstreeMetadata::new("grow")),
        )
        .unwrap();
    drop(ddl_context);

    const PER_WORKER: u64 = 400;
    let committed = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for worker in 0..2u64 {
            let engine = &engine;
            let committed = &committed;
            scope.spawn(move || {
                let mut context = engine.attach_thread(0, worker as u16).unwrap();
                let storage = engine.get_storage_by_name("grow").unwrap();
                let masstree = storage.as_masstree().unwrap();
                for i in 0..PER_WORKER {
                    // Interleave the workers' key spaces so both sides
                    // of every split keep receiving inserts.
                    let key = i * 2 + worker;
                    let mut attempts = 0;
                    loop {
                        attempts += 1;
                        assert!(attempts < 1000, "insert of {key} kept failing");
                        context.begin_xct(IsolationLevel::Serializable).unwrap();
                        match masstree
                            .insert_record_normalized(&mut context, key, &key.to_le_bytes())
                            .and_then(|()| context.precommit_xct())
                        {
                            Ok(_) => {
                                committed.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(ErrorCode::Conflict) => {
                                // Optimistic validation missed; retry.
                                let _ = context.abort_xct();
                            }
                            Err(other) => panic!("insert failed: {other}"),
                        }
                    }
                }
            });
        }
    });

    assert_eq!(committed.load(Ordering::Relaxed), 2 * PER_WORKER);

    // Quiescent check: every committed record is present exactly once.
    let mut context = engine.attach_thread(0, 0).unwrap();
    let storage = engine.get_storage_by_name("grow").unwrap();
    let masstree = storage.as_masstree().unwrap();
    context.begin_xct(IsolationLevel::Serializable).unwrap();
    for key in 0..2 * PER_WORKER {
        let value: u64 = masstree
            .get_record_primitive_normalized(&mut context, key, 0)
            .unwrap();
        assert_eq!(value, key);
    }
    let epoch = context.precommit_xct().unwrap();
    context.wait_for_commit(epoch).unwrap();
    engine.uninitialize().unwrap();
}

/// Worker X reads a key; worker Y commits an overwrite of it; X's
/// precommit must return a conflict and leave no durable change.
#[test]
fn test_read_write_conflict_aborts_reader() {
    let engine = engine_with_workers(2);
    let mut context_x = engine.attach_thread(0, 0).unwrap();
    let mut context_y = engine.attach_thread(0, 1).unwrap();
    let (storage, _) = engine
        .create_storage(
            &mut context_x,
            Metadata::Masstree(MasstreeMetadata::new("conflict")),
        )
        .unwrap();
    let masstree = storage.as_masstree().unwrap();

    context_x.begin_xct(IsolationLevel::Serializable).unwrap();
    masstree
        .insert_record_normalized(&mut context_x, 42, &1u64.to_le_bytes())
        .unwrap();
    let epoch = context_x.precommit_xct().unwrap();
    context_x.wait_for_commit(epoch).unwrap();

    // X reads the key.
    context_x.begin_xct(IsolationLevel::Serializable).unwrap();
    let observed: u64 = masstree
        .get_record_primitive_normalized(&mut context_x, 42, 0)
        .unwrap();
    assert_eq!(observed, 1);

    // Y overwrites and commits while X is still open.
    context_y.begin_xct(IsolationLevel::Serializable).unwrap();
    masstree
        .overwrite_record_normalized(&mut context_y, 42, &2u64.to_le_bytes(), 0)
        .unwrap();
    let epoch = context_y.precommit_xct().unwrap();
    context_y.wait_for_commit(epoch).unwrap();

    // X stages its own overwrite; validation must fail.
    masstree
        .overwrite_record_normalized(&mut context_x, 42, &3u64.to_le_bytes(), 0)
        .unwrap();
    assert_eq!(context_x.precommit_xct(), Err(ErrorCode::Conflict));

    // Y's value survives; X left no durable change.
    context_x.begin_xct(IsolationLevel::Serializable).unwrap();
    let survived: u64 = masstree
        .get_record_primitive_normalized(&mut context_x, 42, 0)
        .unwrap();
    assert_eq!(survived, 2);
    let epoch = context_x.precommit_xct().unwrap();
    context_x.wait_for_commit(epoch).unwrap();
    engine.uninitialize().unwrap();
}

/// Concurrent increments on one array record: the final sum equals the
/// number of successful commits.
#[test]
fn test_concurrent_array_increments() {
    let engine = engine_with_workers(2);
    let mut ddl_context = engine.attach_thread(0, 0).unwrap();
    engine
        .create_storage(
            &mut ddl_context,
            Metadata::Array(ArrayMetadata::new("counters", 8, 4)),
        )
        .unwrap();
    drop(ddl_context);

    const PER_WORKER: u64 = 200;
    std::thread::scope(|scope| {
        for worker in 0..2u16 {
            let engine = &engine;
            scope.spawn(move || {
                let mut context = engine.attach_thread(0, worker).unwrap();
                let storage = engine.get_storage_by_name("counters").unwrap();
                let array = storage.as_array().unwrap();
                for _ in 0..PER_WORKER {
                    let mut attempts = 0;
                    loop {
                        attempts += 1;
                        assert!(attempts < 10_000, "increment kept conflicting");
                        context.begin_xct(IsolationLevel::Serializable).unwrap();
                        match array
                            .increment_record::<u64>(&mut context, 2, 1, 0)
                            .and_then(|_| context.precommit_xct())
                        {
                            Ok(_) => break,
                            Err(ErrorCode::Conflict) => {
                                let _ = context.abort_xct();
                            }
                            Err(other) => panic!("increment failed: {other}"),
                        }
                    }
                }
            });
        }
    });

    let mut context = engine.attach_thread(0, 0).unwrap();
    let storage = engine.get_storage_by_name("counters").unwrap();
    let array = storage.as_array().unwrap();
    context.begin_xct(IsolationLevel::Serializable).unwrap();
    let total: u64 = array.get_record_primitive(&mut context, 2, 0).unwrap();
    assert_eq!(total, 2 * PER_WORKER);
    let epoch = context.precommit_xct().unwrap();
    context.wait_for_commit(epoch).unwrap();
    engine.uninitialize().unwrap();
}

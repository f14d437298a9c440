//! End-to-end tests of the deterministic data-feeding pipeline.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use treesync::data::store::{FlatFileStore, MemStore};
use treesync::{context, CancelFlag, DataReader, Phase, ReaderConfig, SourceRegistry};

fn mem_store(n: u8) -> Arc<MemStore> {
    let mut store = MemStore::new();
    for i in 0..n {
        store.push(format!("k{i}").into_bytes(), vec![i]);
    }
    Arc::new(store)
}

fn reader_config(source: &str, phase: Phase) -> ReaderConfig {
    ReaderConfig {
        owner: "it".to_string(),
        source: source.to_string(),
        batch_size: 2,
        prefetch: 2,
        phase,
    }
}

#[test]
fn round_robin_partitioning_is_deterministic() {
    const WORKERS: usize = 2;
    const RECORDS: u8 = 5;
    const PULLS: usize = 10;

    context::set_worker_count(WORKERS);
    let registry = SourceRegistry::new();
    let store = mem_store(RECORDS);

    let mut readers = Vec::new();
    for _ in 0..WORKERS {
        readers.push(
            DataReader::new(&registry, &reader_config("rr", Phase::Train), store.clone()).unwrap(),
        );
        // Stagger attachment; the partitioning must not depend on timing.
        thread::sleep(Duration::from_millis(20));
    }

    let cancel = CancelFlag::new();
    let mut pulled = vec![Vec::new(); WORKERS];
    for _ in 0..PULLS {
        for (i, reader) in readers.iter().enumerate() {
            let record = reader.full().pop(&cancel, "test consumer").unwrap();
            pulled[i].push(record.value()[0]);
            reader.free().push(record);
        }
    }

    // Worker i's k-th record is source record (k * W + i) mod N.
    for (i, values) in pulled.iter().enumerate() {
        for (k, &value) in values.iter().enumerate() {
            let expect = ((k * WORKERS + i) % RECORDS as usize) as u8;
            assert_eq!(value, expect, "worker {i}, pull {k}");
        }
    }
    context::set_worker_count(1);
}

#[test]
fn late_attachment_kills_the_reader_body() {
    context::set_worker_count(1);
    let registry = SourceRegistry::new();
    let store = mem_store(3);

    let early =
        DataReader::new(&registry, &reader_config("late", Phase::Train), store.clone()).unwrap();
    let cancel = CancelFlag::new();
    let first = early.full().pop(&cancel, "test consumer").unwrap();
    early.free().push(first);
    thread::sleep(Duration::from_millis(50));

    // Round-robin service has begun; a second queue is a determinism
    // violation and the body must refuse to serve anyone further.
    let late = DataReader::new(&registry, &reader_config("late", Phase::Train), store).unwrap();
    for _ in 0..8 {
        if let Some(record) = early.full().try_pop() {
            early.free().push(record);
        }
        thread::sleep(Duration::from_millis(10));
    }

    while let Some(record) = early.full().try_pop() {
        early.free().push(record);
    }
    thread::sleep(Duration::from_millis(100));
    assert!(early.full().try_pop().is_none());
    assert!(late.full().try_pop().is_none());
}

#[test]
fn distinct_keys_get_distinct_bodies() {
    let registry = SourceRegistry::new();
    let store = mem_store(2);
    let a = DataReader::new(&registry, &reader_config("a", Phase::Eval), store.clone()).unwrap();
    let b = DataReader::new(&registry, &reader_config("b", Phase::Eval), store).unwrap();
    assert_eq!(registry.len(), 2);
    assert_ne!(a.source(), b.source());
    drop(a);
    assert_eq!(registry.len(), 1);
    drop(b);
    assert!(registry.is_empty());
}

#[test]
fn flat_file_store_feeds_a_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.bin");
    let mut writer = FlatFileStore::writer(&path).unwrap();
    for i in 0u8..4 {
        writer.put(format!("k{i}").as_bytes(), &[i * 10]).unwrap();
    }
    writer.commit().unwrap();

    let registry = SourceRegistry::new();
    let config = reader_config(path.to_str().unwrap(), Phase::Eval);
    let reader =
        DataReader::new(&registry, &config, Arc::new(FlatFileStore::new(&path))).unwrap();

    let cancel = CancelFlag::new();
    let mut seen = Vec::new();
    for _ in 0..5 {
        let record = reader.full().pop(&cancel, "test consumer").unwrap();
        seen.push(record.value()[0]);
        reader.free().push(record);
    }
    // Wraps to the first record after the fourth.
    assert_eq!(seen, vec![0, 10, 20, 30, 0]);
}

#[test]
fn queue_pair_record_count_is_conserved() {
    let registry = SourceRegistry::new();
    let reader =
        DataReader::new(&registry, &reader_config("conserve", Phase::Eval), mem_store(2)).unwrap();
    let cancel = CancelFlag::new();

    // batch_size 2 × prefetch 2 = 4 records circulating.
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(reader.full().pop(&cancel, "test consumer").unwrap());
    }
    // All buffers are in hand; the body is starved and nothing new arrives.
    thread::sleep(Duration::from_millis(80));
    assert!(reader.full().try_pop().is_none());

    for record in held {
        reader.free().push(record);
    }
    // Returning buffers resumes the flow.
    assert!(reader.full().pop(&cancel, "test consumer").is_ok());
}

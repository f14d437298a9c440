//! Deterministic producer-consumer data feeding.
//!
//! One reading thread is created per distinct source, however many training
//! workers consume it. The body reads the source strictly sequentially and
//! distributes records to the attached queue pairs in fixed round-robin
//! order, so each worker sees the same subset of the source on every run,
//! independent of thread scheduling.

pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context;
use crate::queue::BlockingQueue;
use crate::thread::{CancelFlag, WorkerThread};
use crate::utils::error::{Result, TreeSyncError};
use crate::utils::metrics;

use store::{Cursor, RecordStore};

/// Whether a reader feeds parallel training workers or a single evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    Eval,
}

/// Composite identity of a logical data source. Two readers with the same
/// key share one body, and with it one sequential pass over the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub owner: String,
    pub path: String,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.path)
    }
}

/// Reader construction parameters.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Name of the consuming component; part of the source key so the same
    /// path read from two places stays two sources.
    pub owner: String,
    /// Source path (store-specific).
    pub source: String,
    pub batch_size: usize,
    /// Batches to read ahead per consumer.
    pub prefetch: usize,
    pub phase: Phase,
}

impl ReaderConfig {
    fn key(&self) -> SourceKey {
        SourceKey {
            owner: self.owner.clone(),
            path: self.source.clone(),
        }
    }
}

/// One opaque sample record. Buffers are recycled through the free queue, so
/// capacity is reused across reads.
#[derive(Debug, Default, Clone)]
pub struct Record {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Record {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn assign(&mut self, key: &[u8], value: &[u8]) {
        self.key.clear();
        self.key.extend_from_slice(key);
        self.value.clear();
        self.value.extend_from_slice(value);
    }
}

/// Free/full queue pair shared between a body and one consumer. The combined
/// record count is fixed at construction: `prefetch × batch_size` buffers
/// circulate between the two queues and nothing else allocates.
pub struct QueuePair {
    free: BlockingQueue<Record>,
    full: BlockingQueue<Record>,
}

impl QueuePair {
    fn new(capacity: usize) -> Self {
        let pair = Self {
            free: BlockingQueue::new(),
            full: BlockingQueue::new(),
        };
        for _ in 0..capacity {
            pair.free.push(Record::default());
        }
        pair
    }

    /// Recycled buffers awaiting the reader.
    pub fn free(&self) -> &BlockingQueue<Record> {
        &self.free
    }

    /// Ready records awaiting the consumer.
    pub fn full(&self) -> &BlockingQueue<Record> {
        &self.full
    }
}

/// Registry of live reader bodies, keyed by source. Owned by whatever scope
/// owns the training session and injected into every reader, so there is no
/// process-global state to leak between runs.
#[derive(Default)]
pub struct SourceRegistry {
    bodies: Mutex<HashMap<SourceKey, Weak<Body>>>,
}

impl SourceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live sources.
    pub fn len(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.lock().unwrap().is_empty()
    }

    fn attach(
        self: &Arc<Self>,
        key: &SourceKey,
        phase: Phase,
        store: Arc<dyn RecordStore>,
    ) -> Result<Arc<Body>> {
        let mut bodies = self.bodies.lock().unwrap();
        if let Some(body) = bodies.get(key).and_then(Weak::upgrade) {
            if body.shared.phase != phase {
                return Err(TreeSyncError::Config(format!(
                    "source {key} is already registered with a different phase"
                )));
            }
            return Ok(body);
        }
        let body = Body::spawn(key.clone(), phase, store, Arc::downgrade(self))?;
        bodies.insert(key.clone(), Arc::downgrade(&body));
        Ok(body)
    }

    /// Drop the entry for `key` if its body is gone. Called from the body's
    /// own destructor, so entries disappear exactly when the last reader
    /// releases them.
    fn prune(&self, key: &SourceKey) {
        let mut bodies = self.bodies.lock().unwrap();
        if let Some(weak) = bodies.get(key) {
            if weak.upgrade().is_none() {
                bodies.remove(key);
            }
        }
    }
}

struct BodyShared {
    key: SourceKey,
    phase: Phase,
    new_pairs: BlockingQueue<Arc<QueuePair>>,
}

/// The per-source reading thread and its attach queue.
struct Body {
    shared: Arc<BodyShared>,
    thread: WorkerThread,
    registry: Weak<SourceRegistry>,
}

impl Body {
    fn spawn(
        key: SourceKey,
        phase: Phase,
        store: Arc<dyn RecordStore>,
        registry: Weak<SourceRegistry>,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(BodyShared {
            key: key.clone(),
            phase,
            new_pairs: BlockingQueue::new(),
        });
        let mut thread = WorkerThread::new(format!("reader-{key}"));
        let entry_shared = shared.clone();
        thread.start(move |cancel| Body::read_loop(entry_shared, store, cancel))?;
        Ok(Arc::new(Self {
            shared,
            thread,
            registry,
        }))
    }

    fn read_loop(
        shared: Arc<BodyShared>,
        store: Arc<dyn RecordStore>,
        cancel: CancelFlag,
    ) -> Result<()> {
        let mut cursor = store.open()?;
        cursor.seek_to_first();
        if !cursor.valid() {
            return Err(TreeSyncError::Config(format!(
                "source {} contains no records",
                shared.key
            )));
        }

        let mut pairs = Vec::new();
        let outcome = Self::serve(&shared, cursor.as_mut(), &mut pairs, &cancel);
        metrics::global().attached_queues.sub(pairs.len() as f64);
        outcome
    }

    fn serve(
        shared: &BodyShared,
        cursor: &mut dyn Cursor,
        pairs: &mut Vec<Arc<QueuePair>>,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let consumers = match shared.phase {
            Phase::Train => context::worker_count(),
            Phase::Eval => 1,
        };

        // Deterministic runs require every consumer to be in place before
        // round-robin service starts, but consumers peek one record during
        // their own setup, so prime each queue as it attaches.
        for _ in 0..consumers {
            let pair = shared
                .new_pairs
                .pop(cancel, "waiting for sample queues to attach")?;
            Self::read_one(cursor, &pair, cancel)?;
            pairs.push(pair);
            metrics::global().attached_queues.inc();
        }
        info!(source = %shared.key, consumers, "reader entering round-robin service");

        while !cancel.is_set() {
            for pair in pairs.iter() {
                Self::read_one(cursor, pair, cancel)?;
            }
            // A queue attaching after service began would silently skew the
            // partitioning for everyone; that is a broken determinism
            // contract, not a transient fault.
            if !shared.new_pairs.is_empty() {
                return Err(TreeSyncError::Protocol(format!(
                    "sample queue attached to {} after round-robin service began",
                    shared.key
                )));
            }
        }
        Ok(())
    }

    fn read_one(cursor: &mut dyn Cursor, pair: &QueuePair, cancel: &CancelFlag) -> Result<()> {
        let mut record = pair
            .free()
            .pop(cancel, "waiting for a recycled sample buffer")?;
        record.assign(cursor.key(), cursor.value());
        pair.full().push(record);
        metrics::global().records_read.inc();

        cursor.next();
        if !cursor.valid() {
            debug!("restarting data prefetching from start");
            cursor.seek_to_first();
            metrics::global().source_epochs.inc();
        }
        Ok(())
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.thread.stop();
        if let Some(registry) = self.registry.upgrade() {
            registry.prune(&self.shared.key);
        }
    }
}

/// Consumer handle on one source: a queue pair wired to the shared body.
pub struct DataReader {
    queues: Arc<QueuePair>,
    body: Arc<Body>,
}

impl DataReader {
    /// Attach to the source named by `config`, spawning its body on first
    /// use. `store` is consulted only when the body does not exist yet.
    pub fn new(
        registry: &Arc<SourceRegistry>,
        config: &ReaderConfig,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        if config.batch_size == 0 || config.prefetch == 0 {
            return Err(TreeSyncError::Config(format!(
                "reader for {} needs batch_size and prefetch of at least 1",
                config.key()
            )));
        }
        let queues = Arc::new(QueuePair::new(config.prefetch * config.batch_size));
        let body = registry.attach(&config.key(), config.phase, store)?;
        body.shared.new_pairs.push(queues.clone());
        Ok(Self { queues, body })
    }

    pub fn source(&self) -> &SourceKey {
        &self.body.shared.key
    }

    /// Recycled buffers: consumers return exhausted records here.
    pub fn free(&self) -> &BlockingQueue<Record> {
        self.queues.free()
    }

    /// Ready records in arrival order.
    pub fn full(&self) -> &BlockingQueue<Record> {
        self.queues.full()
    }
}

#[cfg(test)]
mod tests {
    use super::store::MemStore;
    use super::*;

    fn mem_store(n: u8) -> Arc<MemStore> {
        let mut store = MemStore::new();
        for i in 0..n {
            store.push(format!("k{i}").into_bytes(), vec![i]);
        }
        Arc::new(store)
    }

    fn config(source: &str, phase: Phase) -> ReaderConfig {
        ReaderConfig {
            owner: "test".to_string(),
            source: source.to_string(),
            batch_size: 2,
            prefetch: 2,
            phase,
        }
    }

    #[test]
    fn readers_with_one_key_share_a_body() {
        context::set_worker_count(2);
        let registry = SourceRegistry::new();
        let store = mem_store(4);
        let a = DataReader::new(&registry, &config("shared", Phase::Train), store.clone()).unwrap();
        let b = DataReader::new(&registry, &config("shared", Phase::Train), store).unwrap();
        assert!(Arc::ptr_eq(&a.body, &b.body));
        assert_eq!(registry.len(), 1);
        context::set_worker_count(1);
    }

    #[test]
    fn registry_entry_is_pruned_with_the_last_reader() {
        let registry = SourceRegistry::new();
        let reader =
            DataReader::new(&registry, &config("pruned", Phase::Eval), mem_store(2)).unwrap();
        assert_eq!(registry.len(), 1);
        drop(reader);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn phase_mismatch_on_a_live_key_is_a_config_error() {
        context::set_worker_count(2);
        let registry = SourceRegistry::new();
        let store = mem_store(3);
        let _a =
            DataReader::new(&registry, &config("mixed", Phase::Train), store.clone()).unwrap();
        match DataReader::new(&registry, &config("mixed", Phase::Eval), store) {
            Err(TreeSyncError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
        context::set_worker_count(1);
    }

    #[test]
    fn empty_source_fails_instead_of_spinning() {
        let registry = SourceRegistry::new();
        let reader =
            DataReader::new(&registry, &config("empty", Phase::Eval), mem_store(0)).unwrap();
        // The body dies with a config error; no record ever appears.
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(reader.full().try_pop().is_none());
    }

    #[test]
    fn zero_prefetch_is_rejected() {
        let registry = SourceRegistry::new();
        let mut cfg = config("zero", Phase::Eval);
        cfg.prefetch = 0;
        assert!(DataReader::new(&registry, &cfg, mem_store(1)).is_err());
    }

    #[test]
    fn eval_reader_wraps_around_the_source() {
        let registry = SourceRegistry::new();
        let reader =
            DataReader::new(&registry, &config("wrap", Phase::Eval), mem_store(3)).unwrap();
        let cancel = CancelFlag::new();
        let mut seen = Vec::new();
        for _ in 0..7 {
            let record = reader.full().pop(&cancel, "test").unwrap();
            seen.push(record.value()[0]);
            reader.free().push(record);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }
}

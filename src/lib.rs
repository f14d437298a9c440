//! # treesync
//!
//! Synchronous multi-device training coordination: devices are paired into a
//! reduction tree, one worker per device keeps its parameters and gradients
//! in flat per-device buffers, and each iteration gradients are reduced up
//! the tree while updated parameters are broadcast back down. A decoupled
//! producer-consumer pipeline feeds samples to the workers deterministically:
//! one reading thread per source, fixed round-robin distribution.
//!
//! ## Modules
//!
//! - [`topology`]: reduction-tree pairing over a device set.
//! - [`sync`]: per-device workers and the tree reduce/broadcast protocol.
//! - [`params`]: flat per-device parameter/gradient buffers.
//! - [`device`]: opaque device memory and peer-link queries.
//! - [`data`]: deterministic sample feeding (readers, queue pairs, stores).
//! - [`queue`], [`thread`], [`context`]: blocking queues, cancellable worker
//!   threads, and the per-thread execution context they propagate.
//! - [`utils`]: errors, logging, configuration, metrics.

pub mod context;
pub mod data;
pub mod device;
pub mod params;
pub mod queue;
pub mod sync;
pub mod thread;
pub mod topology;
pub mod utils;

// Re-exports for convenience
pub use data::{DataReader, Phase, QueuePair, Record, ReaderConfig, SourceKey, SourceRegistry};
pub use device::{DeviceLinkInfo, DeviceMem, LinkMatrix, MemView};
pub use params::{Apply, HostRegion, LearnableRegion, ParamBuffer};
pub use queue::BlockingQueue;
pub use sync::{IterationHooks, LocalStep, Sgd, SyncGroup, SyncWorker, WorkerState};
pub use thread::{CancelFlag, WorkerThread};
pub use topology::{pair_devices, DevicePair};
pub use utils::config::TreeSyncConfig;
pub use utils::error::{Result, TreeSyncError};

//! Per-thread execution context.
//!
//! Worker behavior must not depend on which thread created the worker, so the
//! active device, compute mode, seed, worker count and root flag live in a
//! thread-local snapshot. [`crate::thread::WorkerThread`] captures the
//! caller's context on `start()` and installs it in the new thread before the
//! entry point runs.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

/// Where numerical work for the current thread is expected to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeMode {
    #[default]
    Cpu,
    Gpu,
}

/// Snapshot of the per-thread state propagated into worker threads.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Active device id.
    pub device: i32,
    /// Compute mode for numerical collaborators.
    pub mode: ComputeMode,
    /// Pseudo-random seed for this thread.
    pub seed: u64,
    /// Number of parallel training workers in the process.
    pub worker_count: usize,
    /// Whether this thread drives the root worker.
    pub root_worker: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            device: 0,
            mode: ComputeMode::Cpu,
            seed: 0,
            worker_count: 1,
            root_worker: true,
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::default());
}

impl ExecutionContext {
    /// Snapshot the calling thread's context, drawing a fresh seed so no two
    /// started threads share a seed stream.
    pub fn capture() -> Self {
        let mut ctx = current();
        ctx.seed = rand::random();
        ctx
    }

    /// Make this snapshot the calling thread's context.
    pub fn install(&self) {
        CONTEXT.with(|c| *c.borrow_mut() = self.clone());
    }
}

/// Clone of the calling thread's context.
pub fn current() -> ExecutionContext {
    CONTEXT.with(|c| c.borrow().clone())
}

pub fn device() -> i32 {
    CONTEXT.with(|c| c.borrow().device)
}

pub fn set_device(device: i32) {
    CONTEXT.with(|c| c.borrow_mut().device = device);
}

pub fn mode() -> ComputeMode {
    CONTEXT.with(|c| c.borrow().mode)
}

pub fn set_mode(mode: ComputeMode) {
    CONTEXT.with(|c| c.borrow_mut().mode = mode);
}

pub fn seed() -> u64 {
    CONTEXT.with(|c| c.borrow().seed)
}

pub fn set_seed(seed: u64) {
    CONTEXT.with(|c| c.borrow_mut().seed = seed);
}

pub fn worker_count() -> usize {
    CONTEXT.with(|c| c.borrow().worker_count)
}

pub fn set_worker_count(count: usize) {
    CONTEXT.with(|c| c.borrow_mut().worker_count = count);
}

pub fn root_worker() -> bool {
    CONTEXT.with(|c| c.borrow().root_worker)
}

pub fn set_root_worker(root: bool) {
    CONTEXT.with(|c| c.borrow_mut().root_worker = root);
}

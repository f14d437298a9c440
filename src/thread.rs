//! Cancellable background worker threads.
//!
//! A [`WorkerThread`] owns at most one OS thread running a cooperative task.
//! Cancellation is an atomic flag handed to the entry point; every blocking
//! wait in this crate checks it, and a wait cut short returns
//! [`TreeSyncError::Interrupted`], which the harness treats as ordinary
//! shutdown. Dropping a `WorkerThread` stops and joins the task, so no
//! background thread outlives its owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::error;

use crate::context::ExecutionContext;
use crate::utils::error::{Result, TreeSyncError};

/// Shared cooperative-cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Fast non-blocking poll, usable inside loops.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle wrapper for one cancellable background task.
pub struct WorkerThread {
    name: String,
    cancel: CancelFlag,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cancel: CancelFlag::new(),
            handle: None,
        }
    }

    /// Whether the task has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether cancellation has been requested for the current task.
    pub fn must_stop(&self) -> bool {
        self.cancel.is_set()
    }

    /// Start the task. Fails if one is already running; threads are stopped
    /// explicitly, never restarted implicitly.
    ///
    /// The caller's [`ExecutionContext`] (with a fresh seed) is installed in
    /// the new thread before `entry` runs, so the task behaves the same no
    /// matter which thread started it. An `Err(Interrupted)` from `entry` is
    /// ordinary shutdown; any other error is logged.
    pub fn start<F>(&mut self, entry: F) -> Result<()>
    where
        F: FnOnce(CancelFlag) -> Result<()> + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(TreeSyncError::Config(format!(
                "worker thread '{}' is already running",
                self.name
            )));
        }
        let ctx = ExecutionContext::capture();
        self.cancel = CancelFlag::new();
        let cancel = self.cancel.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                ctx.install();
                match entry(cancel) {
                    Ok(()) | Err(TreeSyncError::Interrupted) => {}
                    Err(e) => error!(thread = %name, error = %e, "worker task failed"),
                }
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Request cancellation and block until the task has fully exited.
    /// No-op on a never-started (or already stopped) thread.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.request();
            if handle.join().is_err() {
                error!(thread = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn double_start_fails_with_config_error() {
        let mut thread = WorkerThread::new("t");
        let (tx, rx) = mpsc::channel();
        thread
            .start(move |cancel| {
                while !cancel.is_set() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        match thread.start(|_| Ok(())) {
            Err(TreeSyncError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
        thread.stop();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn stop_on_never_started_thread_is_a_noop() {
        let mut thread = WorkerThread::new("idle");
        thread.stop();
        assert!(!thread.is_running());
    }

    #[test]
    fn stop_interrupts_a_cooperative_loop_promptly() {
        let mut thread = WorkerThread::new("loop");
        thread
            .start(|cancel| {
                while !cancel.is_set() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        thread.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn caller_context_is_installed_in_the_task() {
        context::set_device(2);
        context::set_worker_count(8);
        context::set_root_worker(false);
        let (tx, rx) = mpsc::channel();
        let mut thread = WorkerThread::new("ctx");
        thread
            .start(move |_| {
                tx.send((
                    context::device(),
                    context::worker_count(),
                    context::root_worker(),
                ))
                .unwrap();
                Ok(())
            })
            .unwrap();
        let (device, workers, root) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(device, 2);
        assert_eq!(workers, 8);
        assert!(!root);
        thread.stop();
        // Restore for other tests in this process.
        context::set_device(0);
        context::set_worker_count(1);
        context::set_root_worker(true);
    }

    #[test]
    fn restart_after_explicit_stop_is_allowed() {
        let mut thread = WorkerThread::new("again");
        thread.start(|_| Ok(())).unwrap();
        thread.stop();
        thread.start(|_| Ok(())).unwrap();
        thread.stop();
    }
}

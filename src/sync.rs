//! Synchronous tree-structured parameter/gradient synchronization.
//!
//! One [`SyncWorker`] per device holds that device's flat parameter and
//! gradient buffers and a handshake queue. Each iteration the root's
//! parameters flow down the tree (broadcast) and gradients flow back up
//! (reduce); the root rescales the sum and applies the optimizer update.
//! Iteration ordering across workers is enforced purely by the handshake
//! tokens: a worker cannot enter iteration k+1 before its parent has
//! broadcast the post-k parameters, so no global lock is needed.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::context;
use crate::device::{share, DeviceLinkInfo, DeviceMem, SharedMem};
use crate::params::ParamBuffer;
use crate::queue::BlockingQueue;
use crate::thread::{CancelFlag, WorkerThread};
use crate::topology::pair_devices;
use crate::utils::error::{Result, TreeSyncError};
use crate::utils::metrics;

/// Local optimizer stepping hook. The root worker invokes it once per
/// iteration on the averaged gradient.
pub trait LocalStep: Send {
    fn step(&mut self, iter: usize, data: &mut [f32], diff: &[f32]);
}

/// Plain gradient descent, the reference stepper for tests and demos.
pub struct Sgd {
    pub lr: f32,
}

impl LocalStep for Sgd {
    fn step(&mut self, _iter: usize, data: &mut [f32], diff: &[f32]) {
        for (d, g) in data.iter_mut().zip(diff) {
            *d -= self.lr * g;
        }
    }
}

/// Iteration-boundary capability invoked by the stepping loop: broadcast
/// before the local pass, reduce after it.
pub trait IterationHooks {
    fn on_start(&mut self, cancel: &CancelFlag) -> Result<()>;
    fn on_gradients_ready(&mut self, cancel: &CancelFlag) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Handshake tokens carry the sender's device id.
type Token = i32;

struct ParentLink {
    device: i32,
    queue: Arc<BlockingQueue<Token>>,
    /// Receiving buffer for this worker's reduced gradient, allocated on the
    /// parent's device.
    staging: SharedMem,
}

struct ChildLink {
    device: i32,
    queue: Arc<BlockingQueue<Token>>,
    data: SharedMem,
    staging: SharedMem,
}

/// Per-device worker combining local stepping with tree synchronization.
pub struct SyncWorker {
    device: i32,
    state: WorkerState,
    buf: ParamBuffer,
    queue: Arc<BlockingQueue<Token>>,
    parent: Option<ParentLink>,
    children: Vec<ChildLink>,
    stepper: Box<dyn LocalStep>,
    worker_count: usize,
    iter: usize,
}

impl SyncWorker {
    fn new(
        device: i32,
        region_sizes: &[usize],
        worker_count: usize,
        stepper: Box<dyn LocalStep>,
        parent: Option<(i32, Arc<BlockingQueue<Token>>)>,
    ) -> Self {
        let buf = ParamBuffer::new(device, region_sizes);
        let parent = parent.map(|(parent_device, parent_queue)| ParentLink {
            device: parent_device,
            queue: parent_queue,
            staging: share(DeviceMem::alloc(parent_device, buf.len())),
        });
        Self {
            device,
            state: WorkerState::Created,
            buf,
            queue: Arc::new(BlockingQueue::new()),
            parent,
            children: Vec::new(),
            stepper,
            worker_count,
            iter: 0,
        }
    }

    /// Attempt peer access to the parent and mark the worker ready to run.
    fn initialize(&mut self, links: &dyn DeviceLinkInfo) {
        if let Some(parent) = &self.parent {
            if !links.enable_access(self.device, parent.device) {
                info!(
                    device = self.device,
                    parent = parent.device,
                    "no direct peer access to parent; transfers stage through the host"
                );
            }
        }
        self.state = WorkerState::Initialized;
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Flat data/gradient buffers of this worker's device. Collaborators
    /// alias their tensors into these via [`ParamBuffer::apply`].
    pub fn buffer(&self) -> &ParamBuffer {
        &self.buf
    }

    /// Completed iterations.
    pub fn iterations(&self) -> usize {
        self.iter
    }

    /// Drive `iters` synchronized iterations. `compute` is the execution
    /// engine's local pass: it receives the iteration number, the parameter
    /// buffer, and the gradient buffer to fill.
    ///
    /// A worker whose blocking wait is cancelled returns `Interrupted` with
    /// its iteration state undefined; it must be dropped, not resumed.
    pub fn step_loop<F>(&mut self, iters: usize, compute: &mut F, cancel: &CancelFlag) -> Result<()>
    where
        F: FnMut(usize, &mut [f32], &mut [f32]),
    {
        if self.state != WorkerState::Initialized {
            return Err(TreeSyncError::Config(format!(
                "worker {} cannot run from state {:?}",
                self.device, self.state
            )));
        }
        self.state = WorkerState::Running;
        let outcome = self.run_iterations(iters, compute, cancel);
        self.state = WorkerState::Stopped;
        outcome
    }

    fn run_iterations<F>(&mut self, iters: usize, compute: &mut F, cancel: &CancelFlag) -> Result<()>
    where
        F: FnMut(usize, &mut [f32], &mut [f32]),
    {
        for _ in 0..iters {
            if cancel.is_set() {
                return Err(TreeSyncError::Interrupted);
            }
            self.on_start(cancel)?;
            {
                let mut data = self.buf.data().lock().unwrap();
                let mut diff = self.buf.diff().lock().unwrap();
                compute(self.iter, data.as_mut_slice(), diff.as_mut_slice());
            }
            self.on_gradients_ready(cancel)?;
            self.iter += 1;
            metrics::global().sync_iterations.inc();
        }
        Ok(())
    }
}

impl IterationHooks for SyncWorker {
    /// Wait for the parent's broadcast (non-root), then push this worker's
    /// parameters down to every child.
    fn on_start(&mut self, cancel: &CancelFlag) -> Result<()> {
        let started = Instant::now();
        if let Some(parent) = &self.parent {
            let token = self.queue.pop(cancel, "waiting for parent broadcast")?;
            if token != parent.device {
                return Err(TreeSyncError::Protocol(format!(
                    "worker {} received broadcast token from device {token}, expected parent {}",
                    self.device, parent.device
                )));
            }
        }
        for child in self.children.iter().rev() {
            {
                let src = self.buf.data().lock().unwrap();
                let mut dst = child.data.lock().unwrap();
                dst.copy_from(&src)?;
                metrics::global().transfer_elements.inc_by(src.len() as f64);
            }
            child.queue.push(self.device);
            debug!(from = self.device, to = child.device, "parameters broadcast");
        }
        metrics::global()
            .broadcast_seconds
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Gather children's gradients, then either forward the sum to the
    /// parent or, at the root, rescale and apply the optimizer update.
    fn on_gradients_ready(&mut self, cancel: &CancelFlag) -> Result<()> {
        let started = Instant::now();
        for _ in 0..self.children.len() {
            let token = self.queue.pop(cancel, "waiting for child gradients")?;
            let child = self
                .children
                .iter()
                .find(|c| c.device == token)
                .ok_or_else(|| {
                    TreeSyncError::Protocol(format!(
                        "worker {} received gradient token from unknown device {token}",
                        self.device
                    ))
                })?;
            let mut diff = self.buf.diff().lock().unwrap();
            let staging = child.staging.lock().unwrap();
            diff.accumulate(&staging)?;
            debug!(from = child.device, to = self.device, "gradients reduced");
        }

        match &self.parent {
            Some(parent) => {
                {
                    let diff = self.buf.diff().lock().unwrap();
                    let mut staging = parent.staging.lock().unwrap();
                    staging.copy_from(&diff)?;
                    metrics::global().transfer_elements.inc_by(diff.len() as f64);
                }
                parent.queue.push(self.device);
            }
            None => {
                // Local passes produce batch-mean gradients; the split batch
                // across workers is compensated here, once, at the root.
                let mut diff = self.buf.diff().lock().unwrap();
                diff.scale(1.0 / self.worker_count as f32);
                let mut data = self.buf.data().lock().unwrap();
                self.stepper
                    .step(self.iter, data.as_mut_slice(), diff.as_slice());
            }
        }
        metrics::global()
            .reduce_seconds
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }
}

/// A full tree of workers over a device set, ready to run.
pub struct SyncGroup {
    workers: Vec<SyncWorker>,
}

impl SyncGroup {
    /// Pair `devices` into a reduction tree and build one worker per device,
    /// wiring parent/child links and allocating each child's staging buffer
    /// on its parent's device. `make_stepper` supplies the local optimizer
    /// handle per device.
    pub fn new<S>(
        devices: &[i32],
        region_sizes: &[usize],
        links: &dyn DeviceLinkInfo,
        make_stepper: S,
    ) -> Result<Self>
    where
        S: Fn(i32) -> Box<dyn LocalStep>,
    {
        let pairs = pair_devices(devices, links)?;
        let worker_count = devices.len();

        let mut slots: Vec<Option<SyncWorker>> = Vec::new();
        slots.resize_with(pairs.len(), || None);
        slots[0] = Some(SyncWorker::new(
            pairs[0].device(),
            region_sizes,
            worker_count,
            make_stepper(pairs[0].device()),
            None,
        ));

        // Pairing order does not guarantee a device's parent pair precedes
        // it, so keep sweeping until every worker resolves.
        for _ in 0..pairs.len() {
            for i in 1..pairs.len() {
                if slots[i].is_some() {
                    continue;
                }
                let parent_pos = slots.iter().position(|slot| {
                    slot.as_ref()
                        .is_some_and(|w| w.device == pairs[i].parent())
                });
                let Some(parent_pos) = parent_pos else {
                    continue;
                };
                let (parent_device, parent_queue) = {
                    let parent = slots[parent_pos].as_ref().unwrap();
                    (parent.device, parent.queue.clone())
                };
                let child = SyncWorker::new(
                    pairs[i].device(),
                    region_sizes,
                    worker_count,
                    make_stepper(pairs[i].device()),
                    Some((parent_device, parent_queue)),
                );
                let link = ChildLink {
                    device: child.device,
                    queue: child.queue.clone(),
                    data: child.buf.data().clone(),
                    staging: child.parent.as_ref().unwrap().staging.clone(),
                };
                slots[parent_pos].as_mut().unwrap().children.push(link);
                slots[i] = Some(child);
            }
        }

        let mut workers = Vec::with_capacity(slots.len());
        for slot in slots {
            workers.push(slot.ok_or_else(|| {
                TreeSyncError::Topology("pairing produced an unreachable device".to_string())
            })?);
        }
        for worker in &mut workers {
            worker.initialize(links);
        }
        Ok(Self { workers })
    }

    /// Workers in pairing order; the root is first.
    pub fn workers(&self) -> &[SyncWorker] {
        &self.workers
    }

    /// Take ownership of the workers for custom driving (tests, embedding in
    /// a larger run loop).
    pub fn into_workers(self) -> Vec<SyncWorker> {
        self.workers
    }

    /// Run `iters` synchronized iterations: non-root workers on background
    /// threads, the root on the calling thread. `make_compute` supplies the
    /// per-device local pass. Returns the root's final parameters.
    pub fn run<F, G>(mut self, iters: usize, make_compute: F) -> Result<Vec<f32>>
    where
        F: Fn(i32) -> G,
        G: FnMut(usize, &mut [f32], &mut [f32]) + Send + 'static,
    {
        context::set_worker_count(self.workers.len());
        context::set_root_worker(true);
        info!(
            workers = self.workers.len(),
            iterations = iters,
            "starting synchronized optimization"
        );

        let mut root = self.workers.remove(0);
        let mut threads = Vec::with_capacity(self.workers.len());
        for mut worker in self.workers.drain(..) {
            let mut thread = WorkerThread::new(format!("sync-{}", worker.device));
            let mut compute = make_compute(worker.device);
            thread.start(move |cancel| {
                context::set_device(worker.device);
                context::set_root_worker(false);
                // Modulate the seed so co-workers never share a stream.
                context::set_seed(context::seed().wrapping_add(worker.device as u64));
                worker.step_loop(iters, &mut compute, &cancel)
            })?;
            threads.push(thread);
        }

        context::set_device(root.device);
        let root_cancel = CancelFlag::new();
        let mut compute = make_compute(root.device);
        let outcome = root.step_loop(iters, &mut compute, &root_cancel);
        for mut thread in threads {
            thread.stop();
        }
        outcome?;

        let data = root.buf.data().lock().unwrap();
        Ok(data.as_slice().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LinkMatrix;

    fn steppers(lr: f32) -> impl Fn(i32) -> Box<dyn LocalStep> {
        move |_| Box::new(Sgd { lr }) as Box<dyn LocalStep>
    }

    #[test]
    fn group_shape_follows_the_pairing() {
        let links = LinkMatrix::new().with_peer(0, 1).with_peer(2, 3);
        let group = SyncGroup::new(&[0, 1, 2, 3], &[4], &links, steppers(1.0)).unwrap();
        let workers = group.workers();
        assert_eq!(workers.len(), 4);
        assert!(workers[0].is_root());
        assert_eq!(workers[0].device(), 0);
        assert_eq!(workers[0].children.len(), 2); // devices 1 and 2
        for w in workers {
            assert_eq!(w.state(), WorkerState::Initialized);
        }
    }

    #[test]
    fn single_worker_steps_without_any_handshake() {
        let group = SyncGroup::new(&[0], &[2], &LinkMatrix::new(), steppers(1.0)).unwrap();
        let params = group
            .run(3, |_| {
                |_iter: usize, _data: &mut [f32], diff: &mut [f32]| {
                    diff.fill(1.0);
                }
            })
            .unwrap();
        // Three SGD steps on a unit gradient, world size 1.
        assert_eq!(params, vec![-3.0, -3.0]);
    }

    #[test]
    fn stopped_worker_cannot_be_resumed() {
        let group = SyncGroup::new(&[0], &[1], &LinkMatrix::new(), steppers(0.1)).unwrap();
        let mut workers = group.into_workers();
        let mut root = workers.pop().unwrap();
        let cancel = CancelFlag::new();
        let mut compute = |_: usize, _: &mut [f32], diff: &mut [f32]| diff.fill(0.0);
        root.step_loop(1, &mut compute, &cancel).unwrap();
        assert_eq!(root.state(), WorkerState::Stopped);
        match root.step_loop(1, &mut compute, &cancel) {
            Err(TreeSyncError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_gradient_token_is_a_protocol_error() {
        let links = LinkMatrix::new();
        let group = SyncGroup::new(&[0, 1], &[1], &links, steppers(0.1)).unwrap();
        let mut workers = group.into_workers();
        let mut root = workers.remove(0);
        root.queue.push(42); // no child has device id 42
        let cancel = CancelFlag::new();
        match root.on_gradients_ready(&cancel) {
            Err(TreeSyncError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}

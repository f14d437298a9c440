//! Device memory regions and peer-link queries.
//!
//! A [`DeviceMem`] is an opaque flat buffer tagged with the device it lives
//! on; everything numerical above this crate treats it as raw storage.
//! Cross-device transfers are plain copies between buffers: the in-process
//! stand-in for peer-to-peer copies, in the same way the simulation backends
//! of the reference stacks model collective transports on the host.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::utils::error::{Result, TreeSyncError};

/// Flat buffer of parameter or gradient elements on one device.
#[derive(Debug)]
pub struct DeviceMem {
    device: i32,
    data: Vec<f32>,
}

impl DeviceMem {
    /// Allocate a zeroed buffer of `len` elements on `device`.
    pub fn alloc(device: i32, len: usize) -> Self {
        Self {
            device,
            data: vec![0.0; len],
        }
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// Overwrite this buffer with the contents of `src` (a device-to-device
    /// copy). Every edge transfer of the sync protocol must succeed, so a
    /// length mismatch is fatal rather than truncated.
    pub fn copy_from(&mut self, src: &DeviceMem) -> Result<()> {
        if src.len() != self.len() {
            return Err(TreeSyncError::Transfer(format!(
                "copy of {} elements from device {} into {}-element buffer on device {}",
                src.len(),
                src.device,
                self.len(),
                self.device
            )));
        }
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    /// Element-wise add `src` into this buffer.
    pub fn accumulate(&mut self, src: &DeviceMem) -> Result<()> {
        if src.len() != self.len() {
            return Err(TreeSyncError::Transfer(format!(
                "accumulate of {} elements from device {} into {}-element buffer on device {}",
                src.len(),
                src.device,
                self.len(),
                self.device
            )));
        }
        for (dst, v) in self.data.iter_mut().zip(&src.data) {
            *dst += v;
        }
        Ok(())
    }
}

/// Shared handle to one device buffer. The mutex encodes the aliasing
/// invariant: a buffer is touched by a foreign thread only at protocol
/// points, where the handshake guarantees the lock is uncontended.
pub type SharedMem = Arc<Mutex<DeviceMem>>;

pub fn share(mem: DeviceMem) -> SharedMem {
    Arc::new(Mutex::new(mem))
}

/// Non-owning alias of a sub-range of a shared buffer.
#[derive(Clone)]
pub struct MemView {
    mem: SharedMem,
    offset: usize,
    len: usize,
}

impl MemView {
    pub fn new(mem: SharedMem, offset: usize, len: usize) -> Result<Self> {
        let total = mem.lock().unwrap().len();
        if offset + len > total {
            return Err(TreeSyncError::Config(format!(
                "view [{offset}, {}) out of bounds for a {total}-element buffer",
                offset + len
            )));
        }
        Ok(Self { mem, offset, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        let guard = self.mem.lock().unwrap();
        f(&guard.as_slice()[self.offset..self.offset + self.len])
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        let mut guard = self.mem.lock().unwrap();
        f(&mut guard.as_mut_slice()[self.offset..self.offset + self.len])
    }
}

/// Platform queries consumed by device pairing and worker initialization.
///
/// Implementations answer from whatever the platform exposes; [`LinkMatrix`]
/// answers from explicit tables so pairing stays unit-testable without
/// hardware.
pub trait DeviceLinkInfo {
    /// Physical grouping (board, NUMA node) of a device; `None` when the
    /// device is not part of any multi-device group.
    fn group_of(&self, device: i32) -> Option<i32>;

    /// Whether `a` can directly read/write `b`'s memory without staging
    /// through the host.
    fn can_access(&self, a: i32, b: i32) -> bool;

    /// Attempt to enable a direct link from `a` to `b`. Returns whether the
    /// link is usable afterwards.
    fn enable_access(&self, a: i32, b: i32) -> bool {
        self.can_access(a, b)
    }
}

/// Explicit link tables. The default has no groups and no peer links, which
/// is also the right answer for a host without direct device interconnect.
#[derive(Debug, Clone, Default)]
pub struct LinkMatrix {
    groups: HashMap<i32, i32>,
    peers: HashSet<(i32, i32)>,
}

impl LinkMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `device` in physical group `group`.
    pub fn with_group(mut self, device: i32, group: i32) -> Self {
        self.groups.insert(device, group);
        self
    }

    /// Declare a symmetric peer-access link between `a` and `b`.
    pub fn with_peer(mut self, a: i32, b: i32) -> Self {
        self.peers.insert((a.min(b), a.max(b)));
        self
    }
}

impl DeviceLinkInfo for LinkMatrix {
    fn group_of(&self, device: i32) -> Option<i32> {
        self.groups.get(&device).copied()
    }

    fn can_access(&self, a: i32, b: i32) -> bool {
        self.peers.contains(&(a.min(b), a.max(b)))
    }
}

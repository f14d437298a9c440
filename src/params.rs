//! Flat per-device parameter and gradient buffers.
//!
//! Learnable regions are stored back to back in one contiguous allocation per
//! device, so a whole model's parameters (or gradients) move in a single
//! transfer. The walk order over the region list is the addressing contract:
//! two buffers built from the same region list are byte-layout compatible,
//! which is what lets one worker copy its flat buffer straight into another
//! worker's.

use crate::device::{share, DeviceMem, MemView, SharedMem};
use crate::utils::error::{Result, TreeSyncError};

/// One learnable region as seen by the execution-graph collaborator. Only
/// sizes matter for layout; the collaborator decides what the values mean.
pub trait LearnableRegion {
    /// Element count of this region.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the region's current values into `dst`.
    fn export(&self, dst: &mut [f32]);

    /// Overwrite the region's values from `src`.
    fn import(&mut self, src: &[f32]);

    /// Re-point the region's data alias at a flat-buffer sub-range.
    fn bind_data(&mut self, view: MemView);

    /// Re-point the region's gradient alias at a flat-buffer sub-range.
    fn bind_diff(&mut self, view: MemView);
}

/// How [`ParamBuffer::apply`] treats each region while walking the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    /// Snapshot current region values into the data buffer.
    CopyIn,
    /// Snapshot the data buffer back into the regions.
    CopyOut,
    /// Alias each region's data into the data buffer.
    BindData,
    /// Alias each region's gradient into the gradient buffer.
    BindDiff,
}

/// Contiguous data + gradient allocation for one device.
pub struct ParamBuffer {
    device: i32,
    len: usize,
    data: SharedMem,
    diff: SharedMem,
}

impl ParamBuffer {
    /// Buffer length needed for regions of the given sizes. At least one
    /// element even for an empty parameter list, so allocation never
    /// degenerates to zero bytes.
    pub fn required_len(sizes: &[usize]) -> usize {
        sizes.iter().sum::<usize>().max(1)
    }

    /// Allocate zeroed data and gradient buffers on `device`.
    pub fn new(device: i32, sizes: &[usize]) -> Self {
        let len = Self::required_len(sizes);
        Self {
            device,
            len,
            data: share(DeviceMem::alloc(device, len)),
            diff: share(DeviceMem::alloc(device, len)),
        }
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &SharedMem {
        &self.data
    }

    pub fn diff(&self) -> &SharedMem {
        &self.diff
    }

    /// Walk `regions` in fixed order, applying `op` at an advancing offset
    /// cursor. The cursor must span the buffer exactly, otherwise the region
    /// list and this buffer were built from different layouts.
    pub fn apply(&self, regions: &mut [Box<dyn LearnableRegion>], op: Apply) -> Result<()> {
        let total: usize = regions.iter().map(|r| r.len()).sum();
        if total.max(1) != self.len {
            return Err(TreeSyncError::Config(format!(
                "parameter regions cover {} elements but the buffer on device {} holds {}",
                total, self.device, self.len
            )));
        }

        let mut offset = 0;
        match op {
            Apply::CopyIn => {
                let mut buf = self.data.lock().unwrap();
                for region in regions.iter() {
                    let n = region.len();
                    region.export(&mut buf.as_mut_slice()[offset..offset + n]);
                    offset += n;
                }
            }
            Apply::CopyOut => {
                let buf = self.data.lock().unwrap();
                for region in regions.iter_mut() {
                    let n = region.len();
                    region.import(&buf.as_slice()[offset..offset + n]);
                    offset += n;
                }
            }
            Apply::BindData => {
                for region in regions.iter_mut() {
                    let n = region.len();
                    region.bind_data(MemView::new(self.data.clone(), offset, n)?);
                    offset += n;
                }
            }
            Apply::BindDiff => {
                for region in regions.iter_mut() {
                    let n = region.len();
                    region.bind_diff(MemView::new(self.diff.clone(), offset, n)?);
                    offset += n;
                }
            }
        }
        debug_assert_eq!(offset, total);
        Ok(())
    }
}

/// Host-memory region implementation used by tests and the demo. Real
/// collaborators implement [`LearnableRegion`] over their own tensors.
pub struct HostRegion {
    values: Vec<f32>,
    data: Option<MemView>,
    diff: Option<MemView>,
}

impl HostRegion {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            data: None,
            diff: None,
        }
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    /// Current values: the bound buffer range when aliased, the local copy
    /// otherwise.
    pub fn snapshot(&self) -> Vec<f32> {
        match &self.data {
            Some(view) => view.read(|s| s.to_vec()),
            None => self.values.clone(),
        }
    }

    pub fn data_view(&self) -> Option<&MemView> {
        self.data.as_ref()
    }

    pub fn diff_view(&self) -> Option<&MemView> {
        self.diff.as_ref()
    }
}

impl LearnableRegion for HostRegion {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn export(&self, dst: &mut [f32]) {
        dst.copy_from_slice(&self.values);
    }

    fn import(&mut self, src: &[f32]) {
        self.values.copy_from_slice(src);
    }

    fn bind_data(&mut self, view: MemView) {
        self.data = Some(view);
    }

    fn bind_diff(&mut self, view: MemView) {
        self.diff = Some(view);
    }
}

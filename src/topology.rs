//! Reduction-tree pairing over a device set.
//!
//! Devices are greedily paired by physical grouping, then by peer access,
//! then sequentially, until a single root remains. The result is a rooted
//! tree along which gradients are reduced and parameters broadcast, giving
//! per-iteration traffic proportional to the tree depth instead of the
//! device count.

use tracing::{debug, info};

use crate::device::DeviceLinkInfo;
use crate::utils::error::{Result, TreeSyncError};

/// One parent→device edge of the reduction tree. The root carries the
/// synthetic parent [`DevicePair::ROOT_PARENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePair {
    parent: i32,
    device: i32,
}

impl DevicePair {
    pub const ROOT_PARENT: i32 = -1;

    pub fn new(parent: i32, device: i32) -> Self {
        Self { parent, device }
    }

    pub fn parent(&self) -> i32 {
        self.parent
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn is_root(&self) -> bool {
        self.parent == Self::ROOT_PARENT
    }
}

/// Rounds needed to reduce `n` nodes to one by pairwise merging.
fn tree_depth(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// One greedy phase: repeatedly scan from the lowest unpaired index and pair
/// it with the first compatible partner, removing the partner from play.
fn pair_phase(
    remaining: &mut Vec<i32>,
    pairs: &mut Vec<DevicePair>,
    phase: &str,
    mut compatible: impl FnMut(i32, i32) -> bool,
) {
    for _ in 0..tree_depth(remaining.len()) {
        let mut i = 0;
        while i < remaining.len() {
            let partner = (i + 1..remaining.len()).find(|&j| compatible(remaining[i], remaining[j]));
            if let Some(j) = partner {
                let pair = DevicePair::new(remaining[i], remaining[j]);
                debug!(phase, parent = pair.parent(), device = pair.device(), "paired devices");
                pairs.push(pair);
                remaining.remove(j);
            }
            i += 1;
        }
    }
    debug!(phase, remaining = ?remaining, "phase complete");
}

/// Pair `devices` into a reduction tree using `links` for affinity data.
///
/// Returns one pair per device: the root pair first, then one parent→device
/// edge per remaining device, in pairing order. Pure over the trait, so callers
/// with real hardware pass a platform-backed [`DeviceLinkInfo`].
pub fn pair_devices(devices: &[i32], links: &dyn DeviceLinkInfo) -> Result<Vec<DevicePair>> {
    if devices.is_empty() {
        return Err(TreeSyncError::Topology(
            "cannot pair an empty device list".to_string(),
        ));
    }

    let mut remaining = devices.to_vec();
    let mut pairs = Vec::with_capacity(devices.len());

    // Phase 1: devices on the same physical board/group.
    pair_phase(&mut remaining, &mut pairs, "group", |a, b| {
        matches!((links.group_of(a), links.group_of(b)), (Some(ga), Some(gb)) if ga == gb)
    });

    // Phase 2: devices with direct peer access.
    pair_phase(&mut remaining, &mut pairs, "peer", |a, b| {
        links.can_access(a, b)
    });

    // Phase 3: whatever is left, sequentially.
    pair_phase(&mut remaining, &mut pairs, "sequential", |_, _| true);

    if remaining.len() != 1 {
        return Err(TreeSyncError::Topology(format!(
            "pairing left {} devices unconnected: {:?}",
            remaining.len(),
            remaining
        )));
    }
    pairs.insert(0, DevicePair::new(DevicePair::ROOT_PARENT, remaining[0]));

    for (i, pair) in pairs.iter().enumerate() {
        if pair.parent() == pair.device() {
            return Err(TreeSyncError::Topology(format!(
                "device {} paired with itself",
                pair.device()
            )));
        }
        for later in &pairs[i + 1..] {
            if pair.device() == later.device() {
                return Err(TreeSyncError::Topology(format!(
                    "device {} appears twice as a pairing target",
                    pair.device()
                )));
            }
        }
    }
    debug_assert_eq!(pairs.len(), devices.len());

    let summary = pairs
        .iter()
        .skip(1)
        .map(|p| format!("{}:{}", p.parent(), p.device()))
        .collect::<Vec<_>>()
        .join(", ");
    info!(root = pairs[0].device(), pairs = %summary, "device tree computed");

    Ok(pairs)
}

//! Seam to the host rendering engine
//!
//! The engine decides what is shown; the host owns GPU resources and draws.
//! Promotion asks the host for a resource, eviction hands it back.

use crate::octree::NodeKey;
use crate::streaming::decode::DecodedBuffers;

/// Host-side resource handle for a promoted node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u64);

pub trait RenderHost {
    /// Upload a node's buffers; called once per promotion
    fn allocate(&mut self, key: NodeKey, buffers: &DecodedBuffers) -> GpuHandle;

    /// Release a resource from [`RenderHost::allocate`]
    fn dispose(&mut self, handle: GpuHandle);
}

/// Host that only counts calls, for headless runs
#[derive(Debug, Default)]
pub struct NullHost {
    next: u64,
    live: usize,
}

impl NullHost {
    /// Resources allocated and not yet disposed
    pub fn live(&self) -> usize {
        self.live
    }
}

impl RenderHost for NullHost {
    fn allocate(&mut self, _key: NodeKey, _buffers: &DecodedBuffers) -> GpuHandle {
        self.next += 1;
        self.live += 1;
        GpuHandle(self.next)
    }

    fn dispose(&mut self, _handle: GpuHandle) {
        self.live = self.live.saturating_sub(1);
    }
}

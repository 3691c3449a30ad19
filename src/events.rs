//! Event bus for decoupled communication
//!
//! The core publishes typed events; presentation layers subscribe and map
//! them to their own strings and widgets. The core never imports anything
//! from a UI layer.

use crate::device::{DeviceUid, Uid};
use crate::node::Node;
use tokio::sync::broadcast;

/// Engine-level events
#[derive(Debug, Clone)]
pub enum Event {
    /// A tree finished loading into the memory index
    TreeLoaded {
        device_uid: DeviceUid,
        node_count: usize,
    },

    /// A node was inserted or updated in the memory index
    NodeUpserted { node: Node },

    /// A node was removed from the memory index
    NodeRemoved { device_uid: DeviceUid, uid: Uid },

    /// A diff run completed
    DiffDone {
        left_device: DeviceUid,
        right_device: DeviceUid,
        left_summary: String,
        right_summary: String,
    },

    /// Incremental progress for a long-running operation
    Progress {
        label: String,
        done: u64,
        total: u64,
    },

    /// The executor was paused or resumed
    OpExecutionStateChanged { enabled: bool },

    /// An error reached the per-op boundary or a component surfaced a fault
    ErrorOccurred {
        context: String,
        message: String,
    },
}

/// Broadcast bus for engine events
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event. Send errors (no receivers) are ignored.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

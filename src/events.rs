// Device Events - hardware event and notification bookkeeping
// Sync events require acknowledgement once serviced; async events do not.
// Notifications arrive either on the IPC side channel (listener thread) or
// by polling the backend, and only flag that events are waiting.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::coords::Dim3;
use crate::transport::{KernelOrigin, KernelType};

/// One hardware event drained from the backend's sync or async queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    KernelReady {
        dev: u32,
        grid_id: u64,
        parent_grid_id: Option<u64>,
        context_id: u64,
        module_id: u64,
        entry_pc: u64,
        grid_dim: Dim3,
        block_dim: Dim3,
        kind: KernelType,
        origin: KernelOrigin,
    },
    KernelFinished {
        dev: u32,
        grid_id: u64,
    },
    ContextCreate {
        dev: u32,
        context_id: u64,
    },
    ContextDestroy {
        dev: u32,
        context_id: u64,
    },
    InternalError {
        code: u32,
    },
    Timeout,
    AttachComplete,
    DetachComplete,
}

/// Message posted by the backend on the notification side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Events are pending for this device.
    Device(u32),
    Timeout,
}

/// Queue shared between the listener thread and the main control loop. The
/// listener only pushes; the main thread drains at wait boundaries.
pub type NotificationQueue = Arc<Mutex<VecDeque<Notification>>>;

pub fn notification_queue() -> NotificationQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Per-session notification state, mutated only by the main thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Notifications {
    /// A notification arrived and has not been consumed by a resume yet.
    pending: bool,
    /// A notification was seen during the current stop analysis.
    received: bool,
    /// The notification rode on a host signal that also carried another stop
    /// reason, so it must not be double-reported.
    aliased: bool,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&mut self) {
        self.pending = true;
        self.received = true;
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn received(&self) -> bool {
        self.received
    }

    pub fn aliased(&self) -> bool {
        self.aliased
    }

    pub fn mark_aliased(&mut self) {
        if self.received {
            self.aliased = true;
        }
    }

    /// Called on resume: whatever was reported has been acted upon.
    pub fn mark_consumed(&mut self) {
        self.pending = false;
        self.received = false;
        self.aliased = false;
    }

    /// Called after one stop analysis completes, keeping `pending` for the
    /// resume decision.
    pub fn reset_received(&mut self) {
        self.received = false;
        self.aliased = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_lifecycle() {
        let mut n = Notifications::new();
        assert!(!n.pending());
        n.record_received();
        assert!(n.pending());
        assert!(n.received());
        n.reset_received();
        assert!(n.pending());
        assert!(!n.received());
        n.mark_consumed();
        assert!(!n.pending());
    }

    #[test]
    fn test_aliasing_requires_received() {
        let mut n = Notifications::new();
        n.mark_aliased();
        assert!(!n.aliased());
        n.record_received();
        n.mark_aliased();
        assert!(n.aliased());
    }

    #[test]
    fn test_queue_push_drain() {
        let q = notification_queue();
        q.lock().push_back(Notification::Device(0));
        q.lock().push_back(Notification::Timeout);
        let drained: Vec<_> = q.lock().drain(..).collect();
        assert_eq!(drained, vec![Notification::Device(0), Notification::Timeout]);
    }
}

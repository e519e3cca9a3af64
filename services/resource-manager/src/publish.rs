//! Delivery of events to allocation owners.

use std::fmt::Debug;
use std::sync::Mutex;

use berth_events::AllocationEvent;
use berth_id::AllocationId;
use tokio::sync::mpsc;
use tracing::warn;

/// Sink for events addressed to allocation owners.
///
/// Publishing never blocks the caller.
pub trait AllocationPublisher: Send + Sync + Debug {
    fn publish(&self, event: AllocationEvent);
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<AllocationEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AllocationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AllocationPublisher for ChannelPublisher {
    fn publish(&self, event: AllocationEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(
                allocation_id = %e.0.allocation_id(),
                event_type = e.0.event_type(),
                "dropping allocation event, no subscriber"
            );
        }
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<AllocationEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AllocationEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<AllocationEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn for_allocation(&self, allocation_id: &AllocationId) -> Vec<AllocationEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.allocation_id() == allocation_id)
            .collect()
    }
}

impl AllocationPublisher for RecordingPublisher {
    fn publish(&self, event: AllocationEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

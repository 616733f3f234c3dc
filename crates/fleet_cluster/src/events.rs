//! Typed cluster events and the per-instance bus that carries them.

use fleet_process::process::{InstanceId, ProcessId};
use tokio::sync::broadcast;

/// Ask `instance_id` to report its running queries for list request `process_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShowProcessListTriggerEvent {
    pub instance_id: InstanceId,
    pub process_id: ProcessId,
}

/// An instance finished its contribution to list request `process_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShowProcessListUnitCompleteEvent {
    pub process_id: ProcessId,
}

/// Ask `instance_id` to cancel its local execution `process_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KillProcessIdEvent {
    pub instance_id: InstanceId,
    pub process_id: ProcessId,
}

/// A kill marker for `process_id` was consumed by its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KillProcessIdUnitCompleteEvent {
    pub process_id: ProcessId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    ShowProcessListTrigger(ShowProcessListTriggerEvent),
    ShowProcessListUnitComplete(ShowProcessListUnitCompleteEvent),
    KillProcessId(KillProcessIdEvent),
    KillProcessIdUnitComplete(KillProcessIdUnitCompleteEvent),
}

impl ClusterEvent {
    pub fn process_id(&self) -> &ProcessId {
        match self {
            ClusterEvent::ShowProcessListTrigger(event) => &event.process_id,
            ClusterEvent::ShowProcessListUnitComplete(event) => &event.process_id,
            ClusterEvent::KillProcessId(event) => &event.process_id,
            ClusterEvent::KillProcessIdUnitComplete(event) => &event.process_id,
        }
    }
}

/// Fan-out bus for one instance. Every subscriber sees every event posted
/// after it subscribed; a slow subscriber loses the oldest events.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Post an event; returns how many subscribers received it.
    pub fn post(&self, event: ClusterEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

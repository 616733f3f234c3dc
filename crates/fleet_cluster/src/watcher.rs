//! Turns coordination-store changes into cluster events.
//!
//! Trigger and kill markers become events when they are added. Their deletion
//! by the addressed instance becomes the matching unit-complete event, which is
//! how a requester on a different instance learns that a contribution landed.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::events::{
    ClusterEvent, EventBus, KillProcessIdEvent, KillProcessIdUnitCompleteEvent,
    ShowProcessListTriggerEvent, ShowProcessListUnitCompleteEvent,
};
use crate::paths::{parse_instance_process, COMPUTE_NODES_ROOT, PROCESS_KILL_ROOT, PROCESS_TRIGGER_ROOT};
use crate::repository::{ChangeKind, CoordinationRepository, DataChangedEvent};

pub fn translate(event: &DataChangedEvent) -> Option<ClusterEvent> {
    if let Some((instance_id, process_id)) = parse_instance_process(PROCESS_TRIGGER_ROOT, &event.key) {
        return match event.kind {
            ChangeKind::Added => Some(ClusterEvent::ShowProcessListTrigger(
                ShowProcessListTriggerEvent {
                    instance_id,
                    process_id,
                },
            )),
            ChangeKind::Deleted => Some(ClusterEvent::ShowProcessListUnitComplete(
                ShowProcessListUnitCompleteEvent { process_id },
            )),
            ChangeKind::Updated => None,
        };
    }
    if let Some((instance_id, process_id)) = parse_instance_process(PROCESS_KILL_ROOT, &event.key) {
        return match event.kind {
            ChangeKind::Added => Some(ClusterEvent::KillProcessId(KillProcessIdEvent {
                instance_id,
                process_id,
            })),
            ChangeKind::Deleted => Some(ClusterEvent::KillProcessIdUnitComplete(
                KillProcessIdUnitCompleteEvent { process_id },
            )),
            ChangeKind::Updated => None,
        };
    }
    None
}

/// Watch the compute-node subtree and post translated events to `bus` until
/// `shutdown` fires or the store closes the stream.
///
/// The watch is registered before this returns, so markers written afterwards
/// are never missed.
pub async fn spawn(
    repository: Arc<dyn CoordinationRepository>,
    bus: EventBus,
    shutdown: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut changes = repository.watch(COMPUTE_NODES_ROOT).await?;
    Ok(tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.next() => change,
            };
            let Some(change) = change else {
                tracing::warn!("coordination watch closed");
                break;
            };
            if let Some(event) = translate(&change) {
                tracing::trace!(key = %change.key, kind = ?change.kind, "posting cluster event");
                bus.post(event);
            }
        }
    }))
}

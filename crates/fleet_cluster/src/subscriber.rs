//! Instance-side handlers for process-list and kill events.

use std::sync::Arc;

use anyhow::Context;
use fleet_process::process::{InstanceId, ProcessRegistry};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::{
    ClusterEvent, EventBus, KillProcessIdEvent, ShowProcessListTriggerEvent,
    ShowProcessListUnitCompleteEvent,
};
use crate::paths::{execution_snapshot_path, process_kill_path, process_trigger_path};
use crate::repository::CoordinationRepository;
use crate::snapshot::ProcessListDocument;

/// Reacts to cluster events on behalf of one instance.
///
/// Trigger and kill events are broadcast; only those addressed to this
/// instance are acted on.
pub struct ProcessListChangedSubscriber {
    instance_id: InstanceId,
    registry: Arc<ProcessRegistry>,
    repository: Arc<dyn CoordinationRepository>,
}

impl ProcessListChangedSubscriber {
    pub fn new(
        instance_id: InstanceId,
        registry: Arc<ProcessRegistry>,
        repository: Arc<dyn CoordinationRepository>,
    ) -> Self {
        Self {
            instance_id,
            registry,
            repository,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Persist this instance's snapshot for the request, then consume the trigger.
    ///
    /// The snapshot covers every locally registered context; the request's own
    /// id only names where the snapshot goes. A trigger the requester already
    /// withdrew is skipped, and a snapshot written while it was being withdrawn
    /// is removed again.
    pub async fn trigger_show_process_list(
        &self,
        event: &ShowProcessListTriggerEvent,
    ) -> anyhow::Result<()> {
        if event.instance_id != self.instance_id {
            return Ok(());
        }
        let marker = process_trigger_path(&self.instance_id, &event.process_id);
        if !self.trigger_pending(&marker).await? {
            tracing::debug!(process_id = %event.process_id, "trigger withdrawn before reporting");
            return Ok(());
        }
        let contexts = self.registry.contexts();
        let document = ProcessListDocument::from_contexts(contexts.iter().map(Arc::as_ref));
        let body = document.encode().context("encode process list snapshot")?;
        let path = execution_snapshot_path(&event.process_id, &self.instance_id);
        self.repository
            .persist(&path, &body)
            .await
            .with_context(|| format!("persist process list snapshot at {path}"))?;
        if !self.trigger_pending(&marker).await? {
            self.repository
                .delete(&path)
                .await
                .with_context(|| format!("delete late process list snapshot {path}"))?;
            tracing::debug!(process_id = %event.process_id, "requester gave up; snapshot dropped");
            return Ok(());
        }
        self.repository
            .delete(&marker)
            .await
            .with_context(|| format!("delete trigger marker {marker}"))?;
        tracing::debug!(
            process_id = %event.process_id,
            rows = document.contexts.len(),
            "reported process list"
        );
        Ok(())
    }

    async fn trigger_pending(&self, marker: &str) -> anyhow::Result<bool> {
        let pending = self
            .repository
            .get(marker)
            .await
            .with_context(|| format!("read trigger marker {marker}"))?;
        Ok(pending.is_some())
    }

    /// Wake the requester waiting on `event.process_id`, if it is on this instance.
    pub fn complete_unit_show_process_list(&self, event: &ShowProcessListUnitCompleteEvent) {
        if let Some(lock) = self.registry.get_lock(&event.process_id) {
            lock.do_complete();
        }
    }

    /// Cancel the matching local execution, if any, then consume the kill marker.
    pub async fn kill_process_id(&self, event: &KillProcessIdEvent) -> anyhow::Result<()> {
        if event.instance_id != self.instance_id {
            return Ok(());
        }
        match self.registry.get(&event.process_id) {
            Some(context) => {
                context.cancel();
                tracing::info!(process_id = %event.process_id, "killed process");
            }
            None => {
                tracing::debug!(process_id = %event.process_id, "kill for unknown process ignored");
            }
        }
        let marker = process_kill_path(&self.instance_id, &event.process_id);
        self.repository
            .delete(&marker)
            .await
            .with_context(|| format!("delete kill marker {marker}"))
    }

    pub async fn handle(&self, event: &ClusterEvent) -> anyhow::Result<()> {
        match event {
            ClusterEvent::ShowProcessListTrigger(event) => self.trigger_show_process_list(event).await,
            ClusterEvent::ShowProcessListUnitComplete(event) => {
                self.complete_unit_show_process_list(event);
                Ok(())
            }
            ClusterEvent::KillProcessId(event) => self.kill_process_id(event).await,
            ClusterEvent::KillProcessIdUnitComplete(event) => {
                tracing::trace!(process_id = %event.process_id, "kill marker consumed");
                Ok(())
            }
        }
    }

    /// Consume events from `bus` until `shutdown` fires.
    ///
    /// Subscribes before returning, so events posted after this call are seen.
    pub fn spawn(
        self: Arc<Self>,
        bus: &EventBus,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) => {
                        if let Err(err) = self.handle(&event).await {
                            tracing::warn!(
                                error = ?err,
                                process_id = %event.process_id(),
                                "process list event handling failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "process list subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

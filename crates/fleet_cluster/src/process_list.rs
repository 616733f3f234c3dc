//! Requester side of cluster-wide SHOW PROCESSLIST and KILL.
//!
//! A list request writes one trigger marker per online instance and waits on
//! its `ShowProcessListLock` until every marker has been consumed or the
//! deadline passes. Whatever snapshots arrived by then form the answer; the
//! instances that stayed silent are reported, not treated as an error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_process::process::{InstanceId, ProcessId, ProcessRegistry, ShowProcessListLock};
use serde::Serialize;

use crate::instance::load_online_instance_ids;
use crate::paths::{execution_process_path, process_kill_path, process_trigger_path};
use crate::repository::{read_children, CoordinationRepository};
use crate::snapshot::{ProcessListDocument, ProcessListRow};

/// One running query and the instance it runs on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceProcessRow {
    pub instance_id: InstanceId,
    #[serde(flatten)]
    pub row: ProcessListRow,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessListReport {
    /// Id of the list request itself.
    pub process_id: Option<ProcessId>,
    pub rows: Vec<InstanceProcessRow>,
    /// Online instances whose snapshot did not arrive before the deadline.
    pub missing_instances: Vec<InstanceId>,
}

impl ProcessListReport {
    pub fn is_complete(&self) -> bool {
        self.missing_instances.is_empty()
    }
}

#[derive(Clone)]
pub struct ProcessListService {
    registry: Arc<ProcessRegistry>,
    repository: Arc<dyn CoordinationRepository>,
}

impl ProcessListService {
    pub fn new(registry: Arc<ProcessRegistry>, repository: Arc<dyn CoordinationRepository>) -> Self {
        Self {
            registry,
            repository,
        }
    }

    /// Overall bound on one list request; the registry's lock timeout.
    pub fn deadline(&self) -> Duration {
        self.registry.lock_timeout()
    }

    pub async fn show_process_list(&self) -> anyhow::Result<ProcessListReport> {
        let online = load_online_instance_ids(self.repository.as_ref()).await?;
        if online.is_empty() {
            return Ok(ProcessListReport::default());
        }

        let process_id = ProcessId::generate();
        let markers = online
            .iter()
            .map(|instance_id| process_trigger_path(instance_id, &process_id))
            .collect::<Vec<_>>();
        let lock = self.registry.get_or_create_lock(&process_id);
        let waited = self.trigger_and_wait(&markers, &lock).await;
        self.registry.remove_lock(&process_id);
        if !waited? {
            self.withdraw_triggers(&markers).await?;
        }

        let report = self.collect(&process_id, &online).await?;
        if !report.is_complete() {
            tracing::warn!(
                process_id = %process_id,
                missing = ?report.missing_instances,
                "process list incomplete at deadline"
            );
        }
        Ok(report)
    }

    /// Write every trigger marker and wait for them to be consumed. Returns
    /// `false` if the deadline passed with markers still outstanding.
    async fn trigger_and_wait(
        &self,
        markers: &[String],
        lock: &ShowProcessListLock,
    ) -> anyhow::Result<bool> {
        for marker in markers {
            self.repository
                .persist(marker, "")
                .await
                .with_context(|| format!("write trigger marker {marker}"))?;
        }

        let deadline = tokio::time::Instant::now() + self.deadline();
        loop {
            if !self.any_marker_left(markers).await? {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, lock.await_default_time())
                .await
                .is_err()
            {
                return Ok(false);
            }
        }
    }

    /// Remove the markers silent instances never consumed. Runs before the
    /// snapshots are collected so a late responder either sees its trigger
    /// gone or has its snapshot swept up with the rest.
    async fn withdraw_triggers(&self, markers: &[String]) -> anyhow::Result<()> {
        for marker in markers {
            self.repository
                .delete(marker)
                .await
                .with_context(|| format!("withdraw trigger marker {marker}"))?;
        }
        Ok(())
    }

    async fn any_marker_left(&self, markers: &[String]) -> anyhow::Result<bool> {
        for marker in markers {
            if self
                .repository
                .get(marker)
                .await
                .with_context(|| format!("read trigger marker {marker}"))?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn collect(
        &self,
        process_id: &ProcessId,
        online: &[InstanceId],
    ) -> anyhow::Result<ProcessListReport> {
        let root = execution_process_path(process_id);
        let documents = read_children(self.repository.as_ref(), &root).await?;
        self.repository
            .delete(&root)
            .await
            .with_context(|| format!("delete {root}"))?;

        let mut reported = BTreeSet::new();
        let mut rows = Vec::new();
        for (instance, raw) in documents {
            let instance_id = InstanceId::new(instance);
            match ProcessListDocument::decode(&raw) {
                Ok(document) => {
                    rows.extend(document.contexts.into_iter().map(|row| InstanceProcessRow {
                        instance_id: instance_id.clone(),
                        row,
                    }));
                    reported.insert(instance_id);
                }
                Err(err) => {
                    tracing::warn!(error = ?err, instance_id = %instance_id, "unreadable process list snapshot");
                }
            }
        }
        rows.sort_by(|a, b| {
            a.instance_id
                .cmp(&b.instance_id)
                .then(a.row.start_time_millis.cmp(&b.row.start_time_millis))
                .then_with(|| a.row.id.cmp(&b.row.id))
        });
        let missing_instances = online
            .iter()
            .filter(|instance_id| !reported.contains(*instance_id))
            .cloned()
            .collect();
        Ok(ProcessListReport {
            process_id: Some(process_id.clone()),
            rows,
            missing_instances,
        })
    }

    /// Ask every online instance to kill `process_id`. Fire-and-forget: returns
    /// the addressed instances once the markers are written.
    pub async fn kill_process(&self, process_id: &ProcessId) -> anyhow::Result<Vec<InstanceId>> {
        let online = load_online_instance_ids(self.repository.as_ref()).await?;
        for instance_id in &online {
            self.kill_process_on(instance_id, process_id).await?;
        }
        Ok(online)
    }

    pub async fn kill_process_on(
        &self,
        instance_id: &InstanceId,
        process_id: &ProcessId,
    ) -> anyhow::Result<()> {
        let marker = process_kill_path(instance_id, process_id);
        self.repository
            .persist(&marker, "")
            .await
            .with_context(|| format!("write kill marker {marker}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::repository::MemoryRepository;

    fn service(timeout_ms: u64) -> (Arc<MemoryRepository>, ProcessListService) {
        let repo = Arc::new(MemoryRepository::new());
        let registry = Arc::new(ProcessRegistry::with_lock_timeout(Duration::from_millis(
            timeout_ms,
        )));
        (repo.clone(), ProcessListService::new(registry, repo))
    }

    #[tokio::test]
    async fn no_online_instances_yields_empty_report() {
        let (repo, service) = service(50);
        let report = service.show_process_list().await.unwrap();
        assert!(report.rows.is_empty());
        assert!(report.is_complete());
        assert!(report.process_id.is_none());
        assert!(repo.keys().is_empty());
    }

    #[tokio::test]
    async fn silent_instance_is_reported_missing_after_deadline() {
        let (repo, service) = service(150);
        repo.persist("/nodes/compute_nodes/online/proxy/ghost", "{}")
            .await
            .unwrap();
        let start = Instant::now();
        let report = service.show_process_list().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(report.missing_instances, vec![InstanceId::from("ghost")]);
        assert!(report.rows.is_empty());
        assert!(service.registry.get_lock(report.process_id.as_ref().unwrap()).is_none());
        assert_eq!(
            repo.keys(),
            vec!["/nodes/compute_nodes/online/proxy/ghost".to_string()]
        );
    }

    #[tokio::test]
    async fn repeated_partial_lists_leave_no_markers_behind() {
        let (repo, service) = service(50);
        repo.persist("/nodes/compute_nodes/online/proxy/slow", "{}")
            .await
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let report = service.show_process_list().await.unwrap();
            assert_eq!(report.missing_instances, vec![InstanceId::from("slow")]);
            ids.push(report.process_id.unwrap());
        }
        assert!(repo
            .keys()
            .iter()
            .all(|key| !key.starts_with("/nodes/compute_nodes/process_trigger")
                && !key.starts_with("/execution_nodes")));

        // The slow instance finally answers the last request.
        let late = crate::subscriber::ProcessListChangedSubscriber::new(
            InstanceId::from("slow"),
            Arc::new(ProcessRegistry::new()),
            repo.clone(),
        );
        late.trigger_show_process_list(&crate::events::ShowProcessListTriggerEvent {
            instance_id: InstanceId::from("slow"),
            process_id: ids.pop().unwrap(),
        })
        .await
        .unwrap();
        assert_eq!(
            repo.keys(),
            vec!["/nodes/compute_nodes/online/proxy/slow".to_string()]
        );
    }

    #[tokio::test]
    async fn kill_addresses_every_online_instance() {
        let (repo, service) = service(50);
        for id in ["a", "b"] {
            repo.persist(&format!("/nodes/compute_nodes/online/proxy/{id}"), "{}")
                .await
                .unwrap();
        }
        let addressed = service.kill_process(&ProcessId::from("p")).await.unwrap();
        assert_eq!(addressed, vec![InstanceId::from("a"), InstanceId::from("b")]);
        assert!(repo.contains("/nodes/compute_nodes/process_kill/a:p"));
        assert!(repo.contains("/nodes/compute_nodes/process_kill/b:p"));
    }

    #[tokio::test]
    async fn marker_write_failure_is_surfaced() {
        let (repo, service) = service(50);
        repo.persist("/nodes/compute_nodes/online/proxy/a", "{}")
            .await
            .unwrap();
        repo.set_fail_writes(true);
        let err = service.show_process_list().await.unwrap_err();
        assert!(format!("{err:#}").contains("trigger marker"));
        assert!(service.kill_process_on(&InstanceId::from("a"), &ProcessId::from("p")).await.is_err());
    }
}

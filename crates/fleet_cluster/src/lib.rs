//! Cluster-wide process listing and kill for a fleet of proxy instances.
//!
//! Instances share nothing but a watchable coordination store. Each one runs a
//! watcher that turns marker keys into events on its own bus and a subscriber
//! that answers them from the local `ProcessRegistry`. `start_instance` wires
//! those pieces together for one instance.

pub mod config;
pub mod events;
pub mod instance;
pub mod paths;
pub mod process_list;
pub mod repository;
pub mod snapshot;
pub mod subscriber;
pub mod watcher;

use std::sync::Arc;

use anyhow::Context;
use fleet_process::process::{
    DialectStatementFilter, InstanceId, ProcessCleaners, ProcessEngine, ProcessRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::config::InstanceConfig;
use crate::events::EventBus;
use crate::instance::{register_online, unregister_online, InstanceMetaData};
use crate::process_list::ProcessListService;
use crate::repository::CoordinationRepository;
use crate::subscriber::ProcessListChangedSubscriber;

/// A running instance: its local tracking state plus the background tasks
/// that keep it connected to the cluster.
pub struct InstanceHandle {
    meta: InstanceMetaData,
    engine: Arc<ProcessEngine>,
    process_list: ProcessListService,
    bus: EventBus,
    repository: Arc<dyn CoordinationRepository>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl InstanceHandle {
    pub fn instance_id(&self) -> &InstanceId {
        &self.meta.id
    }

    pub fn meta(&self) -> &InstanceMetaData {
        &self.meta
    }

    pub fn engine(&self) -> &Arc<ProcessEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        self.engine.registry()
    }

    pub fn process_list(&self) -> &ProcessListService {
        &self.process_list
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Go offline, stop the background tasks and wait for them to exit.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let unregistered = unregister_online(self.repository.as_ref(), &self.meta.id).await;
        self.shutdown.cancel();
        let joined = futures_util::future::join_all(self.tasks.drain(..)).await;
        let mut failed = None;
        for err in joined.into_iter().filter_map(Result::err) {
            tracing::warn!(instance_id = %self.meta.id, error = %err, "instance task join failed");
            failed.get_or_insert(err);
        }
        tracing::info!(instance_id = %self.meta.id, "instance stopped");
        unregistered?;
        match failed {
            Some(err) => Err(anyhow::anyhow!("instance task join failed: {err}")),
            None => Ok(()),
        }
    }

    /// Stop the background tasks without going offline, as a crashed instance would.
    pub fn abort(&self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Build the local tracking stack for `config` and join the cluster.
///
/// The watcher and subscriber are live before the instance registers online,
/// so no trigger addressed to it can be missed.
pub async fn start_instance(
    config: InstanceConfig,
    repository: Arc<dyn CoordinationRepository>,
) -> anyhow::Result<InstanceHandle> {
    let registry = Arc::new(ProcessRegistry::with_lock_timeout(
        config.show_process_list_timeout,
    ));
    let cleaners = ProcessCleaners::from_names(&config.process_cleaners)
        .context("FLEET_PROCESS_CLEANERS")?;
    let engine = Arc::new(
        ProcessEngine::new(registry.clone())
            .with_filter(Arc::new(DialectStatementFilter::new(
                config.tracked_dialects.clone(),
            )))
            .with_cleaners(cleaners),
    );

    let bus = EventBus::new(config.event_bus_capacity);
    let shutdown = CancellationToken::new();
    let subscriber = Arc::new(ProcessListChangedSubscriber::new(
        config.instance_id.clone(),
        registry.clone(),
        repository.clone(),
    ));
    let mut tasks = vec![subscriber.spawn(&bus, shutdown.clone())];
    match watcher::spawn(repository.clone(), bus.clone(), shutdown.clone()).await {
        Ok(task) => tasks.push(task),
        Err(err) => {
            shutdown.cancel();
            return Err(err.context("watch coordination store"));
        }
    }

    let meta = InstanceMetaData::new(config.instance_id.clone(), config.host.clone(), config.port);
    if let Err(err) = register_online(repository.as_ref(), &meta).await {
        shutdown.cancel();
        return Err(err);
    }
    tracing::info!(
        instance_id = %meta.id,
        host = %meta.host,
        port = meta.port,
        timeout = ?config.show_process_list_timeout,
        "instance online"
    );

    Ok(InstanceHandle {
        meta,
        engine,
        process_list: ProcessListService::new(registry, repository.clone()),
        bus,
        repository,
        shutdown,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::repository::MemoryRepository;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_every_task_before_reporting_failure() {
        let repo = Arc::new(MemoryRepository::new());
        let config = InstanceConfig {
            instance_id: InstanceId::from("proxy-0"),
            ..InstanceConfig::default()
        };
        let mut handle = start_instance(config, repo.clone()).await.unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        handle.tasks.insert(0, tokio::spawn(async { panic!("subscriber crashed") }));
        handle.tasks.push(tokio::spawn({
            let shutdown = handle.shutdown.clone();
            let finished = finished.clone();
            async move {
                shutdown.cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, Ordering::SeqCst);
            }
        }));

        let err = handle.shutdown().await.unwrap_err();
        assert!(format!("{err:#}").contains("join failed"));
        assert!(finished.load(Ordering::SeqCst));
        assert!(!repo.contains("/nodes/compute_nodes/online/proxy/proxy-0"));
    }
}

//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_cluster::config::InstanceConfig;
use fleet_cluster::repository::{CoordinationRepository, MemoryRepository};
use fleet_cluster::{start_instance, InstanceHandle};
use fleet_process::process::{
    ExecutionGroup, ExecutionGroupContext, ExecutionGroupReportContext, ExecutionUnit, Grantee,
    InstanceId, ProcessId, QueryContext, StatementKind,
};

/// Upper bound for anything that should happen "promptly".
pub const EVENTUALLY: Duration = Duration::from_secs(3);

pub fn instance_config(id: &str, timeout: Duration) -> InstanceConfig {
    InstanceConfig {
        instance_id: InstanceId::from(id),
        port: 3307,
        show_process_list_timeout: timeout,
        ..InstanceConfig::default()
    }
}

/// Start `count` instances named `proxy-0..` against one shared store.
pub async fn start_fleet(
    count: usize,
    timeout: Duration,
) -> (Arc<MemoryRepository>, Vec<InstanceHandle>) {
    let repo = Arc::new(MemoryRepository::new());
    let mut handles = Vec::with_capacity(count);
    for idx in 0..count {
        let store: Arc<dyn CoordinationRepository> = repo.clone();
        let handle = start_instance(instance_config(&format!("proxy-{idx}"), timeout), store)
            .await
            .expect("start instance");
        handles.push(handle);
    }
    (repo, handles)
}

pub async fn stop_fleet(handles: Vec<InstanceHandle>) {
    for handle in handles {
        handle.shutdown().await.expect("shutdown instance");
    }
}

/// Execution context for a DML statement routed to `units` data sources.
pub fn execution(process_id: &ProcessId, units: usize) -> ExecutionGroupContext {
    let units = (0..units)
        .map(|idx| ExecutionUnit {
            data_source_name: format!("ds_{idx}"),
            sql: format!("UPDATE t_order_{idx} SET status = 'done'"),
        })
        .collect();
    ExecutionGroupContext::new(
        vec![ExecutionGroup { units }],
        ExecutionGroupReportContext::with_process_id(
            process_id.clone(),
            "sharding_db",
            Some(Grantee::new("root", "127.0.0.1")),
        ),
    )
}

pub fn update() -> QueryContext {
    QueryContext::new("UPDATE t_order SET status = 'done'", StatementKind::Dml, "MySQL")
}

/// Poll `check` until it holds or `EVENTUALLY` elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + EVENTUALLY;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn keys_under(repo: &MemoryRepository, prefix: &str) -> Vec<String> {
    repo.keys()
        .into_iter()
        .filter(|key| key.starts_with(prefix))
        .collect()
}

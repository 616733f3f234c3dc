//! Cluster-wide process listing across in-process instances sharing one store.

mod common;

use std::time::{Duration, Instant};

use common::{execution, keys_under, start_fleet, stop_fleet, update};
use fleet_cluster::instance::{register_online, InstanceMetaData};
use fleet_process::process::{Grantee, InstanceId, ProcessId, ProcessIdContext};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_aggregates_every_instance() {
    let (repo, fleet) = start_fleet(3, Duration::from_secs(5)).await;

    let session = fleet[1]
        .engine()
        .connect(Some(Grantee::new("app", "10.0.0.9")), "sharding_db");

    let running = ProcessId::from("running_update");
    let engine = fleet[0].engine().clone();
    let statement = running.clone();
    ProcessIdContext::scope(async move {
        assert!(engine.execute_sql(&execution(&statement, 4), &update()));
        engine.complete_sql_unit_execution();
    })
    .await;

    let start = Instant::now();
    let report = fleet[2].process_list().show_process_list().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(2), "listing waited for the deadline");
    assert!(report.is_complete(), "missing: {:?}", report.missing_instances);
    assert_eq!(report.rows.len(), 2);

    let update_row = report
        .rows
        .iter()
        .find(|row| row.row.id.as_deref() == Some("running_update"))
        .expect("running statement listed");
    assert_eq!(update_row.instance_id, InstanceId::from("proxy-0"));
    assert_eq!(update_row.row.total_unit_count, 4);
    assert_eq!(update_row.row.completed_unit_count, 1);
    assert!(!update_row.row.idle);
    assert_eq!(update_row.row.database_name.as_deref(), Some("sharding_db"));

    let session_row = report
        .rows
        .iter()
        .find(|row| row.row.id.as_deref() == Some(session.as_str()))
        .expect("idle session listed");
    assert_eq!(session_row.instance_id, InstanceId::from("proxy-1"));
    assert!(session_row.row.idle);
    assert_eq!(session_row.row.username.as_deref(), Some("app"));

    assert!(keys_under(&repo, "/execution_nodes").is_empty());
    assert!(keys_under(&repo, "/nodes/compute_nodes/process_trigger").is_empty());
    assert!(fleet[2]
        .registry()
        .get_lock(report.process_id.as_ref().unwrap())
        .is_none());

    stop_fleet(fleet).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_instance_yields_partial_result() {
    let timeout = Duration::from_millis(300);
    let (repo, fleet) = start_fleet(2, timeout).await;
    register_online(
        repo.as_ref(),
        &InstanceMetaData::new(InstanceId::from("proxy-ghost"), "10.0.0.99", 3307),
    )
    .await
    .unwrap();
    fleet[0].engine().connect(None, "sharding_db");

    let start = Instant::now();
    let report = fleet[1].process_list().show_process_list().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout, "returned before deadline: {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_secs(2), "overran deadline: {elapsed:?}");

    assert_eq!(report.missing_instances, vec![InstanceId::from("proxy-ghost")]);
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].instance_id, InstanceId::from("proxy-0"));
    assert!(keys_under(&repo, "/nodes/compute_nodes/process_trigger").is_empty());
    assert!(keys_under(&repo, "/execution_nodes").is_empty());

    stop_fleet(fleet).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_statement_shows_as_idle_session() {
    let (_repo, fleet) = start_fleet(1, Duration::from_secs(5)).await;
    let engine = fleet[0].engine().clone();
    let session = engine.connect(None, "sharding_db");
    let statement = session.clone();
    ProcessIdContext::scope(async move {
        assert!(engine.execute_sql(&execution(&statement, 2), &update()));
        engine.complete_sql_unit_execution();
        engine.complete_sql_unit_execution();
        engine.complete_sql_execution();
    })
    .await;

    let report = fleet[0].process_list().show_process_list().await.unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].row.id.as_deref(), Some(session.as_str()));
    assert!(report.rows[0].row.idle);
    assert_eq!(report.rows[0].row.completed_unit_count, 2);

    fleet[0].engine().disconnect(&session);
    let report = fleet[0].process_list().show_process_list().await.unwrap();
    assert!(report.rows.is_empty());

    stop_fleet(fleet).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_takes_instance_offline() {
    let (repo, mut fleet) = start_fleet(2, Duration::from_millis(200)).await;
    let leaving = fleet.remove(1);
    leaving.shutdown().await.unwrap();
    assert_eq!(
        keys_under(&repo, "/nodes/compute_nodes/online/proxy"),
        vec!["/nodes/compute_nodes/online/proxy/proxy-0".to_string()]
    );

    let start = Instant::now();
    let report = fleet[0].process_list().show_process_list().await.unwrap();
    assert!(report.is_complete());
    assert!(start.elapsed() < Duration::from_millis(200));

    stop_fleet(fleet).await;
}

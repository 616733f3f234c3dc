//! Workload generator for exercising cluster-wide process listing and kill.
//!
//! This binary starts an in-process fleet of instances sharing one in-memory
//! coordination store, runs tracked and untracked statements on every
//! instance, periodically lists processes and kills some of them from random
//! instances, and records a JSON history of everything it observed.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_cluster::config::InstanceConfig;
use fleet_cluster::repository::{CoordinationRepository, MemoryRepository};
use fleet_cluster::{start_instance, InstanceHandle};
use fleet_process::process::{
    ExecutionGroup, ExecutionGroupContext, ExecutionGroupReportContext, ExecutionUnit, Grantee,
    InstanceId, ProcessEngine, ProcessId, ProcessIdContext, QueryContext, StatementKind,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "fleet-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of proxy instances in the fleet.
    #[arg(long, default_value_t = 3)]
    instances: usize,

    /// Number of concurrent client sessions, spread round-robin over instances.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Execution units per tracked statement.
    #[arg(long, default_value_t = 4)]
    units: usize,

    /// Upper bound on how long one execution unit runs.
    #[arg(long, default_value = "50ms")]
    unit_delay: humantime::Duration,

    /// Percent of statements that are not tracked (SHOW-style statements).
    #[arg(long, default_value_t = 20)]
    untracked_pct: u8,

    /// Interval between cluster-wide process listings.
    #[arg(long, default_value = "500ms")]
    list_interval: humantime::Duration,

    /// Percent of listings followed by a kill of one running statement.
    #[arg(long, default_value_t = 10)]
    kill_pct: u8,

    /// Bound on how long a listing waits for instances to report.
    #[arg(long, default_value = "2s")]
    list_timeout: humantime::Duration,

    /// Cleanup extensions enabled on every instance.
    #[arg(long, default_value = "idle-session,progress-log")]
    cleaners: String,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write a JSON history to this path.
    #[arg(long, default_value = ".tmp/fleet/history.json")]
    out: PathBuf,
}

/// Metadata embedded in the history file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct HistoryMeta {
    instances: usize,
    clients: usize,
    units: usize,
    unit_delay_ms: u64,
    untracked_pct: u8,
    list_interval_ms: u64,
    kill_pct: u8,
    list_timeout_ms: u64,
    cleaners: Vec<String>,
    duration_ms: u64,
    seed: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct History {
    meta: HistoryMeta,
    statements: Vec<StatementRecord>,
    listings: Vec<ListingRecord>,
    kills: Vec<KillRecord>,
}

/// One statement issued by a client session.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct StatementRecord {
    client: usize,
    instance: String,
    process_id: String,
    tracked: bool,
    units: usize,
    completed_units: usize,
    killed: bool,
    call_us: u64,
    return_us: u64,
}

/// One cluster-wide listing as seen by the requesting instance.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ListingRecord {
    requester: String,
    call_us: u64,
    return_us: u64,
    running: usize,
    idle: usize,
    missing_instances: Vec<String>,
    error: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct KillRecord {
    requester: String,
    target_instance: String,
    process_id: String,
    call_us: u64,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_cluster=info,fleet_process=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => {
            let history = run(args.clone()).await?;
            eprintln!(
                "wrote history: {} ({} statements, {} listings, {} kills)",
                args.out.display(),
                history.statements.len(),
                history.listings.len(),
                history.kills.len()
            );
            Ok(())
        }
    }
}

/// Run the workload and write the history file.
async fn run(args: RunArgs) -> anyhow::Result<History> {
    anyhow::ensure!(args.instances > 0, "--instances must be > 0");
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.units > 0, "--units must be > 0");
    anyhow::ensure!(args.untracked_pct <= 100, "--untracked-pct must be <= 100");
    anyhow::ensure!(args.kill_pct <= 100, "--kill-pct must be <= 100");
    let list_timeout: Duration = args.list_timeout.into();
    anyhow::ensure!(!list_timeout.is_zero(), "--list-timeout must be > 0");

    let duration: Duration = args.duration.into();
    let cleaners = args
        .cleaners
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let repository: Arc<dyn CoordinationRepository> = Arc::new(MemoryRepository::new());
    let mut fleet = Vec::with_capacity(args.instances);
    for idx in 0..args.instances {
        let config = InstanceConfig {
            instance_id: InstanceId::new(format!("proxy-{idx}")),
            port: 3307 + idx as u16,
            show_process_list_timeout: list_timeout,
            process_cleaners: cleaners.clone(),
            ..InstanceConfig::default()
        };
        fleet.push(Arc::new(
            start_instance(config, repository.clone())
                .await
                .with_context(|| format!("start instance proxy-{idx}"))?,
        ));
    }

    let start = time::Instant::now();
    let deadline = start + duration;

    let mut clients = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let instance = fleet[client_id % fleet.len()].clone();
        let plan = ClientPlan {
            client_id,
            units: args.units,
            unit_delay: args.unit_delay.into(),
            untracked_pct: args.untracked_pct,
            // Mix the base seed with the client id for deterministic per-client RNG.
            seed: seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15),
        };
        clients.push(tokio::spawn(run_client(instance, plan, start, deadline)));
    }

    let stop_monitor = CancellationToken::new();
    let monitor = tokio::spawn(run_monitor(
        fleet.clone(),
        args.list_interval.into(),
        args.kill_pct,
        seed.rotate_left(17),
        start,
        stop_monitor.clone(),
    ));

    let mut statements = Vec::new();
    for client in clients {
        statements.append(&mut client.await.context("client task panicked")?);
    }
    stop_monitor.cancel();
    let (listings, kills) = monitor.await.context("monitor task panicked")?;

    for instance in fleet {
        let instance = Arc::try_unwrap(instance)
            .map_err(|_| anyhow::anyhow!("instance handle still shared at shutdown"))?;
        instance.shutdown().await?;
    }

    statements.sort_by_key(|stmt| (stmt.call_us, stmt.client));
    let history = History {
        meta: HistoryMeta {
            instances: args.instances,
            clients: args.clients,
            units: args.units,
            unit_delay_ms: Duration::from(args.unit_delay).as_millis() as u64,
            untracked_pct: args.untracked_pct,
            list_interval_ms: Duration::from(args.list_interval).as_millis() as u64,
            kill_pct: args.kill_pct,
            list_timeout_ms: list_timeout.as_millis() as u64,
            cleaners,
            duration_ms: duration.as_millis() as u64,
            seed,
        },
        statements,
        listings,
        kills,
    };
    write_history(&args.out, &history).context("write history")?;
    Ok(history)
}

#[derive(Clone, Copy, Debug)]
struct ClientPlan {
    client_id: usize,
    units: usize,
    unit_delay: Duration,
    untracked_pct: u8,
    seed: u64,
}

/// One client session: connect, issue statements until the deadline, disconnect.
async fn run_client(
    instance: Arc<InstanceHandle>,
    plan: ClientPlan,
    start: time::Instant,
    deadline: time::Instant,
) -> Vec<StatementRecord> {
    let mut rng = SmallRng::seed_from_u64(plan.seed);
    let engine = instance.engine().clone();
    let session = engine.connect(
        Some(Grantee::new(format!("client{}", plan.client_id), "127.0.0.1")),
        "sharding_db",
    );
    let mut records = Vec::new();
    let mut seq = 0u64;
    while time::Instant::now() < deadline {
        seq += 1;
        let tracked = rng.gen_range(0..100) >= plan.untracked_pct as u32;
        let query = if tracked {
            QueryContext::new(
                format!("UPDATE t_order SET status = {seq} WHERE user_id = {}", plan.client_id),
                StatementKind::Dml,
                "MySQL",
            )
        } else {
            QueryContext::new("SHOW TABLES", StatementKind::Dal, "MySQL")
        };
        let execution = execution_for(&session, &query, plan.units);
        let delays = (0..plan.units)
            .map(|_| jitter(&mut rng, plan.unit_delay))
            .collect::<Vec<_>>();

        let call_us = start.elapsed().as_micros() as u64;
        let outcome = ProcessIdContext::scope(execute_statement(
            engine.clone(),
            execution,
            query,
            delays,
        ))
        .await;
        records.push(StatementRecord {
            client: plan.client_id,
            instance: instance.instance_id().to_string(),
            process_id: session.to_string(),
            tracked: outcome.tracked,
            units: plan.units,
            completed_units: outcome.completed_units,
            killed: outcome.killed,
            call_us,
            return_us: start.elapsed().as_micros() as u64,
        });
    }
    engine.disconnect(&session);
    records
}

fn execution_for(session: &ProcessId, query: &QueryContext, units: usize) -> ExecutionGroupContext {
    let units = (0..units)
        .map(|idx| ExecutionUnit {
            data_source_name: format!("ds_{idx}"),
            sql: query.sql.replace("t_order", &format!("t_order_{idx}")),
        })
        .collect();
    ExecutionGroupContext::new(
        vec![ExecutionGroup { units }],
        ExecutionGroupReportContext::with_process_id(session.clone(), "sharding_db", None),
    )
}

fn jitter(rng: &mut SmallRng, max: Duration) -> Duration {
    let max_us = max.as_micros() as u64;
    if max_us == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rng.gen_range(max_us / 2..=max_us))
}

struct StatementOutcome {
    tracked: bool,
    completed_units: usize,
    killed: bool,
}

/// Run one statement's units concurrently, each on its own task.
///
/// Must be called inside a `ProcessIdContext` scope; the units inherit the
/// statement's process id so their completions land on its context.
async fn execute_statement(
    engine: Arc<ProcessEngine>,
    execution: ExecutionGroupContext,
    query: QueryContext,
    delays: Vec<Duration>,
) -> StatementOutcome {
    let tracked = engine.execute_sql(&execution, &query);
    let cancel = engine.current_cancellation();
    let units = delays
        .into_iter()
        .map(|delay| {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(ProcessIdContext::propagate(async move {
                let finished = match cancel {
                    Some(cancel) => tokio::select! {
                        _ = cancel.cancelled() => false,
                        _ = time::sleep(delay) => true,
                    },
                    None => {
                        time::sleep(delay).await;
                        true
                    }
                };
                // Completion is reported whether or not the unit was cut short.
                engine.complete_sql_unit_execution();
                finished
            }))
        })
        .collect::<Vec<_>>();

    let mut completed_units = 0;
    for unit in units {
        match unit.await {
            Ok(true) => completed_units += 1,
            Ok(false) => {}
            Err(err) => tracing::warn!(error = ?err, "execution unit task failed"),
        }
    }
    let killed = cancel.is_some_and(|cancel| cancel.is_cancelled());
    engine.complete_sql_execution();
    StatementOutcome {
        tracked,
        completed_units,
        killed,
    }
}

/// Periodically list processes from a random instance and kill some running ones.
async fn run_monitor(
    fleet: Vec<Arc<InstanceHandle>>,
    interval: Duration,
    kill_pct: u8,
    seed: u64,
    start: time::Instant,
    stop: CancellationToken,
) -> (Vec<ListingRecord>, Vec<KillRecord>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
    let mut listings = Vec::new();
    let mut kills = Vec::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let requester = &fleet[rng.gen_range(0..fleet.len())];
        let call_us = start.elapsed().as_micros() as u64;
        let report = requester.process_list().show_process_list().await;
        let return_us = start.elapsed().as_micros() as u64;
        let report = match report {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(error = ?err, requester = %requester.instance_id(), "process listing failed");
                listings.push(ListingRecord {
                    requester: requester.instance_id().to_string(),
                    call_us,
                    return_us,
                    running: 0,
                    idle: 0,
                    missing_instances: Vec::new(),
                    error: Some(format!("{err:#}")),
                });
                continue;
            }
        };
        let running = report
            .rows
            .iter()
            .filter(|row| !row.row.idle)
            .collect::<Vec<_>>();
        listings.push(ListingRecord {
            requester: requester.instance_id().to_string(),
            call_us,
            return_us,
            running: running.len(),
            idle: report.rows.len() - running.len(),
            missing_instances: report
                .missing_instances
                .iter()
                .map(ToString::to_string)
                .collect(),
            error: None,
        });

        if running.is_empty() || rng.gen_range(0..100) >= kill_pct as u32 {
            continue;
        }
        let victim = running[rng.gen_range(0..running.len())];
        let Some(process_id) = victim.row.id.clone().map(ProcessId::new) else {
            continue;
        };
        let killer = &fleet[rng.gen_range(0..fleet.len())];
        let result = killer
            .process_list()
            .kill_process_on(&victim.instance_id, &process_id)
            .await;
        kills.push(KillRecord {
            requester: killer.instance_id().to_string(),
            target_instance: victim.instance_id.to_string(),
            process_id: process_id.to_string(),
            call_us: start.elapsed().as_micros() as u64,
            error: result.err().map(|err| format!("{err:#}")),
        });
    }
    (listings, kills)
}

fn write_history(path: &PathBuf, history: &History) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(history).context("serialize history")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

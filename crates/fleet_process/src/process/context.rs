//! Per-execution progress record.
//!
//! A `ProcessContext` is created when a tracked statement starts and is then
//! shared (behind `Arc`) between the registry, the executor's worker tasks and
//! the cluster subscriber that reports it. Everything a worker mutates is an
//! atomic so no caller ever takes a lock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

use super::types::{current_unix_millis, ExecutionGroupContext, ExecutionGroupReportContext, ProcessId};

/// Progress of one tracked execution (or the idle placeholder of a session).
#[derive(Debug)]
pub struct ProcessContext {
    id: ProcessId,
    database_name: Option<String>,
    username: Option<String>,
    hostname: Option<String>,
    sql: Option<String>,
    total_unit_count: u32,
    completed_unit_count: AtomicU32,
    start_millis: u64,
    idle: AtomicBool,
    cancel: CancellationToken,
}

/// Point-in-time copy of a `ProcessContext`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub database_name: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub sql: Option<String>,
    pub total_unit_count: u32,
    pub completed_unit_count: u32,
    pub start_millis: u64,
    pub idle: bool,
}

impl ProcessContext {
    /// Bare context with the given unit count. Mostly useful for tests and
    /// callers that do not come through the routing layer.
    pub fn new(id: ProcessId, sql: Option<String>, total_unit_count: u32) -> Self {
        Self {
            id,
            database_name: None,
            username: None,
            hostname: None,
            sql,
            total_unit_count,
            completed_unit_count: AtomicU32::new(0),
            start_millis: current_unix_millis(),
            idle: AtomicBool::new(total_unit_count == 0),
            cancel: CancellationToken::new(),
        }
    }

    /// Idle placeholder registered when a session connects.
    pub fn session(report: &ExecutionGroupReportContext) -> Self {
        Self::from_report(report, None, 0)
    }

    /// Running context for a routed statement, sized to its execution units.
    pub fn statement(sql: impl Into<String>, execution: &ExecutionGroupContext) -> Self {
        let units = u32::try_from(execution.unit_count()).unwrap_or(u32::MAX);
        Self::from_report(&execution.report, Some(sql.into()), units)
    }

    fn from_report(report: &ExecutionGroupReportContext, sql: Option<String>, units: u32) -> Self {
        let (username, hostname) = match &report.grantee {
            Some(grantee) => (Some(grantee.username.clone()), Some(grantee.hostname.clone())),
            None => (None, None),
        };
        let database_name = Some(report.database_name.clone()).filter(|name| !name.is_empty());
        Self {
            database_name,
            username,
            hostname,
            ..Self::new(report.process_id.clone(), sql, units)
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn database_name(&self) -> Option<&str> {
        self.database_name.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn total_unit_count(&self) -> u32 {
        self.total_unit_count
    }

    pub fn completed_unit_count(&self) -> u32 {
        self.completed_unit_count.load(Ordering::Acquire)
    }

    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_unit_count() >= self.total_unit_count
    }

    /// Count one finished execution unit.
    ///
    /// Returns `false` once the count already equals `total_unit_count`; the
    /// counter never exceeds the total no matter how many workers race here.
    pub fn complete_execution_unit(&self) -> bool {
        let total = self.total_unit_count;
        self.completed_unit_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |done| {
                (done < total).then_some(done + 1)
            })
            .is_ok()
    }

    /// Flag the context as idle (statement finished, session still open).
    pub fn mark_idle(&self) {
        self.idle.store(true, Ordering::Release);
    }

    /// Abort this execution: every unit holding a token from
    /// [`ProcessContext::cancellation`] observes it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Child token an execution unit selects on to stop early when killed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id.clone(),
            database_name: self.database_name.clone(),
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            sql: self.sql.clone(),
            total_unit_count: self.total_unit_count,
            completed_unit_count: self.completed_unit_count(),
            start_millis: self.start_millis,
            idle: self.is_idle(),
        }
    }
}

impl PartialEq for ProcessContext {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

//! Local orchestration of tracked executions.
//!
//! The executor calls `execute_sql` before its units run, then
//! `complete_sql_unit_execution` once per finished unit and
//! `complete_sql_execution` once per statement, whatever the outcome. Tracking
//! is observability only: nothing here fails or blocks when an id or entry is
//! missing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::cleaner::ProcessCleaners;
use super::context::ProcessContext;
use super::id_context::ProcessIdContext;
use super::registry::ProcessRegistry;
use super::types::{
    ExecutionGroupContext, ExecutionGroupReportContext, Grantee, ProcessId, QueryContext,
    StatementKind,
};

/// Decides which statements get a tracked `ProcessContext`.
pub trait TrackedStatementFilter: Send + Sync + 'static {
    fn is_tracked(&self, query: &QueryContext) -> bool;
}

/// Tracks DDL and DML statements parsed under one of the configured dialects.
#[derive(Clone, Debug)]
pub struct DialectStatementFilter {
    dialects: Vec<String>,
}

impl DialectStatementFilter {
    pub fn new<I, S>(dialects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dialects: dialects
                .into_iter()
                .map(Into::into)
                .map(|dialect: String| dialect.trim().to_string())
                .filter(|dialect| !dialect.is_empty())
                .collect(),
        }
    }

    pub fn dialects(&self) -> &[String] {
        &self.dialects
    }
}

impl Default for DialectStatementFilter {
    fn default() -> Self {
        Self::new(["MySQL"])
    }
}

impl TrackedStatementFilter for DialectStatementFilter {
    fn is_tracked(&self, query: &QueryContext) -> bool {
        matches!(query.statement_kind, StatementKind::Ddl | StatementKind::Dml)
            && self
                .dialects
                .iter()
                .any(|dialect| dialect.eq_ignore_ascii_case(&query.database_type))
    }
}

/// Registers, advances and finishes tracked executions in a `ProcessRegistry`.
pub struct ProcessEngine {
    registry: Arc<ProcessRegistry>,
    filter: Arc<dyn TrackedStatementFilter>,
    cleaners: ProcessCleaners,
}

impl ProcessEngine {
    /// Engine with the default dialect filter and no cleanup extensions.
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            registry,
            filter: Arc::new(DialectStatementFilter::default()),
            cleaners: ProcessCleaners::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn TrackedStatementFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cleaners(mut self, cleaners: ProcessCleaners) -> Self {
        self.cleaners = cleaners;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn cleaners(&self) -> &ProcessCleaners {
        &self.cleaners
    }

    /// Register an idle session entry and return its id.
    pub fn connect(&self, grantee: Option<Grantee>, database_name: &str) -> ProcessId {
        let report = ExecutionGroupReportContext::new(database_name, grantee);
        let context = Arc::new(ProcessContext::session(&report));
        self.registry.put(report.process_id.clone(), context);
        tracing::debug!(process_id = %report.process_id, database = database_name, "session connected");
        report.process_id
    }

    pub fn disconnect(&self, process_id: &ProcessId) {
        if self.registry.remove(process_id).is_some() {
            tracing::debug!(process_id = %process_id, "session disconnected");
        }
    }

    /// Start tracking `query` if the filter accepts it.
    ///
    /// Binds the report context's process id to the current call chain and
    /// replaces that id's registry entry with a context sized to the
    /// execution units. Returns whether the statement is tracked; on a runtime
    /// thread that means the caller must be inside [`ProcessIdContext::scope`].
    pub fn execute_sql(&self, execution: &ExecutionGroupContext, query: &QueryContext) -> bool {
        if !self.filter.is_tracked(query) {
            return false;
        }
        let process_id = execution.report.process_id.clone();
        if !ProcessIdContext::set(process_id.clone()) {
            return false;
        }
        let context = Arc::new(ProcessContext::statement(query.sql.clone(), execution));
        tracing::trace!(
            process_id = %process_id,
            units = context.total_unit_count(),
            "tracking statement"
        );
        self.registry.put(process_id, context);
        true
    }

    pub fn complete_sql_unit_execution(&self) {
        let Some(process_id) = ProcessIdContext::get() else {
            return;
        };
        // The entry may already be gone if the session disconnected meanwhile.
        if let Some(context) = self.registry.get(&process_id) {
            context.complete_execution_unit();
        }
    }

    pub fn complete_sql_execution(&self) {
        let Some(process_id) = ProcessIdContext::get() else {
            return;
        };
        if let Some(context) = self.registry.get(&process_id) {
            self.cleaners.reset_all(&context);
        }
        ProcessIdContext::remove();
    }

    /// Cancellation token of the execution bound to the current call chain.
    ///
    /// Execution units select on it so a cluster kill stops them early.
    pub fn current_cancellation(&self) -> Option<CancellationToken> {
        let process_id = ProcessIdContext::get()?;
        self.registry
            .get(&process_id)
            .map(|context| context.cancellation())
    }
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("tracked", &self.registry.len())
            .field("cleaners", &self.cleaners)
            .finish()
    }
}

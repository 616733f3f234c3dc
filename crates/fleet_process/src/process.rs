//! Process module wiring.
//!
//! `types` defines the identifiers and execution model consumed from the
//! routing layer, `context` the per-execution progress record, `registry` the
//! concurrent map that owns those records, `id_context` the call-chain slot for
//! the active id, `lock` the bounded-wait signal, and `engine` the orchestration
//! the executor calls into.

mod cleaner;
mod context;
mod engine;
mod id_context;
mod lock;
mod registry;
mod types;

pub use cleaner::{IdleSessionCleaner, ProcessCleaner, ProcessCleaners, ProgressLogCleaner};
pub use context::{ProcessContext, ProcessSnapshot};
pub use engine::{DialectStatementFilter, ProcessEngine, TrackedStatementFilter};
pub use id_context::{ProcessIdContext, ProcessIdGuard};
pub use lock::{ShowProcessListLock, DEFAULT_AWAIT_TIMEOUT};
pub use registry::ProcessRegistry;
pub use types::{
    current_unix_millis, ExecutionGroup, ExecutionGroupContext, ExecutionGroupReportContext,
    ExecutionUnit, Grantee, InstanceId, ProcessId, QueryContext, StatementKind,
};

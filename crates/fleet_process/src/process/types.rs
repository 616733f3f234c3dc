//! Shared identifiers and the execution model consumed from the routing layer.
//!
//! The routing/rewrite layer is an external collaborator: all this crate needs
//! from it is "a statement that produced N execution units", described by
//! `ExecutionGroupContext` and `QueryContext`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of one tracked execution or one cluster-wide list request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    /// Generate a fresh id: a v4 UUID rendered without dashes.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Stable identifier of a running proxy instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Authenticated client identity of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grantee {
    pub username: String,
    pub hostname: String,
}

impl Grantee {
    pub fn new(username: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.into(),
        }
    }
}

/// One atomic piece of a statement's execution against a single backend data source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionUnit {
    pub data_source_name: String,
    pub sql: String,
}

/// Units that share one backend connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub units: Vec<ExecutionUnit>,
}

/// Reporting attributes attached to an execution: who runs it and under which id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionGroupReportContext {
    pub process_id: ProcessId,
    pub database_name: String,
    pub grantee: Option<Grantee>,
}

impl ExecutionGroupReportContext {
    /// New report context with a freshly generated process id.
    pub fn new(database_name: impl Into<String>, grantee: Option<Grantee>) -> Self {
        Self::with_process_id(ProcessId::generate(), database_name, grantee)
    }

    /// Report context for an existing session id.
    pub fn with_process_id(
        process_id: ProcessId,
        database_name: impl Into<String>,
        grantee: Option<Grantee>,
    ) -> Self {
        Self {
            process_id,
            database_name: database_name.into(),
            grantee,
        }
    }
}

/// Routed execution plan of one statement: its groups of units plus report context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionGroupContext {
    pub groups: Vec<ExecutionGroup>,
    pub report: ExecutionGroupReportContext,
}

impl ExecutionGroupContext {
    pub fn new(groups: Vec<ExecutionGroup>, report: ExecutionGroupReportContext) -> Self {
        Self { groups, report }
    }

    pub fn unit_count(&self) -> usize {
        self.groups.iter().map(|group| group.units.len()).sum()
    }
}

/// Coarse statement classification produced by the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Data definition (`CREATE`, `ALTER`, `DROP`, ...).
    Ddl,
    /// Data manipulation (`SELECT`, `INSERT`, `UPDATE`, `DELETE`).
    Dml,
    /// Administration (`SHOW`, `SET`, ...).
    Dal,
    /// Access control (`GRANT`, `REVOKE`).
    Dcl,
    /// Transaction control (`BEGIN`, `COMMIT`, `ROLLBACK`).
    Tcl,
}

/// Parsed statement as seen by process tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryContext {
    pub sql: String,
    pub statement_kind: StatementKind,
    /// Backend dialect the statement was parsed under, e.g. `MySQL`.
    pub database_type: String,
}

impl QueryContext {
    pub fn new(
        sql: impl Into<String>,
        statement_kind: StatementKind,
        database_type: impl Into<String>,
    ) -> Self {
        Self {
            sql: sql.into(),
            statement_kind,
            database_type: database_type.into(),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch (0 if the clock is before it).
pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_process_ids_are_unique_and_dashless() {
        let a = ProcessId::generate();
        let b = ProcessId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn unit_count_sums_all_groups() {
        let unit = |ds: &str| ExecutionUnit {
            data_source_name: ds.to_string(),
            sql: "SELECT 1".to_string(),
        };
        let ctx = ExecutionGroupContext::new(
            vec![
                ExecutionGroup {
                    units: vec![unit("ds_0"), unit("ds_0")],
                },
                ExecutionGroup {
                    units: vec![unit("ds_1")],
                },
            ],
            ExecutionGroupReportContext::new("sharding_db", None),
        );
        assert_eq!(ctx.unit_count(), 3);
    }
}

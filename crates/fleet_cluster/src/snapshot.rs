//! YAML document each instance writes under `/execution_nodes/{processID}/{instanceID}`.
//!
//! Field order is alphabetical and absent optional fields are left out, so the
//! document stays byte-compatible with what other cluster members write.

use fleet_process::process::{ProcessContext, ProcessSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessListRow {
    #[serde(default)]
    pub completed_unit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub idle: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub start_time_millis: u64,
    #[serde(default)]
    pub total_unit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl From<ProcessSnapshot> for ProcessListRow {
    fn from(snapshot: ProcessSnapshot) -> Self {
        Self {
            completed_unit_count: snapshot.completed_unit_count,
            database_name: snapshot.database_name,
            hostname: snapshot.hostname,
            id: Some(snapshot.id.to_string()),
            idle: snapshot.idle,
            sql: snapshot.sql,
            start_time_millis: snapshot.start_millis,
            total_unit_count: snapshot.total_unit_count,
            username: snapshot.username,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessListDocument {
    #[serde(default)]
    pub contexts: Vec<ProcessListRow>,
}

impl ProcessListDocument {
    /// Rows for `contexts`, oldest first with ties broken by id.
    pub fn from_contexts<'a, I>(contexts: I) -> Self
    where
        I: IntoIterator<Item = &'a ProcessContext>,
    {
        Self::from_snapshots(contexts.into_iter().map(ProcessContext::snapshot).collect())
    }

    pub fn from_snapshots(mut snapshots: Vec<ProcessSnapshot>) -> Self {
        snapshots.sort_by(|a, b| a.start_millis.cmp(&b.start_millis).then_with(|| a.id.cmp(&b.id)));
        Self {
            contexts: snapshots.into_iter().map(ProcessListRow::from).collect(),
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn decode(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }
}

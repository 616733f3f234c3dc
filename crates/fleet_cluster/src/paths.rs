//! Coordination-store key layout.
//!
//! These paths are shared with every other member of the cluster; changing any
//! of them breaks listing and kill across a rolling upgrade.

use fleet_process::process::{InstanceId, ProcessId};

pub const COMPUTE_NODES_ROOT: &str = "/nodes/compute_nodes";
pub const PROCESS_TRIGGER_ROOT: &str = "/nodes/compute_nodes/process_trigger";
pub const PROCESS_KILL_ROOT: &str = "/nodes/compute_nodes/process_kill";
pub const ONLINE_PROXY_ROOT: &str = "/nodes/compute_nodes/online/proxy";
pub const EXECUTION_NODES_ROOT: &str = "/execution_nodes";

/// `{instanceID}:{processID}`, the child name used under the trigger and kill roots.
pub fn instance_process_key(instance_id: &InstanceId, process_id: &ProcessId) -> String {
    format!("{instance_id}:{process_id}")
}

pub fn process_trigger_path(instance_id: &InstanceId, process_id: &ProcessId) -> String {
    format!(
        "{PROCESS_TRIGGER_ROOT}/{}",
        instance_process_key(instance_id, process_id)
    )
}

pub fn process_kill_path(instance_id: &InstanceId, process_id: &ProcessId) -> String {
    format!(
        "{PROCESS_KILL_ROOT}/{}",
        instance_process_key(instance_id, process_id)
    )
}

pub fn online_instance_path(instance_id: &InstanceId) -> String {
    format!("{ONLINE_PROXY_ROOT}/{instance_id}")
}

/// Parent of every per-instance snapshot written for one list request.
pub fn execution_process_path(process_id: &ProcessId) -> String {
    format!("{EXECUTION_NODES_ROOT}/{process_id}")
}

pub fn execution_snapshot_path(process_id: &ProcessId, instance_id: &InstanceId) -> String {
    format!("{EXECUTION_NODES_ROOT}/{process_id}/{instance_id}")
}

/// Parse `{root}/{instanceID}:{processID}` back into its two ids.
///
/// Instance ids may themselves contain `:` (host:port style), so the split
/// happens at the last one. Returns `None` for keys outside `root`, nested
/// keys, or either id being empty.
pub fn parse_instance_process(root: &str, key: &str) -> Option<(InstanceId, ProcessId)> {
    let child = key.strip_prefix(root)?.strip_prefix('/')?;
    if child.contains('/') {
        return None;
    }
    let (instance, process) = child.rsplit_once(':')?;
    if instance.is_empty() || process.is_empty() {
        return None;
    }
    Some((InstanceId::new(instance), ProcessId::new(process)))
}

//! Instance metadata and online registration.

use anyhow::Context;
use fleet_process::process::InstanceId;
use serde::{Deserialize, Serialize};

use crate::paths::{online_instance_path, ONLINE_PROXY_ROOT};
use crate::repository::CoordinationRepository;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetaData {
    pub id: InstanceId,
    pub host: String,
    pub port: u16,
    pub version: String,
}

impl InstanceMetaData {
    pub fn new(id: InstanceId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Publish `meta` under the online root so requesters address it.
pub async fn register_online(
    repository: &dyn CoordinationRepository,
    meta: &InstanceMetaData,
) -> anyhow::Result<()> {
    let path = online_instance_path(&meta.id);
    let body = serde_json::to_string(meta).context("encode instance metadata")?;
    repository
        .persist_ephemeral(&path, &body)
        .await
        .with_context(|| format!("register online instance at {path}"))
}

pub async fn unregister_online(
    repository: &dyn CoordinationRepository,
    instance_id: &InstanceId,
) -> anyhow::Result<()> {
    let path = online_instance_path(instance_id);
    repository
        .delete(&path)
        .await
        .with_context(|| format!("unregister online instance at {path}"))
}

/// Ids of every instance currently registered online, sorted.
pub async fn load_online_instance_ids(
    repository: &dyn CoordinationRepository,
) -> anyhow::Result<Vec<InstanceId>> {
    let children = repository
        .get_children_keys(ONLINE_PROXY_ROOT)
        .await
        .context("list online instances")?;
    Ok(children.into_iter().map(InstanceId::new).collect())
}

/// Metadata of one online instance, if it is registered and readable.
pub async fn load_online_instance(
    repository: &dyn CoordinationRepository,
    instance_id: &InstanceId,
) -> anyhow::Result<Option<InstanceMetaData>> {
    let path = online_instance_path(instance_id);
    let Some(raw) = repository
        .get(&path)
        .await
        .with_context(|| format!("read {path}"))?
    else {
        return Ok(None);
    };
    let meta = serde_json::from_str(&raw).with_context(|| format!("decode {path}"))?;
    Ok(Some(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    #[tokio::test]
    async fn register_list_and_unregister() {
        let repo = MemoryRepository::new();
        let a = InstanceMetaData::new(InstanceId::from("a"), "127.0.0.1", 3307);
        let b = InstanceMetaData::new(InstanceId::from("b"), "127.0.0.1", 3308);
        register_online(&repo, &b).await.unwrap();
        register_online(&repo, &a).await.unwrap();
        assert_eq!(
            load_online_instance_ids(&repo).await.unwrap(),
            vec![InstanceId::from("a"), InstanceId::from("b")]
        );
        assert_eq!(load_online_instance(&repo, &a.id).await.unwrap(), Some(a.clone()));

        unregister_online(&repo, &a.id).await.unwrap();
        assert_eq!(load_online_instance_ids(&repo).await.unwrap(), vec![b.id]);
        assert!(load_online_instance(&repo, &a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_metadata_is_reported() {
        let repo = MemoryRepository::new();
        repo.persist("/nodes/compute_nodes/online/proxy/x", "not json")
            .await
            .unwrap();
        let err = load_online_instance(&repo, &InstanceId::from("x"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("decode"));
    }
}

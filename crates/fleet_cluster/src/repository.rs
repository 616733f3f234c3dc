//! Watchable hierarchical key-value store shared by every cluster member.
//!
//! The real deployment talks to an external coordination service; this crate
//! only depends on the `CoordinationRepository` trait. `MemoryRepository` is the
//! in-process implementation used by tests and the workload binary.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::broadcast;

/// Kind of change observed on a watched key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// One change notification from the store's watch primitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChangedEvent {
    pub key: String,
    pub value: String,
    pub kind: ChangeKind,
}

impl DataChangedEvent {
    pub fn new(key: impl Into<String>, value: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind,
        }
    }
}

pub type WatchStream = Pin<Box<dyn Stream<Item = DataChangedEvent> + Send>>;

#[async_trait]
pub trait CoordinationRepository: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Names (not full paths) of the direct children of `key`, sorted.
    async fn get_children_keys(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn persist(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Persist a key that should disappear with the writer's session.
    async fn persist_ephemeral(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Delete `key` and everything below it. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Stream of changes to `prefix` and its descendants, starting now.
    ///
    /// The subscription is live once this returns, so a write issued after the
    /// call is always observed.
    async fn watch(&self, prefix: &str) -> anyhow::Result<WatchStream>;
}

const WATCH_CAPACITY: usize = 4096;

/// In-memory `CoordinationRepository`.
///
/// Parent nodes are implicit: a key exists if it holds a value, and its
/// ancestors are derived from the path. Ephemeral keys are plain keys here;
/// the caller deletes them on shutdown.
#[derive(Debug)]
pub struct MemoryRepository {
    inner: RwLock<BTreeMap<String, String>>,
    changes: broadcast::Sender<DataChangedEvent>,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: RwLock::new(BTreeMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `persist`/`persist_ephemeral`/`delete` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        match self.inner.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .read()
            .map(|guard| guard.contains_key(key))
            .unwrap_or(false)
    }

    fn check_writable(&self, op: &str, key: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.fail_writes.load(Ordering::SeqCst),
            "coordination store rejected {op} of {key}"
        );
        Ok(())
    }

    fn publish(&self, event: DataChangedEvent) {
        // No receivers just means nobody is watching.
        let _ = self.changes.send(event);
    }

    fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.check_writable("persist", key)?;
        let previous = {
            let mut guard = self
                .inner
                .write()
                .map_err(|_| anyhow::anyhow!("coordination store lock poisoned"))?;
            guard.insert(key.to_string(), value.to_string())
        };
        let kind = if previous.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Added
        };
        self.publish(DataChangedEvent::new(key, value, kind));
        Ok(())
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn is_at_or_below(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl CoordinationRepository for MemoryRepository {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("coordination store lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    async fn get_children_keys(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("coordination store lock poisoned"))?;
        let parent = format!("{}/", key.trim_end_matches('/'));
        let children = guard
            .range(parent.clone()..)
            .take_while(|(path, _)| path.starts_with(&parent))
            .filter_map(|(path, _)| path[parent.len()..].split('/').next())
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        Ok(children.into_iter().collect())
    }

    async fn persist(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.put(key, value)
    }

    async fn persist_ephemeral(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.put(key, value)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check_writable("delete", key)?;
        let removed = {
            let mut guard = self
                .inner
                .write()
                .map_err(|_| anyhow::anyhow!("coordination store lock poisoned"))?;
            let doomed = guard
                .keys()
                .filter(|path| is_at_or_below(path, key))
                .cloned()
                .collect::<Vec<_>>();
            doomed
                .into_iter()
                .filter_map(|path| guard.remove(&path).map(|value| (path, value)))
                .collect::<Vec<_>>()
        };
        for (path, value) in removed {
            self.publish(DataChangedEvent::new(path, value, ChangeKind::Deleted));
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> anyhow::Result<WatchStream> {
        let rx = self.changes.subscribe();
        let prefix = prefix.to_string();
        let stream = futures_util::stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if is_at_or_below(&event.key, &prefix) => {
                        return Some((event, (rx, prefix)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, prefix = %prefix, "coordination watch lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Read and decode every child document below `key`, keyed by child name.
pub async fn read_children(
    repository: &dyn CoordinationRepository,
    key: &str,
) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for child in repository
        .get_children_keys(key)
        .await
        .with_context(|| format!("list children of {key}"))?
    {
        let path = format!("{key}/{child}");
        if let Some(value) = repository
            .get(&path)
            .await
            .with_context(|| format!("read {path}"))?
        {
            out.push((child, value));
        }
    }
    Ok(out)
}

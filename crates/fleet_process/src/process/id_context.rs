//! Call-chain-scoped slot holding the active `ProcessId`.
//!
//! Async work runs inside [`ProcessIdContext::scope`], which gives the task its
//! own slot for exactly as long as the wrapped future lives; when the future
//! completes, errors out or is dropped on cancellation, the slot goes with it.
//! Synchronous callers outside any task scope fall back to a per-thread slot,
//! released by [`ProcessIdGuard`] or an explicit [`ProcessIdContext::remove`].
//! That fallback only exists off the runtime: a tokio worker thread interleaves
//! many tasks, so inside the runtime an unscoped caller has no slot at all.

use std::cell::RefCell;
use std::future::Future;

use super::types::ProcessId;

tokio::task_local! {
    static TASK_PROCESS_ID: RefCell<Option<ProcessId>>;
}

thread_local! {
    static THREAD_PROCESS_ID: RefCell<Option<ProcessId>> = const { RefCell::new(None) };
}

/// Accessors for the slot of the current call chain.
pub struct ProcessIdContext;

impl ProcessIdContext {
    /// Bind `id` to the current call chain.
    ///
    /// Returns `false`, leaving every slot untouched, when called from a
    /// runtime thread outside any task scope.
    pub fn set(id: ProcessId) -> bool {
        let mut pending = Some(id);
        let _ = TASK_PROCESS_ID.try_with(|slot| *slot.borrow_mut() = pending.take());
        let Some(id) = pending else {
            return true;
        };
        if !thread_slot_available() {
            tracing::warn!(process_id = %id, "no task scope on runtime thread; process id not bound");
            return false;
        }
        THREAD_PROCESS_ID.with(|slot| *slot.borrow_mut() = Some(id));
        true
    }

    pub fn get() -> Option<ProcessId> {
        TASK_PROCESS_ID
            .try_with(|slot| slot.borrow().clone())
            .unwrap_or_else(|_| {
                if thread_slot_available() {
                    THREAD_PROCESS_ID.with(|slot| slot.borrow().clone())
                } else {
                    None
                }
            })
    }

    pub fn remove() {
        if TASK_PROCESS_ID
            .try_with(|slot| slot.borrow_mut().take())
            .is_err()
            && thread_slot_available()
        {
            THREAD_PROCESS_ID.with(|slot| slot.borrow_mut().take());
        }
    }

    pub fn is_empty() -> bool {
        Self::get().is_none()
    }

    /// Run `fut` with a fresh, empty slot of its own.
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        TASK_PROCESS_ID.scope(RefCell::new(None), fut).await
    }

    /// Run `fut` in a new slot seeded with the caller's current id.
    ///
    /// Used when an execution unit is handed to another task so its
    /// completion is still attributed to the statement that spawned it.
    pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
        TASK_PROCESS_ID.scope(RefCell::new(Self::get()), fut)
    }

    /// Synchronous counterpart of [`ProcessIdContext::scope`].
    pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
        TASK_PROCESS_ID.sync_scope(RefCell::new(None), f)
    }

    /// Set `id` and clear it again when the returned guard drops.
    pub fn enter(id: ProcessId) -> ProcessIdGuard {
        Self::set(id);
        ProcessIdGuard { _private: () }
    }
}

fn thread_slot_available() -> bool {
    tokio::runtime::Handle::try_current().is_err()
}

/// Clears the current slot on drop, including during unwinding.
#[must_use = "the process id is cleared as soon as the guard is dropped"]
pub struct ProcessIdGuard {
    _private: (),
}

impl Drop for ProcessIdGuard {
    fn drop(&mut self) {
        ProcessIdContext::remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "123e4567e89b12d3a456426655440000";
    const OTHER_ID: &str = "123e4567e89b12d3a456426655440001";

    #[test]
    fn is_empty_mirrors_state() {
        assert!(ProcessIdContext::is_empty());
        ProcessIdContext::set(ProcessId::from(ID));
        assert!(!ProcessIdContext::is_empty());
        ProcessIdContext::remove();
        assert!(ProcessIdContext::is_empty());
    }

    #[test]
    fn set_overwrites_and_get_returns_latest() {
        assert_eq!(ProcessIdContext::get(), None);
        ProcessIdContext::set(ProcessId::from(ID));
        assert_eq!(ProcessIdContext::get(), Some(ProcessId::from(ID)));
        ProcessIdContext::set(ProcessId::from(OTHER_ID));
        assert_eq!(ProcessIdContext::get(), Some(ProcessId::from(OTHER_ID)));
        ProcessIdContext::remove();
        assert_eq!(ProcessIdContext::get(), None);
    }

    #[test]
    fn guard_clears_on_drop_and_on_panic() {
        {
            let _guard = ProcessIdContext::enter(ProcessId::from(ID));
            assert_eq!(ProcessIdContext::get(), Some(ProcessId::from(ID)));
        }
        assert!(ProcessIdContext::is_empty());

        let unwound = std::panic::catch_unwind(|| {
            let _guard = ProcessIdContext::enter(ProcessId::from(ID));
            panic!("statement failed");
        });
        assert!(unwound.is_err());
        assert!(ProcessIdContext::is_empty());
    }

    #[test]
    fn threads_do_not_share_slots() {
        ProcessIdContext::set(ProcessId::from(ID));
        let seen = std::thread::spawn(ProcessIdContext::get).join().unwrap();
        assert_eq!(seen, None);
        ProcessIdContext::remove();
    }

    #[test]
    fn sync_scope_shadows_thread_slot() {
        ProcessIdContext::set(ProcessId::from(ID));
        ProcessIdContext::sync_scope(|| {
            assert!(ProcessIdContext::is_empty());
            ProcessIdContext::set(ProcessId::from(OTHER_ID));
            assert_eq!(ProcessIdContext::get(), Some(ProcessId::from(OTHER_ID)));
        });
        assert_eq!(ProcessIdContext::get(), Some(ProcessId::from(ID)));
        ProcessIdContext::remove();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_task_scopes_are_isolated() {
        let tasks = (0..8)
            .map(|idx| {
                tokio::spawn(ProcessIdContext::scope(async move {
                    let id = ProcessId::new(format!("task-{idx}"));
                    ProcessIdContext::set(id.clone());
                    tokio::task::yield_now().await;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    ProcessIdContext::get() == Some(id)
                }))
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert!(task.await.unwrap());
        }
    }

    #[tokio::test]
    async fn propagate_seeds_child_scope() {
        let seen = ProcessIdContext::scope(async {
            ProcessIdContext::set(ProcessId::from(ID));
            let child = tokio::spawn(ProcessIdContext::propagate(async {
                ProcessIdContext::get()
            }));
            child.await.unwrap()
        })
        .await;
        assert_eq!(seen, Some(ProcessId::from(ID)));
    }

    #[tokio::test]
    async fn unscoped_set_on_runtime_thread_binds_nothing() {
        assert!(!ProcessIdContext::set(ProcessId::from(ID)));
        assert!(ProcessIdContext::is_empty());
        let seen = tokio::spawn(async { ProcessIdContext::get() }).await.unwrap();
        assert_eq!(seen, None);

        let scoped = ProcessIdContext::scope(async {
            assert!(ProcessIdContext::set(ProcessId::from(OTHER_ID)));
            ProcessIdContext::get()
        })
        .await;
        assert_eq!(scoped, Some(ProcessId::from(OTHER_ID)));
    }

    #[tokio::test]
    async fn scope_is_dropped_with_cancelled_future() {
        let task = tokio::spawn(ProcessIdContext::scope(async {
            ProcessIdContext::set(ProcessId::from(ID));
            std::future::pending::<()>().await;
        }));
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        ProcessIdContext::scope(async {
            assert!(ProcessIdContext::is_empty());
        })
        .await;
    }
}

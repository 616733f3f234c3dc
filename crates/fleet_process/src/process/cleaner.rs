//! Cleanup extensions run when a tracked execution completes.
//!
//! Each extension gets the finished context so it can release whatever state it
//! keeps for that execution. The same context may be presented more than once,
//! or after it has already left the registry, so every `reset` is idempotent.

use std::sync::Arc;

use super::context::ProcessContext;

/// One pluggable cleanup step.
pub trait ProcessCleaner: Send + Sync + 'static {
    /// Name used to enable the cleaner from configuration.
    fn name(&self) -> &'static str;

    fn reset(&self, context: &ProcessContext);
}

/// Puts a finished statement's entry back into the idle state, so the session
/// shows up as idle in listings until its next statement.
#[derive(Debug, Default)]
pub struct IdleSessionCleaner;

impl ProcessCleaner for IdleSessionCleaner {
    fn name(&self) -> &'static str {
        "idle-session"
    }

    fn reset(&self, context: &ProcessContext) {
        context.mark_idle();
    }
}

/// Emits the final progress of every tracked execution at debug level.
#[derive(Debug, Default)]
pub struct ProgressLogCleaner;

impl ProcessCleaner for ProgressLogCleaner {
    fn name(&self) -> &'static str {
        "progress-log"
    }

    fn reset(&self, context: &ProcessContext) {
        tracing::debug!(
            process_id = %context.id(),
            completed = context.completed_unit_count(),
            total = context.total_unit_count(),
            cancelled = context.is_cancelled(),
            "tracked execution finished"
        );
    }
}

/// Ordered set of cleanup extensions, assembled once at startup.
#[derive(Clone, Default)]
pub struct ProcessCleaners {
    cleaners: Vec<Arc<dyn ProcessCleaner>>,
}

impl ProcessCleaners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve built-in cleaners by name, in the given order.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> anyhow::Result<Self> {
        let mut cleaners = Self::new();
        for name in names {
            let cleaner: Arc<dyn ProcessCleaner> = match name.as_ref().trim() {
                "idle-session" => Arc::new(IdleSessionCleaner),
                "progress-log" => Arc::new(ProgressLogCleaner),
                "" => continue,
                other => anyhow::bail!(
                    "unknown process cleaner {other:?} (expected idle-session or progress-log)"
                ),
            };
            cleaners.register(cleaner);
        }
        Ok(cleaners)
    }

    pub fn register(&mut self, cleaner: Arc<dyn ProcessCleaner>) {
        self.cleaners.push(cleaner);
    }

    pub fn with(mut self, cleaner: Arc<dyn ProcessCleaner>) -> Self {
        self.register(cleaner);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.cleaners.iter().map(|cleaner| cleaner.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.cleaners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleaners.is_empty()
    }

    pub fn reset_all(&self, context: &ProcessContext) {
        for cleaner in &self.cleaners {
            cleaner.reset(context);
        }
    }
}

impl std::fmt::Debug for ProcessCleaners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;

    #[test]
    fn resolves_builtins_in_order() {
        let cleaners = ProcessCleaners::from_names(&["progress-log", " idle-session ", ""]).unwrap();
        assert_eq!(cleaners.names(), vec!["progress-log", "idle-session"]);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = ProcessCleaners::from_names(&["nope"]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn idle_session_reset_is_idempotent() {
        let ctx = ProcessContext::new(ProcessId::from("p"), Some("DELETE FROM t".into()), 2);
        assert!(!ctx.is_idle());
        let cleaners = ProcessCleaners::from_names(&["idle-session"]).unwrap();
        cleaners.reset_all(&ctx);
        cleaners.reset_all(&ctx);
        assert!(ctx.is_idle());
    }
}

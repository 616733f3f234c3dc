//! Bounded-wait signal for one outstanding cluster-wide process-list request.

use std::time::Duration;

use tokio::sync::Notify;

/// Default upper bound a requester waits for instances to report in.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Wakes the requester when an instance finishes its snapshot contribution.
///
/// Built on `Notify::notify_one`, which stores a permit when nobody is waiting
/// yet: a `do_complete` that lands before `await_default_time` starts still
/// releases the next wait immediately.
#[derive(Debug)]
pub struct ShowProcessListLock {
    notify: Notify,
    timeout: Duration,
}

impl ShowProcessListLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            notify: Notify::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until [`ShowProcessListLock::do_complete`] or the default timeout.
    ///
    /// Returns `true` when signalled, `false` when the timeout elapsed.
    pub async fn await_default_time(&self) -> bool {
        tokio::time::timeout(self.timeout, self.notify.notified())
            .await
            .is_ok()
    }

    pub fn do_complete(&self) {
        self.notify.notify_one();
    }
}

impl Default for ShowProcessListLock {
    fn default() -> Self {
        Self::new(DEFAULT_AWAIT_TIMEOUT)
    }
}

//! Single-shot auto-lock timer.
//!
//! Arming spawns a tokio task that sleeps for the timeout and then runs the
//! expiry callback. Re-arming aborts the pending task first, so at most one
//! timer is ever live. Disarming aborts it without running the callback.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

pub(crate) struct AutoLockTimer {
    timeout: Option<Duration>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl AutoLockTimer {
    /// `None` disables the timer entirely.
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            pending: Mutex::new(None),
        }
    }

    /// (Re)start the countdown. `on_expire` runs once if the timer is not
    /// disarmed or re-armed within the timeout.
    ///
    /// Outside a tokio runtime nothing is scheduled.
    pub(crate) fn arm<F>(&self, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime available, auto-lock timer not armed");
            return;
        };

        let handle = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!(timeout_secs = timeout.as_secs(), "auto-lock timer expired");
            on_expire();
        });

        if let Some(previous) = self.pending().replace(handle) {
            previous.abort();
        }
        tracing::debug!(timeout_secs = timeout.as_secs(), "auto-lock timer armed");
    }

    /// Cancel the countdown, if any.
    pub(crate) fn disarm(&self) {
        if let Some(handle) = self.pending().take() {
            handle.abort();
            tracing::debug!("auto-lock timer disarmed");
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.pending()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AutoLockTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

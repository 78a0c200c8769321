//! Per-session scheduler of delayed actions.
//!
//! Startup narration and prompt answers are short `(delay, action)` pairs.
//! Each runs as a task on a [`TaskTracker`] and waits on a child
//! [`CancellationToken`], so [`Scheduler::cancel_all`] drops every pending
//! action at once and nothing fires after the session has terminated.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, Instrument};

/// Delayed-action scheduler owned by one session.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Scheduler whose actions are also cancelled when `parent` is.
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: parent.child_token(),
        }
    }

    /// Run `action` after `delay` unless cancelled first. Actions scheduled
    /// after [`cancel_all`](Self::cancel_all) are dropped.
    pub fn schedule<F>(&self, name: &'static str, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!(action = name, "scheduler cancelled, dropping action");
            return;
        }
        let cancel = self.cancel.clone();
        self.tracker.spawn(
            async move {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("scheduled action cancelled");
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                action.await;
            }
            .instrument(info_span!("scheduled_action", action = name)),
        );
    }

    /// Number of actions that have not finished yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Whether [`cancel_all`](Self::cancel_all) has run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every pending action and refuse new ones.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Wait until every spawned action has finished or been cancelled.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

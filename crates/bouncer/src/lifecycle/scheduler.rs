//! Deferred timeout actions.
//!
//! Each issued challenge schedules exactly one [`TimeoutJob`]. The job
//! carries the issuance timestamp so the controller can tell a stale job
//! from the current one when it fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bouncer_common::{ChatId, PendingChallenge, UserId};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// A fire-once timeout for one issued challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutJob {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub display_name: String,

    /// Fencing token: the challenge's `issued_at_ms`
    pub issued_at_ms: i64,
}

impl TimeoutJob {
    pub fn for_pending(pending: &PendingChallenge) -> Self {
        Self {
            chat_id: pending.chat_id,
            user_id: pending.user_id,
            display_name: pending.display_name.clone(),
            issued_at_ms: pending.issued_at_ms,
        }
    }
}

/// Schedules timeout jobs
pub trait TimeoutScheduler: Send + Sync {
    /// Deliver `job` once after `delay`
    fn schedule(&self, job: TimeoutJob, delay: Duration);

    /// Drop a job that has not fired yet. A no-op if it already fired.
    fn cancel(&self, user_id: UserId, issued_at_ms: i64);
}

type TaskMap = Arc<Mutex<HashMap<(UserId, i64), AbortHandle>>>;

/// One sleeping tokio task per job; fired jobs go out on a channel
pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<TimeoutJob>,
    tasks: TaskMap,
}

impl TokioScheduler {
    /// Returns the scheduler and the receiving end of fired jobs
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimeoutJob>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            fired,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        };
        (scheduler, rx)
    }

    /// Jobs still sleeping
    #[cfg(test)]
    pub fn scheduled(&self) -> usize {
        lock(&self.tasks).len()
    }
}

fn lock(
    tasks: &TaskMap,
) -> std::sync::MutexGuard<'_, HashMap<(UserId, i64), AbortHandle>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TimeoutScheduler for TokioScheduler {
    fn schedule(&self, job: TimeoutJob, delay: Duration) {
        let key = (job.user_id, job.issued_at_ms);
        let fired = self.fired.clone();
        let tasks = self.tasks.clone();

        // Held until the handle is stored; a job with no delay removes itself only after that
        let mut scheduled = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&tasks).remove(&key);
            if fired.send(job).is_err() {
                tracing::debug!("Timeout dispatcher gone, dropping job");
            }
        });

        if let Some(previous) = scheduled.insert(key, handle.abort_handle()) {
            previous.abort();
        }
    }

    fn cancel(&self, user_id: UserId, issued_at_ms: i64) {
        if let Some(handle) = lock(&self.tasks).remove(&(user_id, issued_at_ms)) {
            handle.abort();
            tracing::debug!(user_id = %user_id, "Timeout cancelled");
        }
    }
}

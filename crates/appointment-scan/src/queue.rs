use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Tracks users currently inside an interactive booking flow so the check
/// cycle can suppress their notifications.
///
/// Shared between the executor (reads) and booking sessions (writes); all
/// access goes through one mutex. State is volatile: losing it on restart
/// only re-enables notifications.
pub struct QueueManager {
    entries: Mutex<HashMap<i64, Instant>>,
    timeout: Duration,
}

impl QueueManager {
    /// Create a manager whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<i64, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a user as booking. Idempotent; re-entry resets the clock.
    pub fn add(&self, user_id: i64) {
        self.entries().insert(user_id, Instant::now());
        info!(user_id, "user entered booking mode, notifications paused");
    }

    /// Unmark a user. No-op when absent.
    pub fn remove(&self, user_id: i64) {
        if self.entries().remove(&user_id).is_some() {
            info!(user_id, "user exited booking mode, notifications resumed");
        }
    }

    /// Whether the user's notifications are currently suppressed.
    ///
    /// Entries past the timeout count as inactive and are evicted on the
    /// spot, so no explicit `remove` is needed for abandoned sessions.
    pub fn is_active(&self, user_id: i64) -> bool {
        let mut entries = self.entries();

        match entries.get(&user_id) {
            None => false,
            Some(entered_at) if entered_at.elapsed() > self.timeout => {
                entries.remove(&user_id);
                debug!(user_id, "queue entry expired, evicted");
                false
            }
            Some(_) => true,
        }
    }

    /// Sweep all expired entries. Returns how many were evicted.
    pub fn cleanup_stale(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entered_at| entered_at.elapsed() <= self.timeout);
        before - entries.len()
    }

    /// Enter booking mode with scoped cleanup: dropping the returned guard
    /// removes the entry, whatever path the session exits through.
    pub fn enter(self: &Arc<Self>, user_id: i64) -> QueueGuard {
        self.add(user_id);
        QueueGuard {
            queue: Arc::clone(self),
            user_id,
        }
    }
}

/// Scoped queue membership; see [`QueueManager::enter`].
pub struct QueueGuard {
    queue: Arc<QueueManager>,
    user_id: i64,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.queue.remove(self.user_id);
    }
}

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use crate::notify::MessageChannel;

/// Operator-notification collaborator for health alerts.
#[async_trait]
pub trait OperatorAlert: Send + Sync {
    /// Deliver one alert. Failures must be swallowed by the implementation;
    /// monitoring never halts the scheduler.
    async fn alert(&self, message: &str);
}

/// Point-in-time view of the health counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    /// Failed cycles since the last success
    pub consecutive_failures: u32,
    /// When a cycle last succeeded
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Tracks consecutive check-cycle failures and pages the operator when the
/// streak crosses the configured threshold.
pub struct HealthMonitor {
    state: Mutex<HealthSnapshot>,
    threshold: u32,
    alert: Option<Arc<dyn OperatorAlert>>,
}

impl HealthMonitor {
    /// Create a monitor. Without an alert sink, crossings are only logged.
    pub fn new(threshold: u32, alert: Option<Arc<dyn OperatorAlert>>) -> Self {
        Self {
            state: Mutex::new(HealthSnapshot::default()),
            threshold: threshold.max(1),
            alert,
        }
    }

    /// Record one cycle outcome. Fires the alert exactly once per crossing;
    /// a success resets the streak so a new streak can page again.
    pub async fn record(&self, success: bool) {
        let crossed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if success {
                state.consecutive_failures = 0;
                state.last_success_at = Some(Utc::now());
                false
            } else {
                state.consecutive_failures += 1;
                state.consecutive_failures == self.threshold
            }
        };

        if crossed {
            warn!(
                threshold = self.threshold,
                "consecutive check failures crossed the alert threshold"
            );
            if let Some(alert) = &self.alert {
                alert
                    .alert(&format!(
                        "Appointment checks have failed {} times in a row.",
                        self.threshold
                    ))
                    .await;
            }
        }
    }

    /// Current counters, for status logging.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Routes operator alerts to an admin user over the normal message channel.
pub struct ChannelAlert {
    channel: Arc<dyn MessageChannel>,
    admin_user_id: i64,
}

impl ChannelAlert {
    /// Create an alert sink targeting the admin's user id.
    pub fn new(channel: Arc<dyn MessageChannel>, admin_user_id: i64) -> Self {
        Self {
            channel,
            admin_user_id,
        }
    }
}

#[async_trait]
impl OperatorAlert for ChannelAlert {
    async fn alert(&self, message: &str) {
        let text = format!("⚠️ Health Alert\n\n{message}");
        if let Err(e) = self.channel.send_message(self.admin_user_id, &text).await {
            error!("failed to deliver operator alert: {e}");
        }
    }
}

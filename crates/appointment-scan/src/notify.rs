use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::types::{AppointmentMatch, ChannelError};

// Public booking page, for users who prefer to book by hand.
const BOOKING_URL_BASE: &str =
    "https://stadt.muenchen.de/buergerservice/terminvereinbarung.html#/services";

// Display caps so a busy office does not produce a wall of text.
const MAX_DAYS_SHOWN: usize = 5;
const MAX_TIMES_SHOWN: usize = 5;

/// Delivery channel collaborator (e.g. a chat bot).
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Deliver one message to one user.
    async fn send_message(&self, user_id: i64, text: &str) -> Result<(), ChannelError>;
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Delivered
    Sent,
    /// Permanent failure; the user should be flagged for subscription cleanup
    Unreachable,
    /// Transient failure; a later cycle re-attempts if slots are still open
    Dropped,
}

/// Formats appointment matches and dispatches them over the channel.
pub struct Notifier {
    channel: Arc<dyn MessageChannel>,
    slot_display_offset: FixedOffset,
}

impl Notifier {
    /// Create a notifier over the given channel.
    pub fn new(channel: Arc<dyn MessageChannel>, config: &EngineConfig) -> Self {
        Self {
            channel,
            slot_display_offset: config.slot_display_offset,
        }
    }

    /// Send one alert for one matched user.
    ///
    /// Permanent failures are never retried; transient failures are dropped
    /// because the next cycle re-delivers while the condition persists.
    pub async fn notify_match(&self, user_id: i64, found: &AppointmentMatch) -> NotifyOutcome {
        let text = self.format_message(found);

        match self.channel.send_message(user_id, &text).await {
            Ok(()) => {
                info!(user_id, "sent appointment notification");
                NotifyOutcome::Sent
            }
            Err(ChannelError::Unreachable(reason)) => {
                warn!(user_id, %reason, "recipient unreachable, flagging for subscription cleanup");
                NotifyOutcome::Unreachable
            }
            Err(ChannelError::Transient(reason)) => {
                warn!(user_id, %reason, "transient delivery failure, dropping");
                NotifyOutcome::Dropped
            }
        }
    }

    fn format_message(&self, found: &AppointmentMatch) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "🎉 APPOINTMENT AVAILABLE! 🎉");
        let _ = writeln!(text);
        let _ = writeln!(
            text,
            "Service {} at office {}",
            found.service_id, found.office_id
        );
        let _ = writeln!(text);
        let _ = writeln!(text, "Available appointments:");

        for day in found.days.iter().take(MAX_DAYS_SHOWN) {
            if day.slots.is_empty() {
                let _ = writeln!(text, "📅 {}", day.date);
            } else {
                let times: Vec<String> = day
                    .slots
                    .iter()
                    .take(MAX_TIMES_SHOWN)
                    .map(|ts| self.format_time(*ts))
                    .collect();
                let _ = writeln!(text, "📅 {}: {}", day.date, times.join(", "));
            }
        }
        if found.days.len() > MAX_DAYS_SHOWN {
            let _ = writeln!(text, "... and {} more days", found.days.len() - MAX_DAYS_SHOWN);
        }

        let _ = writeln!(text);
        let _ = writeln!(
            text,
            "🔗 Book now: {}/{}/locations/{}",
            BOOKING_URL_BASE, found.service_id, found.office_id
        );
        let _ = writeln!(text);
        let _ = write!(text, "⚡ Act fast - appointments fill up quickly!");

        text
    }

    fn format_time(&self, unix_ts: i64) -> String {
        match DateTime::from_timestamp(unix_ts, 0) {
            Some(utc) => utc
                .with_timezone(&self.slot_display_offset)
                .format("%H:%M")
                .to_string(),
            None => unix_ts.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{Datelike, TimeZone};

    use super::*;
    use crate::types::MatchedDay;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(i64, String)>>,
        fail_with: Mutex<Option<ChannelError>>,
    }

    #[async_trait]
    impl MessageChannel for RecordingChannel {
        async fn send_message(&self, user_id: i64, text: &str) -> Result<(), ChannelError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            self.sent.lock().unwrap().push((user_id, text.to_string()));
            Ok(())
        }
    }

    fn slot(date: &str, hour: u32, minute: u32) -> i64 {
        let date: chrono::NaiveDate = date.parse().expect("test date");
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
            .single()
            .expect("valid test time")
            .timestamp()
    }

    fn sample_match() -> AppointmentMatch {
        AppointmentMatch {
            service_id: 500,
            office_id: 10,
            days: vec![MatchedDay {
                date: "2025-11-05".parse().expect("test date"),
                slots: vec![slot("2025-11-05", 9, 0), slot("2025-11-05", 9, 30)],
            }],
        }
    }

    #[tokio::test]
    async fn message_names_each_open_time() {
        let channel = Arc::new(RecordingChannel::default());
        let notifier = Notifier::new(channel.clone(), &EngineConfig::default());

        let outcome = notifier.notify_match(1, &sample_match()).await;
        assert_eq!(outcome, NotifyOutcome::Sent);

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert!(sent[0].1.contains("2025-11-05"));
        assert!(sent[0].1.contains("09:00"));
        assert!(sent[0].1.contains("09:30"));
        assert!(sent[0].1.contains("/services/500/locations/10"));
    }

    #[tokio::test]
    async fn unreachable_recipient_is_reported_not_retried() {
        let channel = Arc::new(RecordingChannel::default());
        *channel.fail_with.lock().unwrap() =
            Some(ChannelError::Unreachable("blocked".to_string()));

        let notifier = Notifier::new(channel.clone(), &EngineConfig::default());
        let outcome = notifier.notify_match(1, &sample_match()).await;

        assert_eq!(outcome, NotifyOutcome::Unreachable);
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_dropped() {
        let channel = Arc::new(RecordingChannel::default());
        *channel.fail_with.lock().unwrap() = Some(ChannelError::Transient("flood".to_string()));

        let notifier = Notifier::new(channel.clone(), &EngineConfig::default());
        let outcome = notifier.notify_match(1, &sample_match()).await;

        assert_eq!(outcome, NotifyOutcome::Dropped);
    }

    #[tokio::test]
    async fn long_day_lists_are_capped() {
        let channel = Arc::new(RecordingChannel::default());
        let notifier = Notifier::new(channel.clone(), &EngineConfig::default());

        let days: Vec<MatchedDay> = (1..=8)
            .map(|d| MatchedDay {
                date: format!("2025-11-{d:02}").parse().expect("test date"),
                slots: vec![],
            })
            .collect();
        let found = AppointmentMatch {
            service_id: 500,
            office_id: 10,
            days,
        };

        notifier.notify_match(1, &found).await;

        let sent = channel.sent.lock().unwrap();
        assert!(sent[0].1.contains("... and 3 more days"));
        assert!(!sent[0].1.contains("2025-11-06"));
    }
}

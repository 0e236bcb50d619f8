use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use muenchen_api::AvailableDay;

use crate::config::EngineConfig;
use crate::health::HealthMonitor;
use crate::notify::{Notifier, NotifyOutcome};
use crate::queue::QueueManager;
use crate::token::TokenProvider;
use crate::types::{
    AppointmentMatch, AvailabilityError, CheckError, CheckTarget, DateRange, MatchedDay,
    StoreError, Subscription, Watcher,
};

// Cadence of the expired-suppression sweep, in cycles.
const QUEUE_SWEEP_CADENCE: u64 = 5;

/// Availability side of the external scheduling service.
#[async_trait]
pub trait AvailabilityClient: Send + Sync {
    /// Open days for one (service, office) pair in a date range.
    async fn available_days(
        &self,
        service_id: i64,
        office_id: i64,
        range: &DateRange,
        token: &str,
    ) -> Result<Vec<AvailableDay>, AvailabilityError>;

    /// Open time slots (unix timestamps) for one day.
    async fn available_slots(
        &self,
        service_id: i64,
        office_id: i64,
        date: NaiveDate,
        token: &str,
    ) -> Result<Vec<i64>, AvailabilityError>;
}

/// Persistence collaborator. Subscriptions are owned elsewhere; the engine
/// only reads them and appends to the appointment log.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// All current subscriptions.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Subscribed user ids grouped by (service_id, office_id).
    async fn group_by_service_office(&self)
    -> Result<HashMap<(i64, i64), Vec<i64>>, StoreError>;

    /// The user's acceptable date range (with the collaborator's defaults
    /// applied when the user never set one).
    async fn user_date_range(&self, user_id: i64) -> Result<DateRange, StoreError>;

    /// Record that open appointments were seen for a (service, office) pair.
    async fn log_appointment(
        &self,
        service_id: i64,
        office_id: i64,
        found_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Aggregate outcome of one check cycle.
#[derive(Debug, Default, Serialize)]
pub struct CycleReport {
    /// Distinct (service, office) groups processed
    pub groups: usize,
    /// Groups whose check failed after retries
    pub failed_groups: usize,
    /// Notifications delivered
    pub notified: usize,
    /// Matches withheld because the user is booking
    pub suppressed: usize,
    /// Users flagged by the channel as permanently unreachable
    pub unreachable_users: Vec<i64>,
    /// The cycle never reached group processing (store or token failure)
    pub aborted: bool,
}

impl CycleReport {
    /// Cycle-level verdict submitted to the health monitor. A cycle fails
    /// when it aborts or when every single group failed; partial group
    /// failures are contained and only logged.
    pub fn is_success(&self) -> bool {
        !self.aborted && (self.groups == 0 || self.failed_groups < self.groups)
    }
}

/// Periodic check engine: groups subscriptions, queries availability once
/// per (service, office) pair, and fans matches out to non-suppressed users.
pub struct CheckExecutor {
    store: Arc<dyn SubscriptionStore>,
    availability: Arc<dyn AvailabilityClient>,
    tokens: Arc<TokenProvider>,
    queue: Arc<QueueManager>,
    notifier: Arc<Notifier>,
    health: Arc<HealthMonitor>,
    config: EngineConfig,
    cycles: AtomicU64,
}

impl CheckExecutor {
    /// Wire up an executor. Shared state (tokens, queue, health) arrives
    /// injected; nothing here reaches through globals.
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        availability: Arc<dyn AvailabilityClient>,
        tokens: Arc<TokenProvider>,
        queue: Arc<QueueManager>,
        notifier: Arc<Notifier>,
        health: Arc<HealthMonitor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            availability,
            tokens,
            queue,
            notifier,
            health,
            config,
            cycles: AtomicU64::new(0),
        }
    }

    /// Run the check loop forever.
    ///
    /// The loop body awaits the whole cycle, and missed ticks are skipped,
    /// so cycles never overlap: at most one cycle's worth of external load
    /// is in flight at any time.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            "starting appointment check loop"
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            self.health.record(report.is_success()).await;
        }
    }

    /// One full pass over all subscription groups.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut report = CycleReport::default();

        if cycle % QUEUE_SWEEP_CADENCE == 0 {
            let evicted = self.queue.cleanup_stale();
            if evicted > 0 {
                info!(evicted, "evicted expired booking-queue entries");
            }
        }

        let groups = match self.store.group_by_service_office().await {
            Ok(groups) => groups,
            Err(e) => {
                error!("failed to load subscriptions: {e}");
                report.aborted = true;
                return report;
            }
        };

        if groups.is_empty() {
            debug!("no service subscriptions, skipping check");
            return report;
        }

        // Refresh proactively before any availability call this cycle so the
        // token cannot expire mid-cycle.
        if let Err(e) = self.tokens.ensure_fresh().await {
            error!("could not obtain access token: {e}");
            report.aborted = true;
            return report;
        }

        report.groups = groups.len();

        for ((service_id, office_id), user_ids) in groups {
            let target = match self.build_target(service_id, office_id, user_ids).await {
                Ok(target) => target,
                Err(e) => {
                    warn!(service_id, office_id, "failed to resolve watchers: {e}");
                    report.failed_groups += 1;
                    continue;
                }
            };

            // Failures stay contained to this group; the rest of the cycle
            // proceeds.
            if let Err(e) = self.check_group(&target, &mut report).await {
                warn!(service_id, office_id, "group check failed: {e}");
                report.failed_groups += 1;
            }
        }

        info!(
            groups = report.groups,
            failed = report.failed_groups,
            notified = report.notified,
            suppressed = report.suppressed,
            "check cycle complete"
        );
        report
    }

    async fn build_target(
        &self,
        service_id: i64,
        office_id: i64,
        user_ids: Vec<i64>,
    ) -> Result<CheckTarget, StoreError> {
        let mut watchers = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let range = self.store.user_date_range(user_id).await?;
            watchers.push(Watcher { user_id, range });
        }

        Ok(CheckTarget {
            service_id,
            office_id,
            watchers,
        })
    }

    async fn check_group(
        &self,
        target: &CheckTarget,
        report: &mut CycleReport,
    ) -> Result<(), CheckError> {
        let Some(union) = target.union_range() else {
            return Ok(());
        };

        let token = self.tokens.ensure_fresh().await?;
        let days = self.query_days_with_retry(target, &union, &token).await?;

        if days.is_empty() {
            debug!(
                service_id = target.service_id,
                office_id = target.office_id,
                "no appointments available"
            );
            return Ok(());
        }

        info!(
            service_id = target.service_id,
            office_id = target.office_id,
            days = days.len(),
            watchers = target.watchers.len(),
            "appointments found"
        );

        if let Err(e) = self
            .store
            .log_appointment(target.service_id, target.office_id, Utc::now())
            .await
        {
            warn!("failed to log appointment find: {e}");
        }

        // One slot fetch per group serves every subscriber of the pair.
        let days_with_slots = self.fetch_slots(target, &days, &token).await;

        for watcher in &target.watchers {
            let mine: Vec<MatchedDay> = days_with_slots
                .iter()
                .filter(|day| watcher.range.contains(day.date))
                .cloned()
                .collect();
            if mine.is_empty() {
                continue;
            }

            // Who-gets-notified is decided here, atomically against this
            // group's result; suppressed matches are not re-attempted this
            // cycle.
            if self.queue.is_active(watcher.user_id) {
                debug!(
                    user_id = watcher.user_id,
                    "suppressing notification, booking in progress"
                );
                report.suppressed += 1;
                continue;
            }

            let found = AppointmentMatch {
                service_id: target.service_id,
                office_id: target.office_id,
                days: mine,
            };
            match self.notifier.notify_match(watcher.user_id, &found).await {
                NotifyOutcome::Sent => report.notified += 1,
                NotifyOutcome::Unreachable => report.unreachable_users.push(watcher.user_id),
                NotifyOutcome::Dropped => {}
            }
        }

        Ok(())
    }

    // Token rejection forces a refresh and one retry with the fresh token;
    // transient network errors get one retry as-is. Anything else fails the
    // group.
    async fn query_days_with_retry(
        &self,
        target: &CheckTarget,
        range: &DateRange,
        token: &str,
    ) -> Result<Vec<AvailableDay>, CheckError> {
        match self
            .availability
            .available_days(target.service_id, target.office_id, range, token)
            .await
        {
            Ok(days) => Ok(days),
            Err(AvailabilityError::TokenRejected) => {
                warn!("availability query rejected the token, deriving a fresh one");
                self.tokens.invalidate().await;
                let fresh = self.tokens.ensure_fresh().await?;
                Ok(self
                    .availability
                    .available_days(target.service_id, target.office_id, range, &fresh)
                    .await?)
            }
            Err(AvailabilityError::Network(e)) => {
                debug!("transient availability error, retrying once: {e}");
                Ok(self
                    .availability
                    .available_days(target.service_id, target.office_id, range, token)
                    .await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    // Slot-fetch failures degrade to a date-only notification rather than
    // failing the group.
    async fn fetch_slots(
        &self,
        target: &CheckTarget,
        days: &[AvailableDay],
        token: &str,
    ) -> Vec<MatchedDay> {
        let mut out = Vec::with_capacity(days.len());

        for (i, day) in days.iter().enumerate() {
            let slots = if i < self.config.max_slot_days {
                match self
                    .availability
                    .available_slots(target.service_id, target.office_id, day.date, token)
                    .await
                {
                    Ok(slots) => slots,
                    Err(e) => {
                        debug!(date = %day.date, "slot fetch failed: {e}");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            out.push(MatchedDay {
                date: day.date,
                slots,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use chrono::FixedOffset;
    use sha2::{Digest, Sha256};

    use muenchen_api::{CaptchaChallenge, PowSolution};

    use super::*;
    use crate::notify::MessageChannel;
    use crate::token::{AccessToken, ChallengeAuthority};
    use crate::types::{ChannelError, TokenError};

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("test date")
    }

    fn ts(day: &str, hour: u32, minute: u32) -> i64 {
        use chrono::{Datelike, TimeZone};
        let day = date(day);
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(day.year(), day.month(), day.day(), hour, minute, 0)
            .single()
            .expect("valid test time")
            .timestamp()
    }

    struct FixedStore {
        groups: HashMap<(i64, i64), Vec<i64>>,
        ranges: HashMap<i64, DateRange>,
        logged: Arc<AtomicU32>,
    }

    impl FixedStore {
        fn single_subscription() -> Self {
            let mut groups = HashMap::new();
            groups.insert((500, 10), vec![1]);
            let mut ranges = HashMap::new();
            ranges.insert(1, DateRange::new(date("2025-11-01"), date("2025-11-10")));
            Self {
                groups,
                ranges,
                logged: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl SubscriptionStore for FixedStore {
        async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
            Ok(Vec::new())
        }

        async fn group_by_service_office(
            &self,
        ) -> Result<HashMap<(i64, i64), Vec<i64>>, StoreError> {
            Ok(self.groups.clone())
        }

        async fn user_date_range(&self, user_id: i64) -> Result<DateRange, StoreError> {
            self.ranges
                .get(&user_id)
                .copied()
                .ok_or_else(|| StoreError::Backend(format!("no user {user_id}")))
        }

        async fn log_appointment(
            &self,
            _service_id: i64,
            _office_id: i64,
            _found_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.logged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Availability stub: service 500 at office 10 has 2025-11-05 open with
    /// two morning slots; everything else is empty or scripted to fail.
    struct ScriptedAvailability {
        tokens_seen: Mutex<Vec<String>>,
        reject_first_token: Mutex<bool>,
        failing_service: Option<i64>,
    }

    impl ScriptedAvailability {
        fn new() -> Self {
            Self {
                tokens_seen: Mutex::new(Vec::new()),
                reject_first_token: Mutex::new(false),
                failing_service: None,
            }
        }
    }

    #[async_trait]
    impl AvailabilityClient for ScriptedAvailability {
        async fn available_days(
            &self,
            service_id: i64,
            _office_id: i64,
            _range: &DateRange,
            token: &str,
        ) -> Result<Vec<AvailableDay>, AvailabilityError> {
            if self.failing_service == Some(service_id) {
                return Err(AvailabilityError::Api("scripted failure".to_string()));
            }

            {
                let mut reject = self.reject_first_token.lock().unwrap();
                if *reject {
                    *reject = false;
                    return Err(AvailabilityError::TokenRejected);
                }
            }

            self.tokens_seen.lock().unwrap().push(token.to_string());

            if service_id == 500 {
                Ok(vec![AvailableDay {
                    date: date("2025-11-05"),
                    provider_ids: "10".to_string(),
                }])
            } else {
                Ok(Vec::new())
            }
        }

        async fn available_slots(
            &self,
            _service_id: i64,
            _office_id: i64,
            _date: NaiveDate,
            _token: &str,
        ) -> Result<Vec<i64>, AvailabilityError> {
            Ok(vec![ts("2025-11-05", 9, 0), ts("2025-11-05", 9, 30)])
        }
    }

    struct SolvableAuthority {
        fetches: AtomicU32,
    }

    impl SolvableAuthority {
        fn new() -> Self {
            Self {
                fetches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChallengeAuthority for SolvableAuthority {
        async fn fetch_challenge(&self) -> Result<CaptchaChallenge, TokenError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut hasher = Sha256::new();
            hasher.update(b"salt");
            hasher.update(b"9");
            Ok(CaptchaChallenge {
                algorithm: "SHA-256".to_string(),
                challenge: hex::encode(hasher.finalize()),
                max_number: 100,
                salt: "salt".to_string(),
                signature: "sig".to_string(),
            })
        }

        async fn verify_solution(&self, _: &PowSolution) -> Result<String, TokenError> {
            Ok(format!("fresh-{}", self.fetches.load(Ordering::SeqCst)))
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl MessageChannel for RecordingChannel {
        async fn send_message(&self, user_id: i64, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push((user_id, text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        executor: CheckExecutor,
        queue: Arc<QueueManager>,
        channel: Arc<RecordingChannel>,
        authority: Arc<SolvableAuthority>,
        tokens: Arc<TokenProvider>,
        availability: Arc<ScriptedAvailability>,
    }

    fn harness(store: FixedStore, availability: ScriptedAvailability) -> Harness {
        let config = EngineConfig::default();
        let queue = Arc::new(QueueManager::new(config.queue_timeout));
        let channel = Arc::new(RecordingChannel::default());
        let authority = Arc::new(SolvableAuthority::new());
        let tokens = Arc::new(TokenProvider::new(authority.clone(), &config));
        let availability = Arc::new(availability);

        let executor = CheckExecutor::new(
            Arc::new(store),
            availability.clone(),
            tokens.clone(),
            queue.clone(),
            Arc::new(Notifier::new(channel.clone(), &config)),
            Arc::new(HealthMonitor::new(config.health_alert_threshold, None)),
            config,
        );

        Harness {
            executor,
            queue,
            channel,
            authority,
            tokens,
            availability,
        }
    }

    #[tokio::test]
    async fn matched_user_gets_exactly_one_notification_naming_the_times() {
        let store = FixedStore::single_subscription();
        let logged = store.logged.clone();
        let h = harness(store, ScriptedAvailability::new());

        let report = h.executor.run_cycle().await;
        assert_eq!(logged.load(Ordering::SeqCst), 1);

        assert!(report.is_success());
        assert_eq!(report.notified, 1);
        assert_eq!(report.suppressed, 0);

        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert!(sent[0].1.contains("2025-11-05"));
        assert!(sent[0].1.contains("09:00"));
        assert!(sent[0].1.contains("09:30"));
    }

    #[tokio::test]
    async fn active_queue_entry_suppresses_the_notification() {
        let h = harness(FixedStore::single_subscription(), ScriptedAvailability::new());

        h.queue.add(1);
        let report = h.executor.run_cycle().await;

        assert_eq!(report.notified, 0);
        assert_eq!(report.suppressed, 1);
        assert!(h.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slots_outside_the_user_range_do_not_notify() {
        let mut store = FixedStore::single_subscription();
        store
            .ranges
            .insert(1, DateRange::new(date("2025-12-01"), date("2025-12-10")));

        let h = harness(store, ScriptedAvailability::new());
        let report = h.executor.run_cycle().await;

        assert_eq!(report.notified, 0);
        assert!(h.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_token_is_refreshed_before_any_availability_call() {
        let h = harness(FixedStore::single_subscription(), ScriptedAvailability::new());

        // Token aged past the 4.5 minute margin.
        let now = Utc::now();
        h.tokens
            .seed_for_tests(AccessToken {
                value: "stale".to_string(),
                issued_at: now - chrono::Duration::seconds(300),
                expires_at: now,
            })
            .await;

        h.executor.run_cycle().await;

        assert_eq!(h.authority.fetches.load(Ordering::SeqCst), 1);
        // Every availability call carried the fresh token, never the stale one.
        let tokens_seen = h.availability.tokens_seen.lock().unwrap();
        assert!(!tokens_seen.is_empty());
        assert!(tokens_seen.iter().all(|t| t == "fresh-1"));
        assert_eq!(h.channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn token_rejection_forces_refresh_and_retries_the_group() {
        let availability = ScriptedAvailability::new();
        *availability.reject_first_token.lock().unwrap() = true;

        let h = harness(FixedStore::single_subscription(), availability);
        let report = h.executor.run_cycle().await;

        assert!(report.is_success());
        assert_eq!(report.notified, 1);
        // Initial derivation plus the forced refresh.
        assert_eq!(h.authority.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_failing_group_does_not_abort_the_others() {
        let mut store = FixedStore::single_subscription();
        store.groups.insert((600, 11), vec![2]);
        store
            .ranges
            .insert(2, DateRange::new(date("2025-11-01"), date("2025-11-10")));

        let availability = ScriptedAvailability {
            failing_service: Some(600),
            ..ScriptedAvailability::new()
        };

        let h = harness(store, availability);
        let report = h.executor.run_cycle().await;

        assert_eq!(report.groups, 2);
        assert_eq!(report.failed_groups, 1);
        assert_eq!(report.notified, 1);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn empty_subscription_set_skips_quietly() {
        let store = FixedStore {
            groups: HashMap::new(),
            ranges: HashMap::new(),
            logged: Arc::new(AtomicU32::new(0)),
        };
        let h = harness(store, ScriptedAvailability::new());

        let report = h.executor.run_cycle().await;
        assert!(report.is_success());
        assert_eq!(report.groups, 0);
        // No token derivation for an idle cycle.
        assert_eq!(h.authority.fetches.load(Ordering::SeqCst), 0);
    }
}

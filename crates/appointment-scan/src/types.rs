use chrono::NaiveDate;

use muenchen_api::ApiError;

/// Inclusive date range a user wants an appointment in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// First acceptable date
    pub start: NaiveDate,
    /// Last acceptable date
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range; `end` before `start` is normalized by swapping.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    /// Whether `date` falls inside the range (inclusive on both ends).
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A user's interest in one (service, office) pair.
///
/// Owned by the persistence collaborator; the engine only reads these.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribed user
    pub user_id: i64,
    /// Service being watched
    pub service_id: i64,
    /// Office being watched
    pub office_id: i64,
    /// Dates the user would accept
    pub range: DateRange,
}

/// One subscriber inside a check target.
#[derive(Debug, Clone)]
pub struct Watcher {
    /// Subscribed user
    pub user_id: i64,
    /// Dates the user would accept
    pub range: DateRange,
}

/// Ephemeral per-cycle aggregate: all watchers of one (service, office) pair.
///
/// Recomputed every cycle, never persisted.
#[derive(Debug, Clone)]
pub struct CheckTarget {
    /// Service being checked
    pub service_id: i64,
    /// Office being checked
    pub office_id: i64,
    /// Subscribers with their individual date ranges
    pub watchers: Vec<Watcher>,
}

impl CheckTarget {
    /// Union of all watcher ranges; one availability query serves everyone.
    pub fn union_range(&self) -> Option<DateRange> {
        let mut watchers = self.watchers.iter();
        let first = watchers.next()?.range;
        Some(watchers.fold(first, |acc, w| acc.union(&w.range)))
    }
}

/// An open day with the time slots fetched for it (unix timestamps).
#[derive(Debug, Clone)]
pub struct MatchedDay {
    /// The open date
    pub date: NaiveDate,
    /// Open slots; may be empty when the slot fetch was skipped or failed
    pub slots: Vec<i64>,
}

/// What one user gets notified about after intersection with their range.
#[derive(Debug, Clone)]
pub struct AppointmentMatch {
    /// Service the slots belong to
    pub service_id: i64,
    /// Office the slots belong to
    pub office_id: i64,
    /// Open days inside the user's range
    pub days: Vec<MatchedDay>,
}

/// Errors from deriving a proof-of-work access token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The challenge endpoint failed
    #[error("challenge request failed: {0}")]
    Challenge(#[source] ApiError),

    /// The attempt budget ran out before a nonce matched
    #[error("no nonce satisfied the challenge within {0} attempts")]
    Exhausted(u64),

    /// The authority rejected the submitted solution
    #[error("solution verification failed: {0}")]
    Verify(#[source] ApiError),

    /// The blocking solver task died or the pool was closed
    #[error("solver worker failed: {0}")]
    Worker(String),
}

/// Errors from availability queries.
#[derive(Debug, thiserror::Error)]
pub enum AvailabilityError {
    /// Transient transport failure; a retry may succeed
    #[error("network error: {0}")]
    Network(String),

    /// The access token was rejected; a fresh derivation is required
    #[error("access token rejected")]
    TokenRejected,

    /// Any other error the availability API reported
    #[error("availability API error: {0}")]
    Api(String),
}

impl From<ApiError> for AvailabilityError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(err) => AvailabilityError::Network(err.to_string()),
            ApiError::TokenRejected => AvailabilityError::TokenRejected,
            other => AvailabilityError::Api(other.to_string()),
        }
    }
}

/// Errors from the three-step booking transaction.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    /// The slot was taken between display and reservation
    #[error("appointment slot no longer available")]
    Conflict,

    /// The booking API rejected the request
    #[error("booking rejected: {0}")]
    Rejected(String),

    /// Transient transport failure
    #[error("network error: {0}")]
    Network(String),
}

impl From<ApiError> for BookingError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Conflict => BookingError::Conflict,
            ApiError::Network(err) => BookingError::Network(err.to_string()),
            ApiError::TokenRejected => BookingError::Rejected("access token rejected".to_string()),
            other => BookingError::Rejected(other.to_string()),
        }
    }
}

/// Errors from the notification channel collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The recipient cannot be reached at all; never retried
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    /// Delivery failed for now; a later cycle will re-attempt
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

/// Errors from the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store failed
    #[error("store error: {0}")]
    Backend(String),

    /// A stored row could not be interpreted
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Errors inside one check cycle.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// Token lifecycle failure
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Subscription loading failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Availability query failure
    #[error(transparent)]
    Availability(#[from] AvailabilityError),
}

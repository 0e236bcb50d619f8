use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Proof-of-work challenge issued by the `captcha-challenge/` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaChallenge {
    /// Hash algorithm the challenge was built with (the API issues SHA-256)
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Hex digest the solver must reproduce
    pub challenge: String,

    /// Upper bound of the nonce search space
    #[serde(rename = "maxnumber", default = "default_max_number")]
    pub max_number: u64,

    /// Salt prepended to the nonce before hashing
    pub salt: String,

    /// Server-side signature, echoed back unmodified
    pub signature: String,
}

fn default_algorithm() -> String {
    "SHA-256".to_string()
}

fn default_max_number() -> u64 {
    10_000_000
}

/// Solved challenge, submitted to `captcha-verify/` for a token.
#[derive(Debug, Clone, Serialize)]
pub struct PowSolution {
    /// Algorithm echoed from the challenge
    pub algorithm: String,
    /// Target digest echoed from the challenge
    pub challenge: String,
    /// Nonce that reproduces the target digest
    pub number: u64,
    /// Salt echoed from the challenge
    pub salt: String,
    /// Signature echoed from the challenge
    pub signature: String,
    /// Solve time in milliseconds
    pub took: u64,
}

/// Response envelope from `captcha-verify/`.
#[derive(Debug, Deserialize)]
pub struct CaptchaVerifyResponse {
    /// Request-level success flag
    #[serde(default)]
    pub meta: VerifyMeta,
    /// Solution validity flag
    #[serde(default)]
    pub data: VerifyData,
    /// The JWT authorizing subsequent calls, present on success
    pub token: Option<String>,
}

/// `meta` object of the verify response
#[derive(Debug, Default, Deserialize)]
pub struct VerifyMeta {
    /// Whether the request itself succeeded
    #[serde(default)]
    pub success: bool,
}

/// `data` object of the verify response
#[derive(Debug, Default, Deserialize)]
pub struct VerifyData {
    /// Whether the submitted solution was accepted
    #[serde(default)]
    pub valid: bool,
}

/// One open day as returned by `available-days-by-office/`.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailableDay {
    /// The open date (the API names this field `time`)
    #[serde(rename = "time")]
    pub date: NaiveDate,

    /// Offices providing the day, comma separated
    #[serde(rename = "providerIDs", default)]
    pub provider_ids: String,
}

/// Response from `available-days-by-office/`.
///
/// The API reports "nothing free" through `errorCode` rather than an empty
/// list, so both shapes are represented here.
#[derive(Debug, Default, Deserialize)]
pub struct AvailableDaysResponse {
    /// Days with at least one open slot
    #[serde(rename = "availableDays", default)]
    pub available_days: Vec<AvailableDay>,

    /// Error code, e.g. `noAppointmentForThisScope` or a captcha rejection
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,

    /// Human-readable error detail
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
}

/// Response from `available-appointments-by-office/`.
#[derive(Debug, Default, Deserialize)]
pub struct SlotsResponse {
    /// Per-office slot lists
    #[serde(default)]
    pub offices: Vec<OfficeSlots>,
}

/// Slots for a single office on the queried date.
#[derive(Debug, Deserialize)]
pub struct OfficeSlots {
    /// Office the slots belong to
    #[serde(rename = "officeId")]
    pub office_id: i64,

    /// Open slots as unix timestamps
    #[serde(default)]
    pub appointments: Vec<i64>,
}

/// Handle returned by `reserve-appointment/`.
///
/// `process_id` and `auth_key` authorize the update and preconfirm steps of
/// the same booking transaction and nothing else.
#[derive(Debug, Clone, Deserialize)]
pub struct Reservation {
    /// Process identifier of the pending reservation
    #[serde(rename = "processId")]
    pub process_id: i64,

    /// Authorization key paired with the process id
    #[serde(rename = "authKey")]
    pub auth_key: String,

    /// Slot timestamp as echoed by the API (passed through verbatim)
    #[serde(default)]
    pub timestamp: serde_json::Value,

    /// Scope object describing service and provider (passed through verbatim)
    #[serde(default)]
    pub scope: serde_json::Value,
}

/// Error taxonomy for the citizen API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Transport-level failure, retryable
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The captcha token was rejected; a fresh derivation is required
    #[error("captcha token rejected")]
    TokenRejected,

    /// The slot was taken between display and reservation
    #[error("appointment slot no longer available")]
    Conflict,

    /// Any other error the API reported
    #[error("API error: {0}")]
    Api(String),

    /// Response did not match the expected shape
    #[error("unexpected response format: {0}")]
    Format(String),
}

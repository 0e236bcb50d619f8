use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::types::{ApiError, CaptchaChallenge, CaptchaVerifyResponse, PowSolution};

/// Production base URL of the citizen appointment API.
pub const DEFAULT_BASE_URL: &str = "https://www48.muenchen.de/buergeransicht/api/citizen";

const ORIGIN: &str = "https://stadt.muenchen.de";
const REFERER: &str = "https://stadt.muenchen.de/";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/26.0.1 Safari/605.1.15";

/// HTTP client for the citizen appointment API.
///
/// The API refuses requests without the browser-shaped Origin/Referer
/// headers, so every request carries them.
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client against the production API.
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create a client against a custom base URL (tests, proxies).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(ApiError::Network)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        debug!("GET {endpoint}");

        let response = self
            .http
            .get(self.url(endpoint))
            .query(params)
            .header("Accept", "application/json")
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        Self::decode(endpoint, response).await
    }

    pub(crate) async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        debug!("POST {endpoint}");

        let response = self
            .http
            .post(self.url(endpoint))
            .json(body)
            .header("Accept", "application/json")
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        Self::decode(endpoint, response).await
    }

    async fn decode<T: DeserializeOwned>(
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("HTTP {status} for {endpoint}: {}", body.chars().take(200).collect::<String>());

            return Err(match status.as_u16() {
                401 | 403 => ApiError::TokenRejected,
                409 => ApiError::Conflict,
                _ => ApiError::Api(format!("HTTP {status} for {endpoint}")),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Format(format!("{endpoint}: {e}")))
    }

    /// Fetch a fresh proof-of-work challenge.
    pub async fn captcha_challenge(&self) -> Result<CaptchaChallenge, ApiError> {
        let challenge: CaptchaChallenge = self.get_json("captcha-challenge/", &[]).await?;
        debug!(
            max_number = challenge.max_number,
            "captcha challenge received"
        );
        Ok(challenge)
    }

    /// Submit a solved challenge and exchange it for a JWT.
    ///
    /// The API expects the solution as a base64-encoded JSON payload.
    pub async fn captcha_verify(&self, solution: &PowSolution) -> Result<String, ApiError> {
        let solution_json = serde_json::to_string(solution)
            .map_err(|e| ApiError::Format(format!("solution payload: {e}")))?;
        let payload = BASE64.encode(solution_json.as_bytes());

        let body = serde_json::json!({ "payload": payload });
        let result: CaptchaVerifyResponse = self.post_json("captcha-verify/", &body).await?;

        if result.meta.success && result.data.valid {
            result
                .token
                .ok_or_else(|| ApiError::Format("verify response missing token".to_string()))
        } else {
            Err(ApiError::Api("captcha verification rejected".to_string()))
        }
    }
}

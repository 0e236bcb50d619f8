use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info};

use muenchen_api::{CaptchaChallenge, PowSolution};

use crate::config::EngineConfig;
use crate::types::TokenError;

/// Proof-of-work access token with its derivation timestamps.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// The JWT sent along with API calls
    pub value: String,
    /// When the derivation completed
    pub issued_at: DateTime<Utc>,
    /// When the authority is assumed to stop accepting it
    pub expires_at: DateTime<Utc>,
}

/// External authority issuing challenges and exchanging solutions for tokens.
#[async_trait]
pub trait ChallengeAuthority: Send + Sync {
    /// Fetch a fresh challenge.
    async fn fetch_challenge(&self) -> Result<CaptchaChallenge, TokenError>;

    /// Submit a solution; returns the token on acceptance.
    async fn verify_solution(&self, solution: &PowSolution) -> Result<String, TokenError>;
}

/// Derives and caches the process-wide access token.
///
/// The nonce search is CPU-bound and runs on `spawn_blocking` behind a small
/// semaphore, so concurrent derivations can never occupy more than
/// `pow_workers` blocking threads while polling and sessions keep running.
pub struct TokenProvider {
    authority: Arc<dyn ChallengeAuthority>,
    current: RwLock<Option<AccessToken>>,
    pow_slots: Arc<Semaphore>,
    validity: chrono::Duration,
    refresh_margin: chrono::Duration,
}

impl TokenProvider {
    /// Create a provider with no cached token.
    pub fn new(authority: Arc<dyn ChallengeAuthority>, config: &EngineConfig) -> Self {
        Self {
            authority,
            current: RwLock::new(None),
            pow_slots: Arc::new(Semaphore::new(config.pow_workers.max(1))),
            validity: chrono::Duration::from_std(config.token_validity)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            refresh_margin: chrono::Duration::from_std(config.token_refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(270)),
        }
    }

    /// Return the cached token, re-deriving once its age passes the refresh
    /// margin. Called before each check cycle and before booking confirms so
    /// a token cannot expire mid-operation.
    pub async fn ensure_fresh(&self) -> Result<String, TokenError> {
        {
            let current = self.current.read().await;
            if let Some(token) = current.as_ref() {
                if Utc::now() < token.issued_at + self.refresh_margin {
                    return Ok(token.value.clone());
                }
                debug!("access token past refresh margin, deriving a new one");
            }
        }

        self.derive().await
    }

    /// Drop the cached token so the next `ensure_fresh` derives a new one.
    /// Used when the availability API rejects the current token.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    /// Full derivation: fetch challenge, solve on the worker pool, verify.
    pub async fn derive(&self) -> Result<String, TokenError> {
        let challenge = self.authority.fetch_challenge().await?;
        let max_number = challenge.max_number;
        debug!(max_number, "solving proof-of-work challenge");

        let permit = self
            .pow_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TokenError::Worker("solver pool closed".to_string()))?;

        let solution = tokio::task::spawn_blocking(move || {
            let solution = solve_challenge(&challenge);
            drop(permit);
            solution
        })
        .await
        .map_err(|e| TokenError::Worker(e.to_string()))?
        .ok_or(TokenError::Exhausted(max_number))?;

        info!(
            nonce = solution.number,
            took_ms = solution.took,
            "proof-of-work challenge solved"
        );

        let value = self.authority.verify_solution(&solution).await?;

        let now = Utc::now();
        let token = AccessToken {
            value: value.clone(),
            issued_at: now,
            expires_at: now + self.validity,
        };
        *self.current.write().await = Some(token);

        info!("fresh access token derived");
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) async fn seed_for_tests(&self, token: AccessToken) {
        *self.current.write().await = Some(token);
    }
}

/// Search the nonce space for the number whose salted hash reproduces the
/// challenge digest. Bounded by the challenge's own `max_number` budget.
fn solve_challenge(challenge: &CaptchaChallenge) -> Option<PowSolution> {
    let started = Instant::now();
    let target = challenge.challenge.to_ascii_lowercase();

    for number in 0..challenge.max_number {
        let mut hasher = Sha256::new();
        hasher.update(challenge.salt.as_bytes());
        hasher.update(number.to_string().as_bytes());

        if hex::encode(hasher.finalize()) == target {
            return Some(PowSolution {
                algorithm: challenge.algorithm.clone(),
                challenge: challenge.challenge.clone(),
                number,
                salt: challenge.salt.clone(),
                signature: challenge.signature.clone(),
                took: started.elapsed().as_millis() as u64,
            });
        }
    }

    None
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::ValidateEmail;

use muenchen_api::Reservation;

use crate::config::{ConflictPolicy, EngineConfig};
use crate::queue::{QueueGuard, QueueManager};
use crate::token::TokenProvider;
use crate::types::{BookingError, TokenError};

/// External booking API: three sequential operations, each depending on the
/// previous response.
#[async_trait]
pub trait BookingApi: Send + Sync {
    /// Step 1: reserve the slot. The returned handle authorizes the next two
    /// steps of this transaction only.
    async fn reserve(
        &self,
        slot_timestamp: i64,
        service_id: i64,
        office_id: i64,
        token: &str,
    ) -> Result<Reservation, BookingError>;

    /// Step 2: attach applicant data to the reservation.
    async fn update(
        &self,
        reservation: &Reservation,
        name: &str,
        email: &str,
        service_id: i64,
        office_id: i64,
    ) -> Result<(), BookingError>;

    /// Step 3: preconfirm; the external service mails the applicant a
    /// confirmation link, so success means "preconfirmed" only.
    async fn preconfirm(
        &self,
        reservation: &Reservation,
        name: &str,
        email: &str,
        service_id: i64,
        office_id: i64,
    ) -> Result<(), BookingError>;
}

/// States of the interactive booking flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the user to pick a time slot
    SelectingTime,
    /// Waiting for the applicant's full name
    AskingName,
    /// Waiting for the applicant's email address
    AskingEmail,
    /// Waiting for the final go-ahead
    Confirming,
    /// The external transaction reached "preconfirmed"
    Completed,
    /// Timed out, errored, or hit an unrecoverable conflict
    Failed,
    /// Explicitly cancelled by the user or an interrupting command
    Cancelled,
}

impl SessionState {
    /// Whether the session accepts no further events.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// The only legal transitions. Everything else is rejected centrally in
// `BookingSession::transition` rather than via ad hoc flags.
fn allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    matches!(
        (from, to),
        (SelectingTime, AskingName)
            | (AskingName, AskingEmail)
            | (AskingEmail, Confirming)
            | (Confirming, Completed)
            // conflict policy may send the user back to slot selection
            | (Confirming, SelectingTime)
    ) || (!from.is_terminal() && matches!(to, Failed | Cancelled))
}

/// Session-level errors. `Validation` leaves the state unchanged so the user
/// can be re-prompted; everything else either rejects the event or ends the
/// session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The event is not legal in the current state
    #[error("event not allowed in state {from:?}")]
    IllegalTransition {
        /// State the session was in when the event arrived
        from: SessionState,
    },

    /// User input failed validation; re-prompt
    #[error("{0}")]
    Validation(String),

    /// Inactivity timeout; the session is closed and suppression released
    #[error("booking session timed out")]
    Timeout,

    /// The slot was taken by someone else ("slot no longer available")
    #[error("appointment slot no longer available")]
    SlotUnavailable,

    /// Any other external failure ("system error, retry")
    #[error("booking failed: {0}")]
    Booking(String),

    /// The session could not obtain a usable access token
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Result of a completed booking transaction, for user display.
#[derive(Debug, Clone)]
pub struct BookingConfirmation {
    /// Booking id to quote in support requests
    pub process_id: i64,
    /// The reserved slot
    pub slot_timestamp: i64,
    /// Where the confirmation email went
    pub email: String,
}

/// One interactive booking flow for one user.
///
/// Holds the queue guard for its whole lifetime: suppression starts before
/// the first slot is displayed and ends exactly once, on whatever path the
/// session reaches a terminal state (including being dropped mid-flight).
pub struct BookingSession {
    id: Uuid,
    user_id: i64,
    service_id: i64,
    office_id: i64,
    token: String,
    state: SessionState,
    slot: Option<i64>,
    name: Option<String>,
    email: Option<String>,
    reservation: Option<Reservation>,
    started_at: DateTime<Utc>,
    last_activity: Instant,
    timeout: Duration,
    conflict_policy: ConflictPolicy,
    guard: Option<QueueGuard>,
}

impl BookingSession {
    /// Enter the booking flow.
    ///
    /// The queue entry is taken *before* anything is shown to the user,
    /// closing the race where a notification could fire between slot display
    /// and confirmation. A fresh token is required up front because a token
    /// is tied to one derivation cycle and cannot be refreshed mid-booking.
    pub async fn begin(
        user_id: i64,
        service_id: i64,
        office_id: i64,
        queue: &Arc<QueueManager>,
        tokens: &TokenProvider,
        config: &EngineConfig,
    ) -> Result<Self, SessionError> {
        let guard = queue.enter(user_id);
        // On token failure the guard drops here and the queue entry is
        // released before the error propagates.
        let token = tokens.ensure_fresh().await?;

        let session = Self {
            id: Uuid::new_v4(),
            user_id,
            service_id,
            office_id,
            token,
            state: SessionState::SelectingTime,
            slot: None,
            name: None,
            email: None,
            reservation: None,
            started_at: Utc::now(),
            last_activity: Instant::now(),
            timeout: config.session_timeout,
            conflict_policy: config.conflict_policy,
            guard: Some(guard),
        };

        info!(
            session = %session.id,
            user_id, service_id, office_id,
            "booking session started"
        );
        Ok(session)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session identifier, for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The user driving this session.
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// When the session was entered.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The user picked a slot. Provisional: only `reserve` is authoritative
    /// about whether the slot is still free.
    pub fn select_slot(&mut self, slot_timestamp: i64) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.expect_state(SessionState::SelectingTime)?;

        self.transition(SessionState::AskingName)?;
        self.slot = Some(slot_timestamp);
        Ok(())
    }

    /// The user entered their name. At least two words, as on documents.
    pub fn submit_name(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.expect_state(SessionState::AskingName)?;

        let name = name.trim();
        if name.split_whitespace().count() < 2 {
            return Err(SessionError::Validation(
                "please enter your full name (first and last name)".to_string(),
            ));
        }
        if name.len() < 4 {
            return Err(SessionError::Validation(
                "name is too short, please enter your full name".to_string(),
            ));
        }

        self.transition(SessionState::AskingEmail)?;
        self.name = Some(name.to_string());
        Ok(())
    }

    /// The user entered their email address.
    pub fn submit_email(&mut self, email: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.expect_state(SessionState::AskingEmail)?;

        let email = email.trim().to_lowercase();
        if !email.validate_email() {
            return Err(SessionError::Validation(
                "invalid email address, please enter a valid one".to_string(),
            ));
        }

        self.transition(SessionState::Confirming)?;
        self.email = Some(email);
        Ok(())
    }

    /// The user confirmed: run the irreversible external transaction.
    ///
    /// `reserve → update → preconfirm`, strictly in order, each step using
    /// only this session's own reservation handle. Any failure aborts the
    /// remaining steps.
    pub async fn confirm(
        &mut self,
        api: &dyn BookingApi,
    ) -> Result<BookingConfirmation, SessionError> {
        self.ensure_live()?;
        self.expect_state(SessionState::Confirming)?;

        let slot = self.require_field(self.slot, "slot")?;
        let name = self.require_field(self.name.clone(), "name")?;
        let email = self.require_field(self.email.clone(), "email")?;

        let reservation = match api
            .reserve(slot, self.service_id, self.office_id, &self.token)
            .await
        {
            Ok(reservation) => reservation,
            Err(BookingError::Conflict) => return self.handle_conflict(),
            Err(e) => {
                warn!(session = %self.id, "reserve failed: {e}");
                self.transition(SessionState::Failed)?;
                return Err(SessionError::Booking(e.to_string()));
            }
        };
        self.reservation = Some(reservation.clone());

        if let Err(e) = api
            .update(&reservation, &name, &email, self.service_id, self.office_id)
            .await
        {
            warn!(session = %self.id, "update failed: {e}");
            self.transition(SessionState::Failed)?;
            return Err(SessionError::Booking(e.to_string()));
        }

        if let Err(e) = api
            .preconfirm(&reservation, &name, &email, self.service_id, self.office_id)
            .await
        {
            warn!(session = %self.id, "preconfirm failed: {e}");
            self.transition(SessionState::Failed)?;
            return Err(SessionError::Booking(e.to_string()));
        }

        let confirmation = BookingConfirmation {
            process_id: reservation.process_id,
            slot_timestamp: slot,
            email,
        };

        self.transition(SessionState::Completed)?;
        info!(
            session = %self.id,
            process_id = confirmation.process_id,
            "booking preconfirmed, applicant must confirm via email"
        );
        Ok(confirmation)
    }

    /// Explicit cancellation, or an unrelated command interrupting the flow.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::IllegalTransition { from: self.state });
        }
        self.transition(SessionState::Cancelled)
    }

    /// Close the session if it has been idle past the timeout. Returns true
    /// when the session was expired by this call.
    pub fn expire_if_idle(&mut self) -> bool {
        if !self.state.is_terminal() && self.last_activity.elapsed() > self.timeout {
            let _ = self.transition(SessionState::Failed);
            true
        } else {
            false
        }
    }

    fn handle_conflict(&mut self) -> Result<BookingConfirmation, SessionError> {
        match self.conflict_policy {
            ConflictPolicy::Terminate => {
                info!(session = %self.id, "slot conflict, terminating session");
                self.transition(SessionState::Failed)?;
            }
            ConflictPolicy::ReturnToSelection => {
                info!(session = %self.id, "slot conflict, returning to slot selection");
                self.slot = None;
                self.transition(SessionState::SelectingTime)?;
            }
        }
        Err(SessionError::SlotUnavailable)
    }

    // Terminal check + inactivity timeout + activity stamp, in that order.
    fn ensure_live(&mut self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::IllegalTransition { from: self.state });
        }
        if self.last_activity.elapsed() > self.timeout {
            let _ = self.transition(SessionState::Failed);
            return Err(SessionError::Timeout);
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::IllegalTransition { from: self.state });
        }
        Ok(())
    }

    fn require_field<T>(&mut self, value: Option<T>, what: &str) -> Result<T, SessionError> {
        match value {
            Some(v) => Ok(v),
            None => {
                let _ = self.transition(SessionState::Failed);
                Err(SessionError::Booking(format!("session missing {what}")))
            }
        }
    }

    // Single choke point for state changes. Entering a terminal state
    // releases the queue guard and invalidates the reservation handle so it
    // can never be reused by a later call.
    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !allowed(self.state, to) {
            return Err(SessionError::IllegalTransition { from: self.state });
        }

        debug!(session = %self.id, from = ?self.state, to = ?to, "session transition");
        self.state = to;

        if to.is_terminal() {
            self.reservation = None;
            drop(self.guard.take());
        }
        Ok(())
    }
}

//! Binds the engine's collaborator traits to the concrete citizen API
//! client. The engine itself only ever sees the traits, so tests swap in
//! scripted implementations.

use async_trait::async_trait;
use chrono::NaiveDate;

use muenchen_api::{ApiClient, AvailableDay, CaptchaChallenge, PowSolution, Reservation};

use crate::checker::AvailabilityClient;
use crate::session::BookingApi;
use crate::token::ChallengeAuthority;
use crate::types::{AvailabilityError, BookingError, DateRange, TokenError};

#[async_trait]
impl ChallengeAuthority for ApiClient {
    async fn fetch_challenge(&self) -> Result<CaptchaChallenge, TokenError> {
        self.captcha_challenge().await.map_err(TokenError::Challenge)
    }

    async fn verify_solution(&self, solution: &PowSolution) -> Result<String, TokenError> {
        self.captcha_verify(solution).await.map_err(TokenError::Verify)
    }
}

#[async_trait]
impl AvailabilityClient for ApiClient {
    async fn available_days(
        &self,
        service_id: i64,
        office_id: i64,
        range: &DateRange,
        token: &str,
    ) -> Result<Vec<AvailableDay>, AvailabilityError> {
        ApiClient::available_days(self, service_id, office_id, range.start, range.end, token)
            .await
            .map_err(Into::into)
    }

    async fn available_slots(
        &self,
        service_id: i64,
        office_id: i64,
        date: NaiveDate,
        token: &str,
    ) -> Result<Vec<i64>, AvailabilityError> {
        ApiClient::available_slots(self, service_id, office_id, date, token)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl BookingApi for ApiClient {
    async fn reserve(
        &self,
        slot_timestamp: i64,
        service_id: i64,
        office_id: i64,
        token: &str,
    ) -> Result<Reservation, BookingError> {
        self.reserve_appointment(slot_timestamp, service_id, office_id, token)
            .await
            .map_err(Into::into)
    }

    async fn update(
        &self,
        reservation: &Reservation,
        name: &str,
        email: &str,
        service_id: i64,
        office_id: i64,
    ) -> Result<(), BookingError> {
        self.update_appointment(reservation, name, email, service_id, office_id)
            .await
            .map_err(Into::into)
    }

    async fn preconfirm(
        &self,
        reservation: &Reservation,
        name: &str,
        email: &str,
        service_id: i64,
        office_id: i64,
    ) -> Result<(), BookingError> {
        self.preconfirm_appointment(reservation, name, email, service_id, office_id)
            .await
            .map_err(Into::into)
    }
}

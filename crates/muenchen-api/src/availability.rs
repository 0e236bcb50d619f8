use chrono::NaiveDate;
use tracing::debug;

use crate::client::ApiClient;
use crate::types::{ApiError, AvailableDay, AvailableDaysResponse, SlotsResponse};

// Error code the API uses for "nothing free in this range".
const NO_APPOINTMENTS: &str = "noAppointmentForThisScope";

impl ApiClient {
    /// Query the open days for one (service, office) pair in a date range.
    ///
    /// An empty result is a normal outcome. Captcha-related error codes map
    /// to [`ApiError::TokenRejected`] so the caller can force a refresh.
    pub async fn available_days(
        &self,
        service_id: i64,
        office_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        captcha_token: &str,
    ) -> Result<Vec<AvailableDay>, ApiError> {
        debug!(service_id, office_id, %start, %end, "checking available days");

        let params = [
            ("startDate", start.format("%Y-%m-%d").to_string()),
            ("endDate", end.format("%Y-%m-%d").to_string()),
            ("officeId", office_id.to_string()),
            ("serviceId", service_id.to_string()),
            ("serviceCount", "1".to_string()),
            ("captchaToken", captcha_token.to_string()),
        ];

        let response: AvailableDaysResponse =
            self.get_json("available-days-by-office/", &params).await?;

        if let Some(code) = response.error_code {
            return match code.as_str() {
                NO_APPOINTMENTS => Ok(Vec::new()),
                c if c.to_ascii_lowercase().contains("captcha") => Err(ApiError::TokenRejected),
                c => Err(ApiError::Api(format!(
                    "{c}: {}",
                    response.error_message.unwrap_or_default()
                ))),
            };
        }

        Ok(response.available_days)
    }

    /// Query the open time slots (unix timestamps) for one day.
    pub async fn available_slots(
        &self,
        service_id: i64,
        office_id: i64,
        date: NaiveDate,
        captcha_token: &str,
    ) -> Result<Vec<i64>, ApiError> {
        debug!(service_id, office_id, %date, "fetching time slots");

        let params = [
            ("date", date.format("%Y-%m-%d").to_string()),
            ("officeId", office_id.to_string()),
            ("serviceId", service_id.to_string()),
            ("serviceCount", "1".to_string()),
            ("captchaToken", captcha_token.to_string()),
        ];

        let response: SlotsResponse = self
            .get_json("available-appointments-by-office/", &params)
            .await?;

        // The response carries one entry per queried office; keep the one we
        // asked for.
        Ok(response
            .offices
            .into_iter()
            .find(|o| o.office_id == office_id)
            .map(|o| o.appointments)
            .unwrap_or_default())
    }
}

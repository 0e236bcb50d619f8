use serde_json::{Value, json};
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::types::{ApiError, Reservation};

impl ApiClient {
    /// Step 1: reserve a slot.
    ///
    /// A response without `processId`/`authKey` means the slot was taken in
    /// the meantime and maps to [`ApiError::Conflict`].
    pub async fn reserve_appointment(
        &self,
        slot_timestamp: i64,
        service_id: i64,
        office_id: i64,
        captcha_token: &str,
    ) -> Result<Reservation, ApiError> {
        info!(slot_timestamp, service_id, office_id, "reserving appointment");

        let body = json!({
            "timestamp": slot_timestamp,
            "serviceCount": [1],
            "officeId": office_id,
            "serviceId": [service_id],
            "captchaToken": captcha_token,
        });

        let response: Value = self.post_json("reserve-appointment/", &body).await?;

        match serde_json::from_value::<Reservation>(response) {
            Ok(reservation) => {
                info!(process_id = reservation.process_id, "appointment reserved");
                Ok(reservation)
            }
            Err(_) => {
                warn!(slot_timestamp, "reserve response missing processId/authKey");
                Err(ApiError::Conflict)
            }
        }
    }

    /// Step 2: attach the applicant's name and email to the reservation.
    pub async fn update_appointment(
        &self,
        reservation: &Reservation,
        family_name: &str,
        email: &str,
        service_id: i64,
        office_id: i64,
    ) -> Result<(), ApiError> {
        info!(
            process_id = reservation.process_id,
            "updating appointment with applicant data"
        );

        let body = appointment_payload(
            reservation,
            family_name,
            email,
            service_id,
            office_id,
            "reserved",
        );
        let _: Value = self.post_json("update-appointment/", &body).await?;

        Ok(())
    }

    /// Step 3: preconfirm the reservation.
    ///
    /// Side effect on the server: a confirmation email is sent that the
    /// applicant must act on, so success here means "preconfirmed" only.
    pub async fn preconfirm_appointment(
        &self,
        reservation: &Reservation,
        family_name: &str,
        email: &str,
        service_id: i64,
        office_id: i64,
    ) -> Result<(), ApiError> {
        info!(
            process_id = reservation.process_id,
            "preconfirming appointment"
        );

        let body = appointment_payload(
            reservation,
            family_name,
            email,
            service_id,
            office_id,
            "preconfirmed",
        );
        let _: Value = self.post_json("preconfirm-appointment/", &body).await?;

        info!(
            process_id = reservation.process_id,
            "preconfirmed; applicant must confirm via email"
        );
        Ok(())
    }
}

// update and preconfirm take the same payload apart from `status`.
fn appointment_payload(
    reservation: &Reservation,
    family_name: &str,
    email: &str,
    service_id: i64,
    office_id: i64,
    status: &str,
) -> Value {
    let office_name = reservation
        .scope
        .pointer("/provider/name")
        .and_then(Value::as_str)
        .unwrap_or_default();

    json!({
        "processId": reservation.process_id,
        "timestamp": reservation.timestamp.clone(),
        "authKey": reservation.auth_key.clone(),
        "familyName": family_name,
        "customTextfield": "",
        "customTextfield2": "",
        "email": email,
        "telephone": "",
        "officeName": office_name,
        "officeId": office_id,
        "scope": reservation.scope.clone(),
        "subRequestCounts": [],
        "serviceId": service_id,
        "serviceName": "",
        "serviceCount": 1,
        "status": status,
        "captchaToken": "",
        "slotCount": 1,
    })
}

//! Integration tests for the citizen API client against a mock server.

use chrono::NaiveDate;
use httpmock::prelude::*;
use muenchen_api::{ApiClient, ApiError, PowSolution};
use serde_json::json;

fn client_for(server: &MockServer) -> ApiClient {
    ApiClient::with_base_url(server.url("")).expect("client construction")
}

fn date(s: &str) -> NaiveDate {
    s.parse().expect("test date")
}

#[tokio::test]
async fn fetches_and_parses_captcha_challenge() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/captcha-challenge/");
            then.status(200).json_body(json!({
                "algorithm": "SHA-256",
                "challenge": "abc123",
                "maxnumber": 50000,
                "salt": "somesalt",
                "signature": "sig",
            }));
        })
        .await;

    let challenge = client_for(&server)
        .captcha_challenge()
        .await
        .expect("challenge");

    mock.assert_async().await;
    assert_eq!(challenge.challenge, "abc123");
    assert_eq!(challenge.max_number, 50000);
    assert_eq!(challenge.salt, "somesalt");
}

#[tokio::test]
async fn verify_returns_token_on_valid_solution() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/captcha-verify/")
                .body_contains("payload");
            then.status(200).json_body(json!({
                "meta": { "success": true },
                "data": { "valid": true },
                "token": "jwt-token-value",
            }));
        })
        .await;

    let solution = PowSolution {
        algorithm: "SHA-256".to_string(),
        challenge: "abc123".to_string(),
        number: 42,
        salt: "somesalt".to_string(),
        signature: "sig".to_string(),
        took: 17,
    };

    let token = client_for(&server)
        .captcha_verify(&solution)
        .await
        .expect("token");
    assert_eq!(token, "jwt-token-value");
}

#[tokio::test]
async fn verify_rejection_is_an_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/captcha-verify/");
            then.status(200).json_body(json!({
                "meta": { "success": true },
                "data": { "valid": false },
            }));
        })
        .await;

    let solution = PowSolution {
        algorithm: "SHA-256".to_string(),
        challenge: "abc123".to_string(),
        number: 42,
        salt: "somesalt".to_string(),
        signature: "sig".to_string(),
        took: 17,
    };

    let result = client_for(&server).captcha_verify(&solution).await;
    assert!(matches!(result, Err(ApiError::Api(_))));
}

#[tokio::test]
async fn available_days_parses_open_dates() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/available-days-by-office/")
                .query_param("officeId", "10461")
                .query_param("serviceId", "10339028")
                .query_param("captchaToken", "tok");
            then.status(200).json_body(json!({
                "availableDays": [
                    { "time": "2025-11-05", "providerIDs": "10461" },
                    { "time": "2025-11-07", "providerIDs": "10461" },
                ],
            }));
        })
        .await;

    let days = client_for(&server)
        .available_days(10339028, 10461, date("2025-11-01"), date("2025-11-10"), "tok")
        .await
        .expect("days");

    assert_eq!(days.len(), 2);
    assert_eq!(days[0].date, date("2025-11-05"));
}

#[tokio::test]
async fn no_appointment_error_code_means_empty() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/available-days-by-office/");
            then.status(200).json_body(json!({
                "errorCode": "noAppointmentForThisScope",
                "errorMessage": "no appointments",
            }));
        })
        .await;

    let days = client_for(&server)
        .available_days(1, 2, date("2025-11-01"), date("2025-11-10"), "tok")
        .await
        .expect("days");
    assert!(days.is_empty());
}

#[tokio::test]
async fn captcha_error_code_maps_to_token_rejection() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/available-days-by-office/");
            then.status(200).json_body(json!({
                "errorCode": "captchaInvalid",
                "errorMessage": "token expired",
            }));
        })
        .await;

    let result = client_for(&server)
        .available_days(1, 2, date("2025-11-01"), date("2025-11-10"), "tok")
        .await;
    assert!(matches!(result, Err(ApiError::TokenRejected)));
}

#[tokio::test]
async fn http_401_maps_to_token_rejection() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/available-days-by-office/");
            then.status(401).body("unauthorized");
        })
        .await;

    let result = client_for(&server)
        .available_days(1, 2, date("2025-11-01"), date("2025-11-10"), "tok")
        .await;
    assert!(matches!(result, Err(ApiError::TokenRejected)));
}

#[tokio::test]
async fn available_slots_filters_by_office() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/available-appointments-by-office/")
                .query_param("date", "2025-11-05");
            then.status(200).json_body(json!({
                "offices": [
                    { "officeId": 99, "appointments": [111] },
                    { "officeId": 10461, "appointments": [1762329600, 1762331400] },
                ],
            }));
        })
        .await;

    let slots = client_for(&server)
        .available_slots(10339028, 10461, date("2025-11-05"), "tok")
        .await
        .expect("slots");
    assert_eq!(slots, vec![1762329600, 1762331400]);
}

#[tokio::test]
async fn reserve_returns_reservation_handle() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/reserve-appointment/")
                .json_body_partial(r#"{ "officeId": 10461, "serviceId": [10339028] }"#);
            then.status(200).json_body(json!({
                "processId": 192837,
                "authKey": "abcdef",
                "timestamp": "1762329600",
                "scope": { "provider": { "name": "Bürgerbüro" } },
            }));
        })
        .await;

    let reservation = client_for(&server)
        .reserve_appointment(1762329600, 10339028, 10461, "tok")
        .await
        .expect("reservation");
    assert_eq!(reservation.process_id, 192837);
    assert_eq!(reservation.auth_key, "abcdef");
}

#[tokio::test]
async fn reserve_without_process_id_is_a_conflict() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/reserve-appointment/");
            then.status(200).json_body(json!({ "errorCode": "slotTaken" }));
        })
        .await;

    let result = client_for(&server)
        .reserve_appointment(1762329600, 10339028, 10461, "tok")
        .await;
    assert!(matches!(result, Err(ApiError::Conflict)));
}

#[tokio::test]
async fn update_and_preconfirm_post_applicant_data() {
    let server = MockServer::start_async().await;
    let update = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/update-appointment/")
                .json_body_partial(
                    r#"{ "processId": 192837, "authKey": "abcdef", "status": "reserved" }"#,
                );
            then.status(200).json_body(json!({ "processId": 192837 }));
        })
        .await;
    let preconfirm = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/preconfirm-appointment/")
                .json_body_partial(
                    r#"{ "processId": 192837, "authKey": "abcdef", "status": "preconfirmed" }"#,
                );
            then.status(200).json_body(json!({ "processId": 192837 }));
        })
        .await;

    let client = client_for(&server);
    let reservation = serde_json::from_value::<muenchen_api::Reservation>(json!({
        "processId": 192837,
        "authKey": "abcdef",
        "timestamp": "1762329600",
        "scope": { "provider": { "name": "Bürgerbüro" } },
    }))
    .expect("reservation");

    client
        .update_appointment(&reservation, "Jane Doe", "jane@example.com", 10339028, 10461)
        .await
        .expect("update");
    client
        .preconfirm_appointment(&reservation, "Jane Doe", "jane@example.com", 10339028, 10461)
        .await
        .expect("preconfirm");

    update.assert_async().await;
    preconfirm.assert_async().await;
}

//! # Muenchen API
//!
//! Typed HTTP client for the Munich "Bürgeransicht" citizen appointment API.
//! Covers the captcha challenge/verify endpoints, availability queries, and
//! the three-step booking flow (reserve, update, preconfirm).

/// Wire types and the API error taxonomy
mod types;
pub use types::*;

/// Base HTTP client with the headers the citizen API expects
mod client;
pub use client::*;

/// Availability queries (open days and time slots)
mod availability;

/// Three-step booking endpoints
mod booking;

//! # Appointment Scan
//!
//! Monitoring and booking orchestration engine for the Munich citizen
//! appointment service: proof-of-work token lifecycle, the periodic check
//! cycle, notification suppression during interactive bookings, and the
//! three-step booking state machine.

/// Core data types and the error taxonomy
mod types;
pub use types::*;

/// Engine configuration loaded from the environment
mod config;
pub use config::*;

/// Proof-of-work access-token lifecycle
mod token;
pub use token::*;

/// Suppression queue for users inside a booking flow
mod queue;
pub use queue::*;

/// Notification formatting and dispatch
mod notify;
pub use notify::*;

/// Periodic availability check cycle
mod checker;
pub use checker::*;

/// Interactive booking state machine
mod session;
pub use session::*;

/// Consecutive-failure tracking and operator alerts
mod health;
pub use health::*;

/// Adapter impls binding the traits to the citizen API client
mod munich;

/// Telegram delivery channel and a mock for development
mod telegram;
pub use telegram::*;

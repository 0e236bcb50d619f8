//! # Storage
//!
//! SQLite-backed persistence collaborator: owns subscriptions and the
//! appointment log. The engine reads subscriptions through the
//! `SubscriptionStore` trait; writes come from the user-facing layer.

/// SQLite implementation of the subscription store
mod sqlite;
pub use sqlite::*;

// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the database operator
//!
//! This module contains unit tests for:
//! - Credential generation and secret annotations
//! - Connection endpoints and TLS policy
//! - Template rendering into secrets and config maps
//! - Proxy, backup and info resource generators
//! - Admission webhook policies
//! - Database event filtering and secret fan-out
//! - Reconcile state transitions against the in-memory driver

#[path = "../common/mod.rs"]
mod common;

mod connection;
mod credentials;
mod fanout;
mod resources;
mod state_machine;
mod templates;
mod webhooks;

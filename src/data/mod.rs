//! Data layer module
//!
//! Handles all data persistence:
//! - Local and remote actors
//! - Posts and their outbox ordering
//! - Follow and like edges
//! - The ledger of applied inbound activities

mod database;
mod models;

pub use database::{Database, InboundWrite, OutboxCursor};
pub use models::*;

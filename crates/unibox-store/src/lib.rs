//! # unibox-store
//!
//! Local storage for the Unibox core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle with typed CRUD helpers
//! for messages, file transfers, relay mappings and settings, and the async
//! [`DeliveryLedger`] the rest of the core talks to.

pub mod database;
pub mod files;
pub mod ledger;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod relay_mappings;
pub mod settings;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use ledger::DeliveryLedger;
pub use models::*;
pub use settings::keys;

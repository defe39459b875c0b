//! Database module for connmon.
//!
//! Provides SQLite storage for the config entry and probe history.

mod models;
mod store;

pub use models::*;
pub use store::*;

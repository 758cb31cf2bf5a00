//! Data layer module
//!
//! Handles all data persistence:
//! - the [`Store`] contract consumed by the federation engine
//! - its SQLite implementation, [`Database`]
//! - task queue rows

mod database;
mod models;
mod store;
mod tasks;

pub use database::{Database, PAGE_SIZE};
pub use models::*;
pub use store::Store;

//! Offline cache and synchronization core for a news reader.
//!
//! Requests go through [`cache::CacheEngine`], user intents are persisted by
//! [`db`] and replayed by [`sync::SyncCoordinator`] when [`monitor::NetworkMonitor`]
//! reports that connectivity is back. [`reader::OfflineReader`] wires it all
//! together for the application shell.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod model;
pub mod monitor;
pub mod reader;
pub mod replay;
pub mod sync;

pub use error::{Error, Result};
pub use reader::OfflineReader;

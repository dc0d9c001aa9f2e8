//! Persistent store: bookmarks, cached articles and the pending-action queue.
//!
//! `repo` holds the SQL; `model` holds the query-shaped structs that are not
//! domain entities. Everything is reachable as `news_offline::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::QueueCounts;

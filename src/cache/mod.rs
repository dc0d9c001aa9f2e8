//! Layered request cache backed by versioned generations.
//!
//! - `classify`: maps a request onto cache-first, network-first or
//!   stale-while-revalidate.
//! - `generation`: generation phases and the register naming the current one.
//! - `storage`: SQLite rows holding cached responses per generation.
//! - `engine`: applies the policies and drives install/activate.

pub mod classify;
pub mod engine;
pub mod generation;
pub mod storage;

pub use classify::{Classifier, Destination, Policy, Request};
pub use engine::{
    Activation, CacheCounters, CacheEngine, ResponseSource, Served, CACHE_FIRST_UNAVAILABLE,
    NETWORK_UNAVAILABLE, SYNTHETIC_HEADER,
};
pub use generation::{GenerationPhase, GenerationRegister, InstalledGeneration};
pub use storage::AssetStore;

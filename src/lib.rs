//! Offline-first cache and durable replay engine for a GitHub dashboard.
//!
//! - `cache`: the record store with per-collection expiry
//! - `sync`: the operation log and the page/background replay machinery
//! - `remote`: the executor contract and its HTTP implementation
//! - `engine`: the facade owning all of the above
//! - `github`: typed GitHub records and a cached client
//! - `server`: the replay endpoint that forwards calls to GitHub

pub mod cache;
pub mod engine;
pub mod error;
pub mod github;
pub mod remote;
pub mod server;
pub mod sync;

pub use engine::{CacheEngine, EngineOptions, Outcome};
pub use error::{CacheError, Result};

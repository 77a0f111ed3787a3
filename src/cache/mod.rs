//! Local record store with per-collection expiry.
//!
//! This module provides the client's offline cache:
//! - Records grouped in named collections, keyed by a path into the payload
//! - Secondary indexes per collection
//! - Expired records read as absent and are swept periodically
//! - A read-through layer that fills the store from the network

mod clock;
mod collection;
mod layer;
mod storage;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collection::{Collection, ExpiryPolicy, IndexSpec};
pub use layer::CacheLayer;
pub use storage::{CachedRecord, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable};

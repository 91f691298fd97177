//! Resource cache for the app shell.
//!
//! This module keeps the shell usable offline:
//! - Installs a fixed asset list into the current cache generation
//! - Deletes every other generation on activation and claims open clients
//! - Serves GET requests network-first, falling back to the cached copy
//! - Never caches or serves from cache anything on a bypass path

mod layer;
mod storage;
mod traits;

pub use layer::ResourceCache;
pub use storage::{NoopStorage, ResponseStorage, SqliteStorage};
pub use traits::{CachedResponse, Fetcher, Request};

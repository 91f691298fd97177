//! Synchronization of pending captures with the portal.
//!
//! A cycle runs IDLE → DRAINING → SENDING → CLEARING → IDLE. Only one cycle
//! is ever in flight; triggers that arrive meanwhile join it.

mod engine;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::{SyncEngine, SyncOutcome, SyncState};

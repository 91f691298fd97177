//! HTTP boundary to the gatehouse portal.

mod api_types;
mod client;

pub use api_types::{idempotency_key, SyncBatch, SyncResponse};
#[cfg(test)]
pub use api_types::ResidentsResponse;
pub use client::{GatehouseApi, HttpApi};

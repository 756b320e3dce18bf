//! Admin HTTP API
//!
//! A small Axum surface over the `CMapManager`: read the current map, publish a new
//! authoritative version, and run point lookups through the query engine.

pub mod handlers;
pub mod protocol;

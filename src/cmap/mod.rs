//! Cluster Map Module
//!
//! The cluster map (`CMap`) is the versioned, immutable description of every node,
//! volume and encoding group in the cluster. Every other component (volume admission,
//! encoding-group placement, recovery, request routing) treats it as ground truth.
//!
//! ## Core Concepts
//! - **Copy-on-write snapshots**: a published map is never edited; each change commits a new value.
//! - **Incarnations**: per-entity counters that order competing status claims from gossip.
//! - **Notifications**: consumers block on one-shot channels until the version advances or
//!   the health of a known entity changes, then re-query through `SearchCall`.
//!
//! ## Submodules
//! - **`types`**: the data model (`CMap`, `Node`, `Volume`, `EncodingGroup`).
//! - **`merge`**: the pure incarnation-based merge used by gossip.
//! - **`manager`**: the single owner of the current map and its notification registries.
//! - **`search`**: builder-style point lookups over a frozen map.
//! - **`store`**: snapshot persistence (`FileStore`, `MemoryStore`).

pub mod error;
pub mod manager;
pub mod merge;
pub mod search;
pub mod store;
pub mod types;

pub use error::{CMapError, StoreError};
pub use manager::{CMapManager, MergeReport, UpdateOutcome};
pub use search::SearchCall;
pub use store::{FileStore, MemoryStore, SnapshotStore};
pub use types::*;

#[cfg(test)]
mod tests;

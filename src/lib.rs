//! Cluster Map Library
//!
//! Membership and state convergence for a distributed object-storage cluster of metadata
//! servers, data servers and gateways. It serves as the foundation for the node binary
//! (`main.rs`) and for every component that needs to know which nodes, volumes and
//! encoding groups exist and whether they are reachable.
//!
//! ## Architecture Modules
//! - **`cmap`**: The versioned cluster map, its incarnation-based merge, the manager that
//!   publishes new versions and notifies waiters, and the query engine (`SearchCall`).
//! - **`gossip`**: A SWIM-style failure detector (direct and indirect probing, suspicion,
//!   dissemination) that exchanges full cluster maps over a pluggable transport.
//! - **`api`**: An Axum admin surface for reading, publishing and searching the map.

pub mod api;
pub mod cmap;
pub mod gossip;

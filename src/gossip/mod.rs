//! Gossip Membership Module
//!
//! Implements a SWIM-style failure detector on top of a pluggable `Transport`. Every
//! message carries the sender's full cluster map, so failure detection and state
//! convergence happen in the same exchange.
//!
//! ## Core Mechanisms
//! - **Probing**: each tick pings one random Alive peer directly.
//! - **Indirect probing**: when the direct ping fails the target becomes Suspect and up to
//!   `k` relays are asked to ping it; if none succeeds the target becomes Faulty.
//! - **Dissemination**: every local status change is pushed to a few random peers.
//! - **Refutation**: a node that finds itself Suspect raises its own incarnation.

pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod types;

pub use error::GossipError;
pub use service::{GossipHandle, GossipServer, ProbeOutcome, start_gossip};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
pub use types::{GossipConfig, GossipMessage};

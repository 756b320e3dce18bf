use crate::cmap::{CMapError, NodeId};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while exchanging gossip with peers.
///
/// Per-probe failures (`Io`, `Timeout`, `Unreachable`) drive the SWIM state
/// machine and are only logged. `InvalidConfig` is the one fatal error and is
/// raised before any network activity.
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("gossip transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gossip codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("gossip frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("gossip exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay could not reach {0}")]
    Unreachable(NodeId),
    #[error("unexpected gossip reply: {0}")]
    UnexpectedReply(&'static str),
    #[error("invalid gossip configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    CMap(#[from] CMapError),
}

pub type Result<T> = std::result::Result<T, GossipError>;

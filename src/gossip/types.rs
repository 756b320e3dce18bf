use super::error::{GossipError, Result};
use crate::cmap::{CMap, NodeId};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The wire protocol between gossip servers.
///
/// Every message carries the sender's cluster map, so each exchange doubles
/// as an anti-entropy round.
///
/// - `Ping/Ack`: direct liveness check.
/// - `PingRequest`: asks a relay to ping `target` on the sender's behalf. The
///   relay answers with the target's `Ack` or with a `Nack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        cmap: CMap,
    },

    PingRequest {
        from: NodeId,
        target: NodeId,
        cmap: CMap,
    },

    Ack {
        from: NodeId,
        cmap: CMap,
    },

    Nack {
        from: NodeId,
        target: NodeId,
        cmap: CMap,
    },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Ping { .. } => "ping",
            GossipMessage::PingRequest { .. } => "ping-request",
            GossipMessage::Ack { .. } => "ack",
            GossipMessage::Nack { .. } => "nack",
        }
    }
}

/// Gossip tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Identity of the local node in the cluster map.
    pub node_id: NodeId,
    /// `host:port` the local node is reachable at.
    pub address: String,
    /// Interval between probe rounds.
    #[serde(with = "humantime_serde")]
    pub ping_period: Duration,
    /// Deadline for a dial plus one request/response exchange.
    #[serde(with = "humantime_serde")]
    pub ping_expire: Duration,
    /// How long a node may stay Suspect locally before it is declared Faulty,
    /// whoever raised the suspicion.
    #[serde(with = "humantime_serde")]
    pub suspicion_timeout: Duration,
    /// Relays asked to ping a suspect.
    pub indirect_probes: usize,
    /// Peers that receive a snapshot after a local status change.
    pub broadcast_fanout: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            address: "127.0.0.1:7946".to_string(),
            ping_period: Duration::from_secs(1),
            ping_expire: Duration::from_millis(500),
            suspicion_timeout: Duration::from_secs(5),
            indirect_probes: 3,
            broadcast_fanout: 3,
        }
    }
}

impl GossipConfig {
    pub fn new(node_id: NodeId, address: &str) -> Self {
        Self {
            node_id,
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_period.is_zero() {
            return Err(GossipError::InvalidConfig(
                "ping_period must be positive".to_string(),
            ));
        }
        if self.ping_expire.is_zero() {
            return Err(GossipError::InvalidConfig(
                "ping_expire must be positive".to_string(),
            ));
        }
        if self.suspicion_timeout.is_zero() {
            return Err(GossipError::InvalidConfig(
                "suspicion_timeout must be positive".to_string(),
            ));
        }
        if self.indirect_probes == 0 {
            return Err(GossipError::InvalidConfig(
                "indirect_probes must be at least 1".to_string(),
            ));
        }
        if self.broadcast_fanout == 0 {
            return Err(GossipError::InvalidConfig(
                "broadcast_fanout must be at least 1".to_string(),
            ));
        }
        validate_address(&self.address)
    }

    /// Deadline for a relayed probe: the relay needs its own `ping_expire`
    /// for the inner ping on top of ours.
    pub fn relay_expire(&self) -> Duration {
        self.ping_expire * 2
    }
}

fn validate_address(address: &str) -> Result<()> {
    let invalid = || GossipError::InvalidConfig(format!("malformed address: {:?}", address));

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    port.parse::<u16>().map_err(|_| invalid())?;
    Ok(())
}

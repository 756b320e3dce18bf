use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a cluster node (metadata server, data server or gateway).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Identifier of a storage volume attached to a data node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub u64);

/// Identifier of an encoding group (a set of volumes sharing one stripe).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodingGroupId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol-{}", self.0)
    }
}

impl fmt::Display for EncodingGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eg-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeType {
    Metadata,
    Data,
    Gateway,
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metadata" | "mds" => Ok(NodeType::Metadata),
            "data" | "ds" => Ok(NodeType::Data),
            "gateway" | "gw" => Ok(NodeType::Gateway),
            other => Err(format!("unknown node type: {}", other)),
        }
    }
}

/// SWIM liveness of a node. `Faulty` is terminal for gossip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Faulty,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VolumeSpeed {
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VolumeStatus {
    Prepared,
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EncodingGroupStatus {
    Alive,
    Suspect,
    Faulty,
}

/// A member of the cluster.
///
/// `incarnation` orders competing status claims. It never decreases for a
/// given id, and only the node itself raises it to refute a suspicion.
/// `name`, `address` and `node_type` belong to the authoritative side and are
/// never rewritten by gossip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub incarnation: u64,
    pub name: String,
    pub address: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub volume_ids: Vec<VolumeId>,
}

impl Node {
    pub fn new(id: NodeId, name: &str, address: &str, node_type: NodeType) -> Self {
        Self {
            id,
            incarnation: 0,
            name: name.to_string(),
            address: address.to_string(),
            node_type,
            status: NodeStatus::Alive,
            volume_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: VolumeId,
    pub incarnation: u64,
    pub size: u64,
    pub speed: VolumeSpeed,
    pub status: VolumeStatus,
    pub owner: NodeId,
    pub encoding_group_ids: Vec<EncodingGroupId>,
    pub max_encoding_groups: u32,
}

/// Volumes cooperating to store one erasure-coded stripe.
///
/// The order of `member_volume_ids` matters: the last entry is the leader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingGroup {
    pub id: EncodingGroupId,
    pub incarnation: u64,
    pub status: EncodingGroupStatus,
    pub size: u64,
    pub used: u64,
    pub free: u64,
    pub unencoded: u64,
    pub member_volume_ids: Vec<VolumeId>,
}

impl EncodingGroup {
    /// Volume acting as primary for the group.
    pub fn leader(&self) -> Option<VolumeId> {
        self.member_volume_ids.last().copied()
    }
}

/// Versioned view of the cluster topology and health.
///
/// A published `CMap` is never edited in place: every change produces a new
/// value, either from the authoritative side or through the manager's commit
/// path. Cloning is a deep copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CMap {
    pub version: u64,
    pub created_at: u64,
    pub nodes: Vec<Node>,
    pub volumes: Vec<Volume>,
    pub encoding_groups: Vec<EncodingGroup>,
}

impl CMap {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            created_at: now_ms(),
            ..Default::default()
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    pub fn volume(&self, id: VolumeId) -> Option<&Volume> {
        self.volumes.iter().find(|volume| volume.id == id)
    }

    pub fn encoding_group(&self, id: EncodingGroupId) -> Option<&EncodingGroup> {
        self.encoding_groups.iter().find(|group| group.id == id)
    }

    /// True when an entity present in both maps differs in status or
    /// incarnation. Entities added or removed by the authoritative side do not
    /// count as a health change.
    pub fn health_differs(&self, other: &CMap) -> bool {
        let nodes = self.nodes.iter().any(|node| {
            other
                .node(node.id)
                .is_some_and(|o| o.status != node.status || o.incarnation != node.incarnation)
        });
        let volumes = self.volumes.iter().any(|volume| {
            other
                .volume(volume.id)
                .is_some_and(|o| o.status != volume.status || o.incarnation != volume.incarnation)
        });
        let groups = self.encoding_groups.iter().any(|group| {
            other
                .encoding_group(group.id)
                .is_some_and(|o| o.status != group.status || o.incarnation != group.incarnation)
        });

        nodes || volumes || groups
    }
}

/// Current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

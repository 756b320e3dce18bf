//! Query engine over a frozen `CMap`.
//!
//! Each builder narrows predicates; unset predicates match everything.
//! `find` performs a single scan and returns the first match, so repeated
//! point lookups with `random()` spread across all satisfying entities.

use super::error::{CMapError, Result};
use super::types::{
    CMap, EncodingGroup, EncodingGroupId, EncodingGroupStatus, Node, NodeId, NodeStatus, NodeType,
    Volume, VolumeId, VolumeSpeed, VolumeStatus,
};

use rand::seq::SliceRandom;

pub struct SearchCall {
    cmap: CMap,
}

impl SearchCall {
    pub fn new(cmap: CMap) -> Self {
        Self { cmap }
    }

    /// Version of the snapshot this call searches.
    pub fn version(&self) -> u64 {
        self.cmap.version
    }

    pub fn node(&self) -> NodeQuery<'_> {
        NodeQuery {
            nodes: &self.cmap.nodes,
            id: None,
            name: None,
            node_type: None,
            status: None,
            random: false,
        }
    }

    pub fn volume(&self) -> VolumeQuery<'_> {
        VolumeQuery {
            volumes: &self.cmap.volumes,
            id: None,
            status: None,
            speed: None,
            owner: None,
            random: false,
        }
    }

    pub fn encoding_group(&self) -> EncodingGroupQuery<'_> {
        EncodingGroupQuery {
            groups: &self.cmap.encoding_groups,
            id: None,
            status: None,
            member: None,
            random: false,
        }
    }
}

/// Linear scan, optionally over a shuffled order.
fn first_match<'a, T, F>(items: &'a [T], random: bool, matches: F) -> Option<&'a T>
where
    F: Fn(&T) -> bool,
{
    if !random {
        return items.iter().find(|item| matches(item));
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.shuffle(&mut rand::thread_rng());
    order
        .into_iter()
        .map(|idx| &items[idx])
        .find(|item| matches(item))
}

pub struct NodeQuery<'a> {
    nodes: &'a [Node],
    id: Option<NodeId>,
    name: Option<String>,
    node_type: Option<NodeType>,
    status: Option<NodeStatus>,
    random: bool,
}

impl NodeQuery<'_> {
    pub fn id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn random(mut self) -> Self {
        self.random = true;
        self
    }

    pub fn find(self) -> Result<Node> {
        first_match(self.nodes, self.random, |node| {
            self.id.is_none_or(|id| node.id == id)
                && self.name.as_deref().is_none_or(|name| node.name == name)
                && self.node_type.is_none_or(|t| node.node_type == t)
                && self.status.is_none_or(|s| node.status == s)
        })
        .cloned()
        .ok_or(CMapError::NotFound("node"))
    }
}

pub struct VolumeQuery<'a> {
    volumes: &'a [Volume],
    id: Option<VolumeId>,
    status: Option<VolumeStatus>,
    speed: Option<VolumeSpeed>,
    owner: Option<NodeId>,
    random: bool,
}

impl VolumeQuery<'_> {
    pub fn id(mut self, id: VolumeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn status(mut self, status: VolumeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn speed(mut self, speed: VolumeSpeed) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn owner(mut self, owner: NodeId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn random(mut self) -> Self {
        self.random = true;
        self
    }

    pub fn find(self) -> Result<Volume> {
        first_match(self.volumes, self.random, |volume| {
            self.id.is_none_or(|id| volume.id == id)
                && self.status.is_none_or(|s| volume.status == s)
                && self.speed.is_none_or(|s| volume.speed == s)
                && self.owner.is_none_or(|owner| volume.owner == owner)
        })
        .cloned()
        .ok_or(CMapError::NotFound("volume"))
    }
}

pub struct EncodingGroupQuery<'a> {
    groups: &'a [EncodingGroup],
    id: Option<EncodingGroupId>,
    status: Option<EncodingGroupStatus>,
    member: Option<VolumeId>,
    random: bool,
}

impl EncodingGroupQuery<'_> {
    pub fn id(mut self, id: EncodingGroupId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn status(mut self, status: EncodingGroupStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only groups containing `volume`.
    pub fn member(mut self, volume: VolumeId) -> Self {
        self.member = Some(volume);
        self
    }

    pub fn random(mut self) -> Self {
        self.random = true;
        self
    }

    pub fn find(self) -> Result<EncodingGroup> {
        first_match(self.groups, self.random, |group| {
            self.id.is_none_or(|id| group.id == id)
                && self.status.is_none_or(|s| group.status == s)
                && self
                    .member
                    .is_none_or(|volume| group.member_volume_ids.contains(&volume))
        })
        .cloned()
        .ok_or(CMapError::NotFound("encoding group"))
    }
}

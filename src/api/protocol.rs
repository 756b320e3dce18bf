//! Admin API Protocol
//!
//! Endpoints and Data Transfer Objects exposed over HTTP so operators and the
//! authoritative metadata layer can read the cluster map and publish new versions.

use crate::cmap::{NodeStatus, NodeType, VolumeSpeed, VolumeStatus};
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Current cluster map (GET) or authoritative update (POST).
pub const ENDPOINT_CMAP: &str = "/cmap";
/// Current cluster map version.
pub const ENDPOINT_CMAP_VERSION: &str = "/cmap/version";
/// First node matching the query parameters.
pub const ENDPOINT_SEARCH_NODE: &str = "/search/node";
/// First volume matching the query parameters.
pub const ENDPOINT_SEARCH_VOLUME: &str = "/search/volume";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u64,
}

/// Result of publishing a cluster map.
///
/// `committed = false` means the submitted version was not newer than the
/// current one; `version` then holds the current version.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub committed: bool,
    pub version: u64,
}

/// Answer to a search request. `found` is `None` when nothing matched.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse<T> {
    pub version: u64,
    pub found: Option<T>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodeSearchParams {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub node_type: Option<NodeType>,
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub random: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VolumeSearchParams {
    pub id: Option<u64>,
    pub status: Option<VolumeStatus>,
    pub speed: Option<VolumeSpeed>,
    pub owner: Option<u64>,
    #[serde(default)]
    pub random: bool,
}

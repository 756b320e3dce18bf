//! Incarnation-based merge of two cluster maps.
//!
//! Gossip propagates *status*, not *topology*: `merge` only compares entities
//! present on both sides. New entities normally arrive through the
//! authoritative `update` path; `reconcile` adds a peer's unknown entities only
//! when both maps claim the same version.

use super::types::{CMap, EncodingGroup, Node, NodeStatus, Volume};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Which side of a reconciliation supplied the structure of the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    Local,
    Remote,
}

/// Result of folding a peer's map into the local one.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub merged: CMap,
    pub baseline: Baseline,
    /// Entity-level deltas were folded into the baseline.
    pub changed: bool,
}

/// Folds `src`'s entity deltas into a copy of `dst`.
///
/// For each id present on both sides the higher incarnation wins and `dst`
/// wins ties; at equal incarnation an `Alive` node claim clears a `Suspect`.
/// A node that is `Faulty` on either side stays `Faulty` at the higher of the
/// two incarnations, whichever side is the baseline.
///
/// Returns the merged map and whether any field changed. `merge(s, s)` is
/// always `(s, false)`.
pub fn merge(src: &CMap, dst: &CMap) -> (CMap, bool) {
    let mut merged = dst.clone();
    let mut changed = false;

    let src_nodes = index(&src.nodes, |node| node.id);
    for node in merged.nodes.iter_mut() {
        if let Some(theirs) = src_nodes.get(&node.id) {
            changed |= merge_node(theirs, node);
        }
    }

    let src_volumes = index(&src.volumes, |volume| volume.id);
    for volume in merged.volumes.iter_mut() {
        if let Some(theirs) = src_volumes.get(&volume.id) {
            changed |= merge_volume(theirs, volume);
        }
    }

    let src_groups = index(&src.encoding_groups, |group| group.id);
    for group in merged.encoding_groups.iter_mut() {
        if let Some(theirs) = src_groups.get(&group.id) {
            changed |= merge_encoding_group(theirs, group);
        }
    }

    (merged, changed)
}

/// Merges a remote map with the local one, using the higher version as the
/// baseline. On equal versions the local map is the baseline, the remote
/// deltas are folded in and entities only the remote knows are added
/// first-seen; the peer performs the mirror merge on its side of the same
/// exchange.
pub fn reconcile(local: &CMap, remote: &CMap) -> Reconciled {
    if remote.version > local.version {
        let (merged, changed) = merge(local, remote);
        return Reconciled {
            merged,
            baseline: Baseline::Remote,
            changed,
        };
    }

    let (mut merged, mut changed) = merge(remote, local);
    if remote.version == local.version {
        changed |= adopt_unknown(remote, &mut merged);
    }
    Reconciled {
        merged,
        baseline: Baseline::Local,
        changed,
    }
}

/// Appends entities of `src` whose ids `dst` lacks. Returns whether any were added.
fn adopt_unknown(src: &CMap, dst: &mut CMap) -> bool {
    let before = dst.nodes.len() + dst.volumes.len() + dst.encoding_groups.len();

    append_missing(&src.nodes, &mut dst.nodes, |node| node.id);
    append_missing(&src.volumes, &mut dst.volumes, |volume| volume.id);
    append_missing(&src.encoding_groups, &mut dst.encoding_groups, |group| {
        group.id
    });

    let after = dst.nodes.len() + dst.volumes.len() + dst.encoding_groups.len();
    if after > before {
        tracing::debug!(
            "Adopted {} entities unknown at cmap v{}",
            after - before,
            dst.version
        );
    }
    after > before
}

fn append_missing<T, K, F>(src: &[T], dst: &mut Vec<T>, key: F)
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut known: HashSet<K> = dst.iter().map(&key).collect();
    for item in src {
        // first occurrence wins on duplicate ids
        if known.insert(key(item)) {
            dst.push(item.clone());
        }
    }
}

fn index<T, K, F>(items: &[T], key: F) -> HashMap<K, &T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        // first occurrence wins on duplicate ids
        map.entry(key(item)).or_insert(item);
    }
    map
}

fn merge_node(src: &Node, dst: &mut Node) -> bool {
    if dst.status == NodeStatus::Faulty || src.status == NodeStatus::Faulty {
        let incarnation = src.incarnation.max(dst.incarnation);
        let changed = dst.status != NodeStatus::Faulty || dst.incarnation != incarnation;
        dst.status = NodeStatus::Faulty;
        dst.incarnation = incarnation;
        return changed;
    }

    if src.incarnation > dst.incarnation {
        dst.incarnation = src.incarnation;
        dst.status = src.status;
        return true;
    }

    if src.incarnation == dst.incarnation
        && dst.status == NodeStatus::Suspect
        && src.status == NodeStatus::Alive
    {
        dst.status = NodeStatus::Alive;
        return true;
    }

    false
}

fn merge_volume(src: &Volume, dst: &mut Volume) -> bool {
    if src.incarnation <= dst.incarnation {
        return false;
    }

    dst.incarnation = src.incarnation;
    dst.status = src.status;
    dst.size = src.size;
    true
}

fn merge_encoding_group(src: &EncodingGroup, dst: &mut EncodingGroup) -> bool {
    if src.incarnation <= dst.incarnation {
        return false;
    }

    dst.incarnation = src.incarnation;
    dst.status = src.status;
    dst.size = src.size;
    dst.used = src.used;
    dst.free = src.free;
    dst.unencoded = src.unencoded;
    true
}

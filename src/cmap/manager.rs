//! Cluster Map Manager
//!
//! Holds the current `CMap` and is the only place a new snapshot gets
//! published. Every publication goes through `commit`, which runs under a
//! single write lock that also guards the notification registries, so
//! "register, then compare with the current version" can never race with a
//! commit.
//!
//! ## Notifications
//! - **Version advanced** (`get_updated_noti`): one-shot, fired by the first
//!   commit whose version is greater than the caller's version.
//! - **State changed** (`get_state_changed_noti`): one-shot, fired by the first
//!   commit that changes the status or incarnation of an entity that existed
//!   before the commit.
//!
//! Both use `tokio::sync::oneshot`, whose `send` never blocks, so a slow or
//! absent receiver cannot stall the committing writer.

use super::error::{CMapError, Result};
use super::merge::{Baseline, reconcile};
use super::search::SearchCall;
use super::store::SnapshotStore;
use super::types::{CMap, now_ms};

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

const DEFAULT_HISTORY_LIMIT: usize = 16;

/// Outcome of an authoritative `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Committed(u64),
    /// The candidate was not newer than the current map; nothing changed.
    Stale { current: u64 },
}

/// Outcome of folding a peer's map into the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Version held after the merge.
    pub version: u64,
    pub baseline: Baseline,
    /// A new snapshot was published.
    pub committed: bool,
    /// Status or incarnation of a known entity changed.
    pub health_changed: bool,
}

struct VersionWaiter {
    since: u64,
    tx: oneshot::Sender<u64>,
}

struct ManagerState {
    current: CMap,
    history: BTreeMap<u64, CMap>,
    updated_waiters: HashMap<u64, VersionWaiter>,
    changed_waiters: HashMap<u64, oneshot::Sender<u64>>,
    next_token: u64,
}

impl ManagerState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Single owner of the current cluster map.
///
/// Every commit saves through the `SnapshotStore` while holding the write
/// lock, and the gossip server commits from tokio worker tasks. A
/// `FileStore` save is a small blocking write; stores with slow or remote
/// backends should not be used here without moving `save` off the runtime.
pub struct CMapManager {
    state: RwLock<ManagerState>,
    version: AtomicU64,
    store: Arc<dyn SnapshotStore>,
    history_limit: usize,
}

impl CMapManager {
    /// Creates a manager seeded from the newest snapshot in `store`, or an
    /// empty version-0 map when the store is empty.
    pub fn new(store: Arc<dyn SnapshotStore>) -> Result<Arc<Self>> {
        let initial = store
            .load_latest()
            .map_err(CMapError::Load)?
            .unwrap_or_else(|| CMap::new(0));

        tracing::info!(
            "Loaded cmap v{} ({} nodes, {} volumes, {} encoding groups)",
            initial.version,
            initial.nodes.len(),
            initial.volumes.len(),
            initial.encoding_groups.len()
        );

        Ok(Self::with_snapshot(store, initial))
    }

    /// Creates a manager holding `initial` without saving it.
    pub fn with_snapshot(store: Arc<dyn SnapshotStore>, initial: CMap) -> Arc<Self> {
        let version = initial.version;
        let mut history = BTreeMap::new();
        history.insert(version, initial.clone());

        Arc::new(Self {
            state: RwLock::new(ManagerState {
                current: initial,
                history,
                updated_waiters: HashMap::new(),
                changed_waiters: HashMap::new(),
                next_token: 0,
            }),
            version: AtomicU64::new(version),
            store,
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    pub fn latest_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Deep copy of the current map.
    pub fn latest_snapshot(&self) -> CMap {
        self.state.read().current.clone()
    }

    /// A retained historical snapshot, if still held.
    pub fn snapshot_at(&self, version: u64) -> Option<CMap> {
        self.state.read().history.get(&version).cloned()
    }

    pub fn search_call(&self) -> SearchCall {
        SearchCall::new(self.latest_snapshot())
    }

    /// Publishes a snapshot produced by the authoritative side.
    ///
    /// Candidates that are not newer than the current map are ignored, which
    /// makes repeated delivery of the same snapshot harmless. A failed save
    /// aborts the commit and is returned to the caller.
    pub fn update(&self, candidate: CMap) -> Result<UpdateOutcome> {
        let mut state = self.state.write();

        if candidate.version <= state.current.version {
            tracing::debug!(
                "Ignoring stale cmap v{} (current v{})",
                candidate.version,
                state.current.version
            );
            return Ok(UpdateOutcome::Stale {
                current: state.current.version,
            });
        }

        let version = candidate.version;
        self.commit(&mut state, candidate)?;
        Ok(UpdateOutcome::Committed(version))
    }

    /// Folds a snapshot received through gossip into the current map.
    ///
    /// The higher version supplies the structure; the other side's
    /// higher-incarnation entity states are folded into it. Nothing is
    /// published when the merge changes nothing.
    pub fn merge_remote(&self, peer: &CMap) -> Result<MergeReport> {
        let mut state = self.state.write();
        let reconciled = reconcile(&state.current, peer);

        let publish = match reconciled.baseline {
            Baseline::Remote => true,
            Baseline::Local => reconciled.changed,
        };
        if !publish {
            return Ok(MergeReport {
                version: state.current.version,
                baseline: reconciled.baseline,
                committed: false,
                health_changed: false,
            });
        }

        let health_changed = state.current.health_differs(&reconciled.merged);
        let mut merged = reconciled.merged;
        if reconciled.baseline == Baseline::Local {
            merged.created_at = now_ms();
        }
        let version = merged.version;

        tracing::debug!(
            "Merged peer cmap v{} into v{} (baseline {:?}, changed={})",
            peer.version,
            state.current.version,
            reconciled.baseline,
            reconciled.changed
        );

        self.commit(&mut state, merged)?;

        Ok(MergeReport {
            version,
            baseline: reconciled.baseline,
            committed: true,
            health_changed,
        })
    }

    /// Applies a local edit as the next version.
    ///
    /// `edit` works on a copy of the current map and returns whether it
    /// changed anything. Returns the committed version, or `None` when the
    /// edit was a no-op.
    pub fn mutate<F>(&self, edit: F) -> Result<Option<u64>>
    where
        F: FnOnce(&mut CMap) -> bool,
    {
        let mut state = self.state.write();

        let mut candidate = state.current.clone();
        if !edit(&mut candidate) {
            return Ok(None);
        }
        candidate.version = state.current.version + 1;
        candidate.created_at = now_ms();

        let version = candidate.version;
        self.commit(&mut state, candidate)?;
        Ok(Some(version))
    }

    /// One-shot signal carrying the first committed version greater than
    /// `since`. Already signaled when the current map is newer.
    pub fn get_updated_noti(&self, since: u64) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.write();

        if state.current.version > since {
            let _ = tx.send(state.current.version);
            return rx;
        }

        let token = state.token();
        state
            .updated_waiters
            .insert(token, VersionWaiter { since, tx });
        rx
    }

    /// One-shot signal fired by the next commit that changes the health of a
    /// known entity. Carries the version of that commit.
    pub fn get_state_changed_noti(&self) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.write();

        let token = state.token();
        state.changed_waiters.insert(token, tx);
        rx
    }

    /// Number of registrations still waiting, for diagnostics.
    pub fn pending_notifications(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.updated_waiters.len(), state.changed_waiters.len())
    }

    fn commit(&self, state: &mut ManagerState, candidate: CMap) -> Result<()> {
        self.store
            .save(&candidate)
            .map_err(|source| CMapError::Persistence {
                version: candidate.version,
                source,
            })?;

        // receivers dropped by their callers
        state.updated_waiters.retain(|_, waiter| !waiter.tx.is_closed());
        state.changed_waiters.retain(|_, tx| !tx.is_closed());

        let floor = state
            .updated_waiters
            .values()
            .map(|waiter| waiter.since)
            .min();

        let previous = std::mem::replace(&mut state.current, candidate);
        let version = state.current.version;
        let advanced = version > previous.version;
        let health_changed = previous.health_differs(&state.current);

        self.version.store(version, Ordering::Release);
        state.history.insert(version, state.current.clone());

        if advanced {
            let ready: Vec<u64> = state
                .updated_waiters
                .iter()
                .filter(|(_, waiter)| waiter.since < version)
                .map(|(token, _)| *token)
                .collect();
            for token in ready {
                if let Some(waiter) = state.updated_waiters.remove(&token) {
                    let _ = waiter.tx.send(version);
                }
            }
        }

        if health_changed {
            for (_, tx) in state.changed_waiters.drain() {
                let _ = tx.send(version);
            }
        }

        self.retire_history(state, floor.unwrap_or(version).min(version));

        tracing::info!(
            "Committed cmap v{} (advanced={}, health_changed={})",
            version,
            advanced,
            health_changed
        );

        Ok(())
    }

    /// Drops the oldest snapshots beyond `history_limit`, never one at or
    /// above `floor`.
    fn retire_history(&self, state: &mut ManagerState, floor: u64) {
        while state.history.len() > self.history_limit {
            let Some(&oldest) = state.history.keys().next() else {
                break;
            };
            if oldest >= floor {
                break;
            }
            state.history.remove(&oldest);
        }
    }
}

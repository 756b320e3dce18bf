//! Snapshot persistence.
//!
//! The manager saves every committed snapshot before publishing it and seeds
//! itself from the newest saved snapshot at startup.

use super::error::StoreError;
use super::types::CMap;

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const FILE_PREFIX: &str = "cmap.";
const FILE_SUFFIX: &str = ".json";
const DEFAULT_KEEP: usize = 8;

/// Persistence collaborator of `CMapManager`.
///
/// `save` runs synchronously under the manager's write lock, before the
/// snapshot is published, so implementations must not call back into the
/// manager and should return quickly.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, cmap: &CMap) -> Result<(), StoreError>;

    /// Newest saved snapshot, `None` when nothing was saved yet.
    fn load_latest(&self) -> Result<Option<CMap>, StoreError>;
}

/// Stores one JSON file per version in a directory and keeps the newest few.
pub struct FileStore {
    dir: PathBuf,
    keep: usize,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keep: DEFAULT_KEEP,
        })
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:020}{}", FILE_PREFIX, version, FILE_SUFFIX))
    }

    /// Saved versions in ascending order.
    fn versions(&self) -> Result<Vec<(u64, PathBuf)>, StoreError> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let parsed = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|digits| digits.parse::<u64>().ok());
            if let Some(version) = parsed {
                versions.push((version, path));
            }
        }
        versions.sort_by_key(|(version, _)| *version);
        Ok(versions)
    }

    fn prune(&self) -> Result<(), StoreError> {
        let versions = self.versions()?;
        if versions.len() <= self.keep {
            return Ok(());
        }
        let excess = versions.len() - self.keep;
        for (version, path) in versions.into_iter().take(excess) {
            tracing::debug!("Removing retired cmap snapshot v{}", version);
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileStore {
    fn save(&self, cmap: &CMap) -> Result<(), StoreError> {
        let path = self.path_for(cmap.version);
        let tmp = path.with_extension("json.tmp");

        let encoded = serde_json::to_vec_pretty(cmap)?;
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &path)?;

        // the snapshot is already durable
        if let Err(e) = self.prune() {
            tracing::warn!(
                "Failed to prune cmap snapshots in {}: {}",
                self.dir.display(),
                e
            );
        }
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<CMap>, StoreError> {
        let Some((_, path)) = self.versions()?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// In-process store, mainly for tests and simulations.
///
/// `set_failing(true)` makes every `save` fail until reset.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<CMap>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(cmap: CMap) -> Self {
        Self {
            saved: Mutex::new(vec![cmap]),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saved_versions(&self) -> Vec<u64> {
        self.saved.lock().iter().map(|cmap| cmap.version).collect()
    }

    pub fn save_count(&self) -> usize {
        self.saved.lock().len()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, cmap: &CMap) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        self.saved.lock().push(cmap.clone());
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<CMap>, StoreError> {
        Ok(self
            .saved
            .lock()
            .iter()
            .max_by_key(|cmap| cmap.version)
            .cloned())
    }
}

use thiserror::Error;

/// Failures of the snapshot persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the cluster-map manager and its query engine.
#[derive(Debug, Error)]
pub enum CMapError {
    /// A search found no entity matching all predicates.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The snapshot store could not produce a starting snapshot.
    #[error("failed to load cmap: {0}")]
    Load(#[source] StoreError),
    /// Saving the candidate snapshot failed; nothing was committed.
    #[error("failed to persist cmap version {version}: {source}")]
    Persistence {
        version: u64,
        #[source]
        source: StoreError,
    },
}

pub type Result<T> = std::result::Result<T, CMapError>;

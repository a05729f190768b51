//! Mesh generation errors.

use terrastream_core::TileId;
use thiserror::Error;

/// Errors produced by mesh building and the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Heightmap or request parameters are unusable.
    #[error("Invalid mesh input: {0}")]
    InvalidInput(String),

    /// A worker reported a failure.
    #[error("Mesh generation failed for {tile}: {message}")]
    Failed { tile: TileId, message: String },

    /// Task was cancelled before a result was delivered.
    #[error("Mesh task for {0} was cancelled")]
    Cancelled(TileId),

    /// A newer request for the same tile replaced this one.
    #[error("Mesh task for {0} was superseded")]
    Superseded(TileId),

    /// Pool was used before `initialize`.
    #[error("Mesh worker pool not initialized")]
    NotInitialized,

    /// Pool was terminated while the task was pending.
    #[error("Mesh worker pool terminated")]
    Terminated,

    /// The worker holding the task went away.
    #[error("Mesh worker {0} disconnected")]
    WorkerLost(usize),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, MeshError>;

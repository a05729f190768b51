//! Streaming error types.

use terrastream_core::TileId;
use terrastream_gpu::GpuError;
use thiserror::Error;

/// Error category reported with tile failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Descriptor or raster fetch failed.
    Network,
    /// Buffer creation or write failed.
    Gpu,
    /// Worker or fallback meshing failed.
    MeshGeneration,
    /// Pool memory pressure (reported, not enforced).
    Memory,
    /// Malformed raster.
    InvalidData,
    /// Controller used outside its lifecycle, or a tile left its pipeline order.
    State,
}

/// Streaming errors.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Mesh generation failed: {0}")]
    MeshGeneration(String),

    #[error("Memory pressure: {0}")]
    Memory(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Streamer not initialized")]
    NotInitialized,

    #[error("Streamer destroyed")]
    Destroyed,

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("{tile} cannot move from {from} to {to}")]
    StageTransition {
        tile: TileId,
        from: &'static str,
        to: &'static str,
    },
}

impl StreamError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Gpu(_) => ErrorKind::Gpu,
            Self::MeshGeneration(_) => ErrorKind::MeshGeneration,
            Self::Memory(_) => ErrorKind::Memory,
            Self::InvalidData(_) => ErrorKind::InvalidData,
            Self::NotInitialized
            | Self::Destroyed
            | Self::Initialization(_)
            | Self::StageTransition { .. } => ErrorKind::State,
        }
    }

    /// Whether re-issuing the load may succeed.
    pub fn retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }
}

impl From<terrastream_core::Error> for StreamError {
    fn from(e: terrastream_core::Error) -> Self {
        match e {
            terrastream_core::Error::InvalidData(msg) => Self::InvalidData(msg),
            other => Self::Network(other.to_string()),
        }
    }
}

impl From<terrastream_mesh::MeshError> for StreamError {
    fn from(e: terrastream_mesh::MeshError) -> Self {
        match e {
            terrastream_mesh::MeshError::Failed { tile, message } => {
                Self::MeshGeneration(format!("{tile}: {message}"))
            }
            other => Self::MeshGeneration(other.to_string()),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, StreamError>;

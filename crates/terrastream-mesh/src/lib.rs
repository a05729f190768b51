//! Heightmap-to-mesh conversion for the Terrastream engine.
//!
//! Meshing runs on a small fixed pool of worker threads that talk to the
//! pool coordinator only through the versioned messages in [`protocol`].
//! When no worker comes up, the pool falls back to an in-process builder.

pub mod builder;
pub mod error;
pub mod pool;
pub mod protocol;

pub use builder::{build_fallback_mesh, build_mesh};
pub use error::{MeshError, Result};
pub use pool::{CancelOutcome, MeshPoolConfig, MeshTicket, MeshWorkerPool, WorkerPoolStats};
pub use protocol::{MeshData, MeshRequest, MeshResponse, WorldOffset, PROTOCOL_VERSION};

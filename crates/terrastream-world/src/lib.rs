//! Terrain tile streaming for the Terrastream engine.
//!
//! The [`TileStreamer`] keeps a bounded set of tiles resident around the
//! player: it asks the tile backend for descriptors, downloads heightmaps on
//! a fetch pool, meshes them on the mesh worker pool, uploads the result into
//! pooled GPU buffers and evicts tiles that fall out of range.

pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod queue;
pub mod streaming;
pub mod tile;
pub mod tile_table;

pub use config::StreamingConfig;
pub use error::{ErrorKind, Result, StreamError};
pub use events::{EventBus, EventKind, PerformanceSample, StreamEvent, TileErrorEvent};
pub use queue::LoadingQueue;
pub use streaming::{
    LoadReport, MemoryStats, PositionUpdate, StreamingStatus, TileStreamer, VisibleTile,
};
pub use tile::{Tile, TileBuffers, TileStage};
pub use tile_table::TileTable;

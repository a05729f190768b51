//! Streaming lifecycle notifications.
//!
//! Hosts either register handlers per [`EventKind`] or take a channel that
//! receives every event. Any number of handlers may be registered for the
//! same kind; they run in registration order on the thread that drives the
//! streamer.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use terrastream_core::{GeoCoord, TileId};

use crate::error::{ErrorKind, StreamError};

/// Event categories hosts can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    TileLoaded,
    TileUnloaded,
    MeshGenerated,
    GpuResourcesCreated,
    Error,
    PerformanceUpdate,
}

/// A tile failure surfaced to the host.
#[derive(Clone, Debug, PartialEq)]
pub struct TileErrorEvent {
    /// `None` for failures not tied to one tile (e.g. the descriptor query).
    pub tile_id: Option<TileId>,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl TileErrorEvent {
    pub fn new(tile_id: Option<TileId>, error: &StreamError) -> Self {
        Self {
            tile_id,
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.retryable(),
        }
    }
}

/// Aggregate numbers for one load batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceSample {
    /// Tiles whose loads were started by the batch.
    pub batch_size: usize,
    pub loaded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Mean mesh time over every mesh built so far.
    pub average_mesh_time: Duration,
    pub tiles_resident: usize,
    pub memory_usage_mb: f64,
}

/// A streaming lifecycle event.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TileLoaded {
        tile_id: TileId,
        center: GeoCoord,
    },
    TileUnloaded {
        tile_id: TileId,
    },
    MeshGenerated {
        tile_id: TileId,
        vertex_count: u32,
        index_count: u32,
        processing_time: Duration,
    },
    GpuResourcesCreated {
        tile_id: TileId,
        vertex_bytes: u64,
        index_bytes: u64,
    },
    Error(TileErrorEvent),
    PerformanceUpdate(PerformanceSample),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TileLoaded { .. } => EventKind::TileLoaded,
            Self::TileUnloaded { .. } => EventKind::TileUnloaded,
            Self::MeshGenerated { .. } => EventKind::MeshGenerated,
            Self::GpuResourcesCreated { .. } => EventKind::GpuResourcesCreated,
            Self::Error(_) => EventKind::Error,
            Self::PerformanceUpdate(_) => EventKind::PerformanceUpdate,
        }
    }
}

/// Callback invoked for events of one kind.
pub type EventHandler = Box<dyn FnMut(&StreamEvent) + Send>;

/// Fan-out of events to handlers and channel subscribers.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<(EventKind, EventHandler)>,
    subscribers: Vec<Sender<StreamEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&StreamEvent) + Send + 'static,
    {
        self.handlers.push((kind, Box::new(handler)));
    }

    /// Receive every event on a channel.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<StreamEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Number of handlers plus live channel subscribers.
    pub fn listener_count(&self) -> usize {
        self.handlers.len() + self.subscribers.len()
    }

    /// Deliver an event to matching handlers and all subscribers.
    pub fn emit(&mut self, event: &StreamEvent) {
        let kind = event.kind();
        for (_, handler) in self.handlers.iter_mut().filter(|(k, _)| *k == kind) {
            handler(event);
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

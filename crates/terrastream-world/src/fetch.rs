//! Raster download pool.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use terrastream_core::{HeightmapRaster, RasterFetcher, TileId};
use tracing::trace;

use crate::error::{Result, StreamError};

/// Completed download, tagged with the load epoch it was issued for.
#[derive(Debug)]
pub struct FetchOutcome {
    pub tile_id: TileId,
    pub epoch: u64,
    pub result: terrastream_core::Result<HeightmapRaster>,
}

/// Runs raster fetches on a dedicated thread pool.
///
/// Fetches are fire-and-forget; results come back on a channel and are
/// matched against the tile's current epoch by the caller.
pub struct FetchPool {
    pool: ThreadPool,
    fetcher: Arc<dyn RasterFetcher>,
    tx: Sender<FetchOutcome>,
    rx: Receiver<FetchOutcome>,
}

impl FetchPool {
    pub fn new(fetcher: Arc<dyn RasterFetcher>, threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("tile-fetch-{i}"))
            .build()
            .map_err(|e| StreamError::Initialization(e.to_string()))?;
        let (tx, rx) = channel::unbounded();
        Ok(Self {
            pool,
            fetcher,
            tx,
            rx,
        })
    }

    /// Start downloading `url` for `tile_id`.
    pub fn spawn(&self, tile_id: TileId, epoch: u64, url: String) {
        let fetcher = Arc::clone(&self.fetcher);
        let tx = self.tx.clone();
        self.pool.spawn(move || {
            trace!("Fetching raster for {tile_id} from {url}");
            let result = fetcher.fetch_raster(&url);
            // The receiver lives as long as the pool; a send error means teardown.
            let _ = tx.send(FetchOutcome {
                tile_id,
                epoch,
                result,
            });
        });
    }

    /// Take one completed fetch, if any.
    pub fn try_recv(&self) -> Option<FetchOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Completion channel, for use with `crossbeam::channel::Select`.
    pub fn receiver(&self) -> &Receiver<FetchOutcome> {
        &self.rx
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

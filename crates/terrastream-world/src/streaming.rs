//! Tile streaming based on player position.
//!
//! The streamer is driven from one thread. Raster downloads run on the fetch
//! pool and meshing on the mesh worker pool; their results are collected by
//! [`TileStreamer::pump`], and every state change (tile table, loading sets,
//! GPU uploads, events) happens on the driving thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Select;
use glam::Vec3;
use hashbrown::HashMap;
use terrastream_core::{GeoCoord, RasterFetcher, TileDescriptor, TileId, TileProvider};
use terrastream_gpu::{AllocatorStats, BufferAllocator, BufferHandle, GpuDevice};
use terrastream_mesh::pool::MeshResult;
use terrastream_mesh::{
    MeshData, MeshError, MeshRequest, MeshTicket, MeshWorkerPool, WorldOffset,
};
use tracing::{debug, info, trace, warn};

use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::events::{EventBus, EventKind, PerformanceSample, StreamEvent, TileErrorEvent};
use crate::fetch::{FetchOutcome, FetchPool};
use crate::queue::LoadingQueue;
use crate::tile::{Tile, TileBuffers};
use crate::tile_table::TileTable;

/// How long one settle iteration waits for a completion.
const SETTLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Destroyed,
}

#[derive(Debug, Clone, Copy, Default)]
struct PlayerPosition {
    current: Option<GeoCoord>,
    /// Position of the last committed restream.
    previous: Option<GeoCoord>,
}

/// Outcome of one load batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Descriptors returned by the backend.
    pub requested: usize,
    /// Loads actually started (descriptors already tracked are skipped).
    pub started: Vec<TileId>,
    /// Started tiles that reached the ready stage.
    pub loaded: usize,
    /// Started tiles that did not.
    pub failed: usize,
    /// Tiles evicted after the batch.
    pub evicted: Vec<TileId>,
    pub elapsed: Duration,
}

/// Result of [`TileStreamer::update_player_position`].
#[derive(Debug, Clone, PartialEq)]
pub enum PositionUpdate {
    /// Movement since the last restream was within the threshold.
    BelowThreshold { distance_deg: f64 },
    Streamed(LoadReport),
}

/// A tile ready to draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleTile {
    pub id: TileId,
    pub center: GeoCoord,
    pub world_position: Vec3,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// Memory held by the streamer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub gpu: AllocatorStats,
    pub gpu_mb: f64,
    /// Raster and mesh bytes kept on the CPU side.
    pub cpu_bytes: usize,
    pub tiles_resident: usize,
    pub tiles_ready: usize,
}

/// Snapshot of streaming activity.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingStatus {
    pub tiles_loaded: usize,
    pub memory_usage_mb: f64,
    pub workers_active: usize,
    pub total_workers: usize,
    /// Tiles fetching, meshing or uploading.
    pub queue_size: usize,
    pub player_coords: Option<GeoCoord>,
}

/// Keeps the tiles around the player resident on the GPU.
pub struct TileStreamer<D: GpuDevice> {
    config: StreamingConfig,
    provider: Arc<dyn TileProvider>,
    fetcher: Arc<dyn RasterFetcher>,
    fetch_pool: Option<FetchPool>,
    mesh_pool: MeshWorkerPool,
    allocator: BufferAllocator<D>,
    tiles: TileTable,
    queue: LoadingQueue,
    mesh_tickets: HashMap<TileId, MeshTicket>,
    player: PlayerPosition,
    events: EventBus,
    next_epoch: u64,
    mesh_time_total: Duration,
    meshes_built: u32,
    lifecycle: Lifecycle,
}

impl<D: GpuDevice> TileStreamer<D> {
    /// Create a streamer. Call [`initialize`](Self::initialize) before loading.
    pub fn new(
        device: Arc<D>,
        provider: Arc<dyn TileProvider>,
        fetcher: Arc<dyn RasterFetcher>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            mesh_pool: MeshWorkerPool::new(config.mesh.clone()),
            allocator: BufferAllocator::new(device, config.allocator.clone()),
            config,
            provider,
            fetcher,
            fetch_pool: None,
            tiles: TileTable::new(),
            queue: LoadingQueue::new(),
            mesh_tickets: HashMap::new(),
            player: PlayerPosition::default(),
            events: EventBus::new(),
            next_epoch: 0,
            mesh_time_total: Duration::ZERO,
            meshes_built: 0,
            lifecycle: Lifecycle::Created,
        }
    }

    /// Start the fetch pool and the mesh workers.
    ///
    /// Calling this again on a running streamer does nothing.
    pub fn initialize(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Destroyed => return Err(StreamError::Destroyed),
            Lifecycle::Created => {}
        }

        let fetch_pool = FetchPool::new(Arc::clone(&self.fetcher), self.config.fetch_threads)?;
        self.mesh_pool.initialize();

        info!(
            fetch_threads = fetch_pool.thread_count(),
            mesh_workers = self.mesh_pool.stats().total_workers,
            fallback = self.mesh_pool.is_fallback(),
            "Tile streamer initialized"
        );
        self.fetch_pool = Some(fetch_pool);
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(StreamError::NotInitialized),
            Lifecycle::Destroyed => Err(StreamError::Destroyed),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    /// Start loading the `(2 * radius + 1)^2` grid around a position without
    /// waiting for it. Returns the tiles whose loads were started.
    pub fn request_initial_grid(&mut self, lat: f64, lng: f64, radius: u32) -> Result<Vec<TileId>> {
        self.start_grid(GeoCoord::new(lat, lng), radius)
            .map(|(_, started)| started)
    }

    /// Load the `(2 * radius + 1)^2` grid around a position and wait for it.
    ///
    /// Tiles fail independently; failures are reported as error events and
    /// counted in the report.
    pub fn load_initial_grid(&mut self, lat: f64, lng: f64, radius: u32) -> Result<LoadReport> {
        let start = Instant::now();
        let (requested, started) = self.start_grid(GeoCoord::new(lat, lng), radius)?;
        self.settle_tiles(&started);
        Ok(self.finish_batch(requested, started, Vec::new(), start))
    }

    fn start_grid(&mut self, center: GeoCoord, radius: u32) -> Result<(usize, Vec<TileId>)> {
        self.ensure_running()?;
        self.player.current = Some(center);
        self.player.previous = Some(center);

        let descriptors = match self.provider.tile_grid(center, radius) {
            Ok(descriptors) => descriptors,
            Err(e) => return Err(self.report_error(None, e.into())),
        };
        debug!(%center, radius, count = descriptors.len(), "Requested tile grid");

        let requested = descriptors.len();
        let started = self.begin_loads(descriptors)?;
        Ok((requested, started))
    }

    /// Move the player and restream if the movement exceeds the threshold.
    ///
    /// Below the threshold nothing is requested and the restream origin stays
    /// where it was, so slow drift accumulates until it crosses the threshold.
    /// Otherwise the backend is asked for the tiles entering the preload
    /// area, they are loaded, distant tiles are evicted and the new position
    /// becomes the restream origin.
    pub fn update_player_position(&mut self, lat: f64, lng: f64) -> Result<PositionUpdate> {
        self.ensure_running()?;
        let target = GeoCoord::new(lat, lng);
        let previous = self.player.previous;

        if let Some(previous) = previous {
            let distance_deg = target.planar_distance_deg(previous);
            if distance_deg <= self.config.movement_threshold_deg {
                self.player.current = Some(target);
                trace!(distance_deg, "Movement below restream threshold");
                return Ok(PositionUpdate::BelowThreshold { distance_deg });
            }
        }

        let start = Instant::now();
        self.player.current = Some(target);

        let queried = match previous {
            Some(previous) => self
                .provider
                .stream_tiles(target, previous, self.config.preload_distance)
                .map(|update| {
                    if !update.removed_tiles.is_empty() {
                        debug!(
                            count = update.removed_tiles.len(),
                            "Backend reports tiles out of range"
                        );
                    }
                    update.new_tiles
                }),
            // No restream origin yet: load the full preload area.
            None => self.provider.tile_grid(target, self.config.preload_distance),
        };
        let descriptors = match queried {
            Ok(descriptors) => descriptors,
            Err(e) => return Err(self.report_error(None, e.into())),
        };

        let requested = descriptors.len();
        let started = self.begin_loads(descriptors)?;
        self.settle_tiles(&started);
        let evicted = self.evict_distant_tiles();
        self.player.previous = Some(target);

        Ok(PositionUpdate::Streamed(
            self.finish_batch(requested, started, evicted, start),
        ))
    }

    fn begin_loads(&mut self, descriptors: Vec<TileDescriptor>) -> Result<Vec<TileId>> {
        let mut started = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let id = descriptor.id;
            if self.begin_load(descriptor)? {
                started.push(id);
            }
        }
        Ok(started)
    }

    /// Start fetching one tile unless it is already tracked.
    ///
    /// A tile evicted while its raster was still downloading picks that
    /// download back up instead of starting a second one.
    fn begin_load(&mut self, descriptor: TileDescriptor) -> Result<bool> {
        let id = descriptor.id;
        if self.tiles.contains(id) || self.queue.contains(id) {
            trace!(%id, "Tile already tracked, skipping load");
            return Ok(false);
        }

        if let Some(epoch) = self.queue.adopt_fetch(id) {
            debug!(%id, epoch, "Reusing raster fetch still in flight");
            self.tiles.insert(Tile::new(descriptor, epoch));
            return Ok(true);
        }

        let Some(fetch_pool) = self.fetch_pool.as_ref() else {
            return Err(StreamError::NotInitialized);
        };
        if !self.queue.start_fetch(id) {
            return Ok(false);
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let url = descriptor.raster_url().to_string();
        self.tiles.insert(Tile::new(descriptor, epoch));
        fetch_pool.spawn(id, epoch, url);
        Ok(true)
    }

    /// Process completed fetches and meshes.
    ///
    /// Waits up to `timeout` for the first completion when none is ready and
    /// work is in flight. Returns the number of completions processed.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let mut processed = self.drain_completions();
        let outstanding = self.queue.in_flight() + self.queue.orphaned_len();
        if processed == 0 && outstanding > 0 && self.wait_for_completion(timeout) {
            processed = self.drain_completions();
        }
        processed
    }

    /// Pump until no fetch or mesh is in flight.
    pub fn settle(&mut self) {
        while self.is_running_with_work() {
            self.pump(SETTLE_POLL);
        }
    }

    fn settle_tiles(&mut self, ids: &[TileId]) {
        while self.is_running_with_work() && ids.iter().any(|&id| self.queue.contains(id)) {
            self.pump(SETTLE_POLL);
        }
    }

    fn is_running_with_work(&self) -> bool {
        self.lifecycle == Lifecycle::Running && self.queue.in_flight() > 0
    }

    fn wait_for_completion(&self, timeout: Duration) -> bool {
        let Some(fetch_pool) = self.fetch_pool.as_ref() else {
            return false;
        };
        let mut select = Select::new();
        select.recv(fetch_pool.receiver());
        for ticket in self.mesh_tickets.values() {
            select.recv(ticket.receiver());
        }
        select.ready_timeout(timeout).is_ok()
    }

    fn drain_completions(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let mut progressed = false;

            while let Some(outcome) = self.fetch_pool.as_ref().and_then(FetchPool::try_recv) {
                self.handle_fetch(outcome);
                processed += 1;
                progressed = true;
            }

            let finished: Vec<(TileId, MeshResult)> = self
                .mesh_tickets
                .iter()
                .filter_map(|(&id, ticket)| ticket.try_result().map(|result| (id, result)))
                .collect();
            for (id, result) in finished {
                self.mesh_tickets.remove(&id);
                self.handle_mesh(id, result);
                processed += 1;
                progressed = true;
            }

            if !progressed {
                return processed;
            }
        }
    }

    fn handle_fetch(&mut self, outcome: FetchOutcome) {
        let FetchOutcome {
            tile_id,
            epoch,
            result,
        } = outcome;

        let world_position = self
            .tiles
            .with_tile(tile_id, |tile| {
                (tile.epoch == epoch && tile.is_fetching()).then_some(tile.world_position)
            })
            .flatten();
        let Some(world_position) = world_position else {
            if self.queue.drain_orphan(tile_id, epoch) {
                trace!(%tile_id, epoch, "Dropping raster of evicted tile");
            } else {
                trace!(%tile_id, epoch, "Dropping stale raster fetch");
            }
            return;
        };

        let raster = match result.and_then(|raster| raster.validate().map(|()| raster)) {
            Ok(raster) => raster,
            Err(e) => {
                self.fail_tile(tile_id, e.into());
                return;
            }
        };

        let request = MeshRequest {
            tile_id,
            heightmap_data: Arc::clone(&raster.data),
            width: raster.width,
            height: raster.height,
            resolution: self.config.mesh_resolution,
            world_position: WorldOffset {
                x: world_position.x,
                z: world_position.z,
            },
        };
        let meshing = self
            .tiles
            .with_tile_mut(tile_id, |tile| tile.begin_meshing(raster))
            .unwrap_or(false);
        if !meshing {
            let error = self.stage_error(tile_id, "mesh-generating");
            self.fail_tile(tile_id, error);
            return;
        }
        self.queue.start_mesh(tile_id);

        match self.mesh_pool.generate_mesh(request) {
            Ok(ticket) => {
                self.mesh_tickets.insert(tile_id, ticket);
            }
            Err(e) => self.fail_tile(tile_id, e.into()),
        }
    }

    fn handle_mesh(&mut self, tile_id: TileId, result: MeshResult) {
        if !self.queue.is_meshing(tile_id) {
            trace!(%tile_id, "Dropping mesh result for untracked tile");
            return;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.fail_tile(tile_id, e.into());
                return;
            }
        };
        let processing_time = response.processing_time;
        let mesh = match (response.success, response.mesh_data) {
            (true, Some(mesh)) => mesh,
            _ => {
                let message = response
                    .error
                    .unwrap_or_else(|| "worker returned no mesh".to_string());
                let error = MeshError::Failed {
                    tile: tile_id,
                    message,
                };
                self.fail_tile(tile_id, error.into());
                return;
            }
        };

        self.mesh_time_total += processing_time;
        self.meshes_built += 1;
        self.emit(StreamEvent::MeshGenerated {
            tile_id,
            vertex_count: mesh.vertex_count,
            index_count: mesh.index_count,
            processing_time,
        });

        let uploading = self
            .tiles
            .with_tile_mut(tile_id, |tile| tile.begin_upload(mesh))
            .unwrap_or(false);
        if !uploading {
            let error = self.stage_error(tile_id, "gpu-uploading");
            self.fail_tile(tile_id, error);
            return;
        }
        self.queue.start_upload(tile_id);
        self.upload_tile(tile_id);
    }

    fn upload_tile(&mut self, tile_id: TileId) {
        let allocator = &mut self.allocator;
        let uploaded = self.tiles.with_tile(tile_id, |tile| match tile.mesh() {
            Some(mesh) => upload_mesh(allocator, mesh),
            None => Err(StreamError::MeshGeneration(format!(
                "{tile_id} reached upload without a mesh"
            ))),
        });

        let buffers = match uploaded {
            Some(Ok(buffers)) => buffers,
            Some(Err(e)) => {
                self.fail_tile(tile_id, e);
                return;
            }
            None => {
                self.queue.remove(tile_id);
                return;
            }
        };

        let ready = self
            .tiles
            .with_tile_mut(tile_id, |tile| tile.mark_ready(buffers).then(|| tile.center()))
            .flatten();
        let Some(center) = ready else {
            // The tile never took ownership of these buffers.
            release(&mut self.allocator, buffers.vertex);
            release(&mut self.allocator, buffers.index);
            let error = self.stage_error(tile_id, "ready");
            self.fail_tile(tile_id, error);
            return;
        };
        self.queue.remove(tile_id);

        self.emit(StreamEvent::GpuResourcesCreated {
            tile_id,
            vertex_bytes: buffers.vertex_bytes,
            index_bytes: buffers.index_bytes,
        });
        self.emit(StreamEvent::TileLoaded { tile_id, center });
        debug!(%tile_id, "Tile loaded");

        self.check_memory_pressure();
    }

    fn check_memory_pressure(&mut self) {
        let Some(limit_mb) = self.config.memory_warning_mb else {
            return;
        };
        let used_mb = self.allocator.memory_usage().total_mb();
        if used_mb > limit_mb {
            let error = StreamError::Memory(format!(
                "{used_mb:.2} MiB of GPU buffers exceeds the {limit_mb:.2} MiB warning level"
            ));
            warn!("{error}");
            self.emit(StreamEvent::Error(TileErrorEvent::new(None, &error)));
        }
    }

    fn stage_error(&self, tile_id: TileId, to: &'static str) -> StreamError {
        let from = self
            .tiles
            .with_tile(tile_id, |tile| tile.stage.name())
            .unwrap_or("evicted");
        StreamError::StageTransition {
            tile: tile_id,
            from,
            to,
        }
    }

    /// Drop a failed tile and report it. Siblings are unaffected.
    fn fail_tile(&mut self, tile_id: TileId, error: StreamError) {
        if let Some(tile) = self.tiles.remove(tile_id) {
            self.release_buffers(&tile);
        }
        self.queue.remove(tile_id);
        if self.mesh_tickets.remove(&tile_id).is_some() {
            self.mesh_pool.cancel_task(tile_id);
        }

        warn!(%tile_id, kind = ?error.kind(), retryable = error.retryable(), "Tile load failed: {error}");
        self.report_error(Some(tile_id), error);
    }

    fn report_error(&mut self, tile_id: Option<TileId>, error: StreamError) -> StreamError {
        self.emit(StreamEvent::Error(TileErrorEvent::new(tile_id, &error)));
        error
    }

    fn release_buffers(&mut self, tile: &Tile) {
        if let Some(buffers) = tile.buffers() {
            release(&mut self.allocator, buffers.vertex);
            release(&mut self.allocator, buffers.index);
        }
    }

    /// Unload one tile from any stage.
    ///
    /// Buffers go back to the pool for reuse and an in-flight mesh task is
    /// cancelled. A fetch still in flight finishes and is then discarded,
    /// unless the tile is requested again first.
    pub fn evict_tile(&mut self, tile_id: TileId) -> bool {
        let Some(tile) = self.tiles.remove(tile_id) else {
            return false;
        };
        self.release_buffers(&tile);
        if self.mesh_tickets.remove(&tile_id).is_some() {
            let outcome = self.mesh_pool.cancel_task(tile_id);
            trace!(%tile_id, ?outcome, "Cancelled mesh task of evicted tile");
        }
        if self.queue.orphan_fetch(tile_id, tile.epoch) {
            trace!(%tile_id, epoch = tile.epoch, "Raster fetch outlives evicted tile");
        }
        self.queue.remove(tile_id);

        self.emit(StreamEvent::TileUnloaded { tile_id });
        debug!(%tile_id, stage = tile.stage.name(), "Tile unloaded");
        true
    }

    /// Evict every tile farther than twice the preload distance from the player.
    pub fn evict_distant_tiles(&mut self) -> Vec<TileId> {
        let Some(player) = self.player.current else {
            return Vec::new();
        };
        let limit = self.config.eviction_distance();
        let (per_degree, per_tile) = (self.config.meters_per_degree, self.config.meters_per_tile);

        let distant: Vec<TileId> = self
            .tiles
            .centers()
            .into_iter()
            .filter(|&(_, center)| player.tile_distance(center, per_degree, per_tile) > limit)
            .map(|(id, _)| id)
            .collect();

        for &id in &distant {
            self.evict_tile(id);
        }
        if !distant.is_empty() {
            info!(count = distant.len(), "Evicted distant tiles");
        }
        distant
    }

    fn finish_batch(
        &mut self,
        requested: usize,
        started: Vec<TileId>,
        evicted: Vec<TileId>,
        start: Instant,
    ) -> LoadReport {
        let loaded = started
            .iter()
            .filter(|&&id| self.tiles.with_tile(id, Tile::is_loaded).unwrap_or(false))
            .count();
        let report = LoadReport {
            requested,
            loaded,
            failed: started.len() - loaded,
            started,
            evicted,
            elapsed: start.elapsed(),
        };

        let sample = PerformanceSample {
            batch_size: report.started.len(),
            loaded: report.loaded,
            failed: report.failed,
            elapsed: report.elapsed,
            average_mesh_time: self.average_mesh_time(),
            tiles_resident: self.tiles.len(),
            memory_usage_mb: self.allocator.memory_usage().total_mb(),
        };
        info!(
            requested,
            loaded = report.loaded,
            failed = report.failed,
            evicted = report.evicted.len(),
            elapsed_ms = report.elapsed.as_millis(),
            "Load batch complete"
        );
        self.emit(StreamEvent::PerformanceUpdate(sample));
        report
    }

    fn average_mesh_time(&self) -> Duration {
        if self.meshes_built == 0 {
            Duration::ZERO
        } else {
            self.mesh_time_total / self.meshes_built
        }
    }

    /// Tiles that completed the full pipeline. Refreshes their access time.
    pub fn visible_tiles(&self) -> Vec<VisibleTile> {
        self.tiles
            .touch_ready(Instant::now(), |tile| {
                let buffers = tile.buffers()?;
                let mesh = tile.mesh()?;
                Some(VisibleTile {
                    id: tile.id,
                    center: tile.center(),
                    world_position: tile.world_position,
                    vertex_buffer: buffers.vertex,
                    index_buffer: buffers.index,
                    vertex_count: mesh.vertex_count,
                    index_count: mesh.index_count,
                })
            })
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let gpu = self.allocator.detailed_stats();
        MemoryStats {
            gpu_mb: gpu.usage.total_mb(),
            gpu,
            cpu_bytes: self.tiles.memory_usage(),
            tiles_resident: self.tiles.len(),
            tiles_ready: self.tiles.ready_count(),
        }
    }

    pub fn current_status(&self) -> StreamingStatus {
        let pool = self.mesh_pool.stats();
        StreamingStatus {
            tiles_loaded: self.tiles.ready_count(),
            memory_usage_mb: self.allocator.memory_usage().total_mb(),
            workers_active: pool.busy_workers,
            total_workers: pool.total_workers,
            queue_size: self.queue.backlog(),
            player_coords: self.player.current,
        }
    }

    /// Register a handler for one event kind. Handlers accumulate.
    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&StreamEvent) + Send + 'static,
    {
        self.events.on(kind, handler);
    }

    /// Receive every event on a channel.
    pub fn subscribe(&mut self) -> crossbeam::channel::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn emit(&mut self, event: StreamEvent) {
        self.events.emit(&event);
    }

    /// Hard-destroy pooled buffers idle for longer than `max_age`.
    ///
    /// The pool never shrinks on its own; hosts are expected to call this
    /// periodically.
    pub fn cleanup_unused_buffers(&mut self, max_age: Duration) -> usize {
        self.allocator.cleanup_unused_buffers(max_age)
    }

    /// Hard-destroy every pooled buffer that is not leased.
    pub fn emergency_cleanup(&mut self) -> usize {
        self.allocator.emergency_cleanup()
    }

    /// Evict every tile, stop the worker pools and free all GPU buffers.
    pub fn destroy(&mut self) {
        if self.lifecycle == Lifecycle::Destroyed {
            return;
        }
        let ids = self.tiles.ids();
        for id in &ids {
            self.evict_tile(*id);
        }
        self.mesh_tickets.clear();
        self.queue.clear();
        self.mesh_pool.terminate();
        self.fetch_pool = None;
        self.allocator.destroy_all();
        self.player = PlayerPosition::default();
        self.lifecycle = Lifecycle::Destroyed;
        info!(evicted = ids.len(), "Tile streamer destroyed");
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn tiles(&self) -> &TileTable {
        &self.tiles
    }

    pub fn loading_queue(&self) -> &LoadingQueue {
        &self.queue
    }

    pub fn allocator(&self) -> &BufferAllocator<D> {
        &self.allocator
    }

    pub fn mesh_pool(&self) -> &MeshWorkerPool {
        &self.mesh_pool
    }

    pub fn player_position(&self) -> Option<GeoCoord> {
        self.player.current
    }

    /// Position of the last committed restream.
    pub fn previous_position(&self) -> Option<GeoCoord> {
        self.player.previous
    }
}

/// Allocate and fill vertex and index buffers for a mesh.
///
/// On failure every buffer leased here goes back to the pool.
fn upload_mesh<D: GpuDevice>(
    allocator: &mut BufferAllocator<D>,
    mesh: &MeshData,
) -> Result<TileBuffers> {
    let vertex_bytes = mesh.vertex_bytes();
    let index_bytes = mesh.index_bytes();

    let vertex = allocator.allocate_vertex_buffer(vertex_bytes)?;
    let index = match allocator.allocate_index_buffer(index_bytes) {
        Ok(index) => index,
        Err(e) => {
            release(allocator, vertex);
            return Err(e.into());
        }
    };

    let written = allocator
        .update_vertex_data(vertex, &mesh.vertices, 0)
        .and_then(|()| allocator.update_index_data(index, &mesh.indices, 0));
    if let Err(e) = written {
        release(allocator, vertex);
        release(allocator, index);
        return Err(e.into());
    }

    Ok(TileBuffers {
        vertex,
        index,
        vertex_bytes,
        index_bytes,
    })
}

fn release<D: GpuDevice>(allocator: &mut BufferAllocator<D>, handle: BufferHandle) {
    if let Err(e) = allocator.deallocate_buffer(handle) {
        warn!(?handle, "Failed to release buffer: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam::channel::Receiver;
    use terrastream_gpu::HeadlessDevice;
    use terrastream_test::{init_tracing, SyntheticRasterFetcher, SyntheticTileProvider};

    use super::*;
    use crate::error::ErrorKind;

    struct Harness {
        streamer: TileStreamer<HeadlessDevice>,
        device: Arc<HeadlessDevice>,
        provider: Arc<SyntheticTileProvider>,
        fetcher: Arc<SyntheticRasterFetcher>,
    }

    impl Harness {
        fn new(config: StreamingConfig) -> Self {
            let mut harness = Self::uninitialized(config);
            harness.streamer.initialize().unwrap();
            harness
        }

        fn uninitialized(config: StreamingConfig) -> Self {
            init_tracing();
            let device = Arc::new(HeadlessDevice::new());
            let provider = Arc::new(SyntheticTileProvider::default());
            let fetcher = Arc::new(SyntheticRasterFetcher::new(16));
            let streamer = TileStreamer::new(
                Arc::clone(&device),
                provider.clone(),
                fetcher.clone(),
                config,
            );
            Self {
                streamer,
                device,
                provider,
                fetcher,
            }
        }

        fn center(&self, x: i32, y: i32) -> GeoCoord {
            self.provider.center_of(TileId::new(x, y))
        }

        fn load_grid_at(&mut self, x: i32, y: i32, radius: u32) -> LoadReport {
            let c = self.center(x, y);
            self.streamer.load_initial_grid(c.lat, c.lng, radius).unwrap()
        }

        fn move_to(&mut self, x: i32, y: i32) -> LoadReport {
            let c = self.center(x, y);
            match self.streamer.update_player_position(c.lat, c.lng).unwrap() {
                PositionUpdate::Streamed(report) => report,
                other => panic!("expected a restream, got {other:?}"),
            }
        }

        fn is_loaded(&self, id: TileId) -> bool {
            self.streamer
                .tiles()
                .with_tile(id, |t| t.is_loaded() && t.gpu_resources_created())
                .unwrap_or(false)
        }
    }

    fn config() -> StreamingConfig {
        StreamingConfig::default()
            .with_preload_distance(1)
            .with_mesh_workers(2)
            .with_fetch_threads(4)
            .with_mesh_resolution(16)
    }

    fn errors(rx: &Receiver<StreamEvent>) -> Vec<TileErrorEvent> {
        rx.try_iter()
            .filter_map(|event| match event {
                StreamEvent::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    fn count_kind(events: &[StreamEvent], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind() == kind).count()
    }

    fn sorted(mut ids: Vec<TileId>) -> Vec<TileId> {
        ids.sort();
        ids
    }

    #[test]
    fn initial_grid_loads_every_tile() {
        let mut h = Harness::new(config());
        let report = h.load_grid_at(0, 0, 1);

        assert_eq!(report.requested, 9);
        assert_eq!(report.started.len(), 9);
        assert_eq!(report.loaded, 9);
        assert_eq!(report.failed, 0);
        assert_eq!(h.provider.grid_calls(), 1);
        assert_eq!(h.fetcher.total_calls(), 9);

        for &id in &report.started {
            assert!(h.is_loaded(id), "{id} not fully loaded");
        }
        assert!(h.streamer.loading_queue().is_idle());
        assert_eq!(h.streamer.visible_tiles().len(), 9);

        let stats = h.streamer.allocator().detailed_stats();
        assert_eq!(stats.vertex.in_use_count, 9);
        assert_eq!(stats.index.in_use_count, 9);
    }

    #[test]
    fn initial_grid_around_new_york() {
        let mut h = Harness::new(config());
        let report = h.streamer.load_initial_grid(40.7128, -74.0060, 1).unwrap();

        assert_eq!(h.provider.grid_calls(), 1);
        assert_eq!(h.provider.requested().len(), 9);
        assert_eq!(report.loaded, 9);
        for &id in &report.started {
            assert!(h.is_loaded(id));
        }
    }

    #[test]
    fn uploaded_vertex_buffer_holds_mesh_bytes() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 0);

        let visible = h.streamer.visible_tiles();
        assert_eq!(visible.len(), 1);
        let tile = visible[0];
        assert_eq!(tile.vertex_count, 16 * 16);

        let mesh = h
            .streamer
            .tiles()
            .with_tile(tile.id, |t| t.mesh().cloned())
            .flatten()
            .unwrap();
        let expected: Vec<u8> = mesh.vertices.iter().flat_map(|v| v.to_ne_bytes()).collect();

        let raw = h.streamer.allocator().raw_buffer(tile.vertex_buffer).unwrap();
        let contents = h.device.read_buffer(raw).unwrap();
        assert_eq!(&contents[..expected.len()], expected.as_slice());
    }

    #[test]
    fn repeated_grid_requests_do_not_refetch() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);
        let again = h.load_grid_at(0, 0, 1);

        assert!(again.started.is_empty());
        assert_eq!(again.requested, 9);
        assert_eq!(h.fetcher.total_calls(), 9);
        assert_eq!(h.streamer.tiles().len(), 9);
    }

    #[test]
    fn overlapping_requests_fetch_each_tile_once() {
        let mut h = Harness::new(config());
        let c = h.center(0, 0);

        h.fetcher.hold();
        let first = h.streamer.request_initial_grid(c.lat, c.lng, 1).unwrap();
        let second = h.streamer.request_initial_grid(c.lat, c.lng, 2).unwrap();
        assert_eq!(first.len(), 9);
        assert_eq!(second.len(), 16);
        assert_eq!(h.streamer.current_status().queue_size, 25);

        h.fetcher.release();
        h.streamer.settle();

        assert_eq!(h.fetcher.total_calls(), 25);
        assert_eq!(h.fetcher.max_calls_per_tile(), 1);
        assert_eq!(h.streamer.tiles().ready_count(), 25);
    }

    #[test]
    fn request_initial_grid_returns_before_tiles_load() {
        let mut h = Harness::new(config());
        let c = h.center(0, 0);

        h.fetcher.hold();
        let started = h.streamer.request_initial_grid(c.lat, c.lng, 1).unwrap();
        assert_eq!(started.len(), 9);
        assert_eq!(h.streamer.pump(Duration::from_millis(10)), 0);
        assert_eq!(h.streamer.tiles().ready_count(), 0);
        assert!(h.streamer.visible_tiles().is_empty());

        h.fetcher.release();
        h.streamer.settle();
        assert_eq!(h.streamer.tiles().ready_count(), 9);
    }

    #[test]
    fn movement_below_threshold_makes_no_calls() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);
        let origin = h.center(0, 0);
        let calls = h.provider.network_calls();

        let update = h
            .streamer
            .update_player_position(origin.lat + 0.0005, origin.lng)
            .unwrap();

        assert!(matches!(update, PositionUpdate::BelowThreshold { .. }));
        assert_eq!(h.provider.network_calls(), calls);
        assert_eq!(h.fetcher.total_calls(), 9);
        assert_eq!(h.streamer.previous_position(), Some(origin));
        assert_eq!(
            h.streamer.player_position(),
            Some(GeoCoord::new(origin.lat + 0.0005, origin.lng))
        );
    }

    #[test]
    fn small_moves_accumulate_until_threshold() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);
        let origin = h.center(0, 0);

        let first = h
            .streamer
            .update_player_position(origin.lat + 0.0006, origin.lng)
            .unwrap();
        assert!(matches!(first, PositionUpdate::BelowThreshold { .. }));

        let second = h
            .streamer
            .update_player_position(origin.lat + 0.0012, origin.lng)
            .unwrap();
        let PositionUpdate::Streamed(report) = second else {
            panic!("expected a restream");
        };
        // Still inside the center tile, so nothing new enters the preload area.
        assert!(report.started.is_empty());
        assert_eq!(h.provider.stream_calls(), 1);
        assert_eq!(
            h.streamer.previous_position(),
            Some(GeoCoord::new(origin.lat + 0.0012, origin.lng))
        );
    }

    #[test]
    fn moving_loads_new_tiles_and_evicts_distant_ones() {
        let mut h = Harness::new(config());
        let initial = h.load_grid_at(0, 0, 1);
        let old_buffers: Vec<_> = h
            .streamer
            .visible_tiles()
            .into_iter()
            .map(|t| (t.vertex_buffer, t.index_buffer))
            .collect();
        let rx = h.streamer.subscribe();

        let report = h.move_to(4, 0);

        assert_eq!(report.started.len(), 9);
        assert_eq!(report.loaded, 9);
        assert_eq!(sorted(report.evicted.clone()), sorted(initial.started.clone()));
        assert_eq!(h.streamer.tiles().len(), 9);
        for &id in &report.started {
            assert!(h.is_loaded(id));
        }
        for &id in &initial.started {
            assert!(!h.streamer.tiles().contains(id));
        }

        let allocator = h.streamer.allocator();
        for (vertex, index) in old_buffers {
            assert!(allocator.is_available(vertex) && !allocator.is_in_use(vertex));
            assert!(allocator.is_available(index) && !allocator.is_in_use(index));
        }

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(count_kind(&events, EventKind::TileUnloaded), 9);
        assert_eq!(count_kind(&events, EventKind::TileLoaded), 9);
        assert_eq!(count_kind(&events, EventKind::PerformanceUpdate), 1);
    }

    #[test]
    fn eviction_uses_planar_distance_from_the_player() {
        let mut h = Harness::new(config());
        let initial = h.load_grid_at(0, 0, 2);
        assert_eq!(initial.loaded, 25);

        let report = h.move_to(1, 0);

        // Nothing enters the preload area; the grid already covers it.
        assert!(report.started.is_empty());

        let mut expected: Vec<TileId> = (-2..=2).map(|y| TileId::new(-2, y)).collect();
        expected.extend([(-1, -2), (-1, -1), (-1, 1), (-1, 2)].map(|(x, y)| TileId::new(x, y)));
        expected.extend([(0, -2), (0, 2), (2, -2), (2, 2)].map(|(x, y)| TileId::new(x, y)));
        assert_eq!(sorted(report.evicted.clone()), sorted(expected));

        // Exactly twice the preload distance stays.
        assert!(h.is_loaded(TileId::new(-1, 0)));
        assert!(h.is_loaded(TileId::new(1, -2)));
        assert!(h.is_loaded(TileId::new(1, 2)));
        // Within two tiles on both axes but farther than two tiles away.
        assert!(!h.streamer.tiles().contains(TileId::new(2, 2)));
        assert_eq!(h.streamer.tiles().len(), 12);
    }

    #[test]
    fn evicted_buffers_are_reused() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);
        h.move_to(4, 0);
        let created = h.device.created_count();

        let back = h.move_to(0, 0);

        assert_eq!(back.loaded, 9);
        assert_eq!(back.evicted.len(), 9);
        assert_eq!(h.device.created_count(), created);
        assert_eq!(h.streamer.allocator().detailed_stats().vertex.reuse_hits, 9);
    }

    #[test]
    fn cleanup_destroys_only_pooled_buffers() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);
        h.move_to(4, 0);
        assert_eq!(h.device.live_count(), 36);

        assert_eq!(h.streamer.cleanup_unused_buffers(Duration::from_secs(3600)), 0);
        assert_eq!(h.streamer.emergency_cleanup(), 18);
        assert_eq!(h.device.live_count(), 18);
        assert_eq!(h.streamer.tiles().ready_count(), 9);
    }

    #[test]
    fn first_update_without_grid_loads_preload_area() {
        let mut h = Harness::new(config());
        let report = h.move_to(2, 2);

        assert_eq!(report.started.len(), 9);
        assert_eq!(report.loaded, 9);
        assert_eq!(h.provider.grid_calls(), 1);
        assert_eq!(h.provider.stream_calls(), 0);
        assert_eq!(h.streamer.previous_position(), Some(h.center(2, 2)));
    }

    #[test]
    fn fetch_failure_is_a_retryable_network_error() {
        let mut h = Harness::new(config());
        h.fetcher.fail_tile(TileId::new(1, 1));
        let rx = h.streamer.subscribe();

        let report = h.load_grid_at(0, 0, 1);

        assert_eq!(report.loaded, 8);
        assert_eq!(report.failed, 1);
        assert!(!h.streamer.tiles().contains(TileId::new(1, 1)));
        assert!(h.streamer.loading_queue().is_idle());

        let errors = errors(&rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tile_id, Some(TileId::new(1, 1)));
        assert_eq!(errors[0].kind, ErrorKind::Network);
        assert!(errors[0].retryable);
    }

    #[test]
    fn failed_tile_can_be_requested_again() {
        let mut h = Harness::new(config());
        h.fetcher.fail_tile(TileId::new(0, 0));
        h.load_grid_at(0, 0, 0);
        assert!(!h.streamer.tiles().contains(TileId::new(0, 0)));

        let retry = h.load_grid_at(0, 0, 0);
        assert_eq!(retry.started, vec![TileId::new(0, 0)]);
        assert_eq!(h.fetcher.calls_for(TileId::new(0, 0)), 2);
    }

    #[test]
    fn corrupt_raster_is_invalid_data() {
        let mut h = Harness::new(config());
        h.fetcher.corrupt_tile(TileId::new(0, 0));
        let rx = h.streamer.subscribe();

        let report = h.load_grid_at(0, 0, 1);

        assert_eq!(report.loaded, 8);
        let errors = errors(&rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::InvalidData);
        assert!(!errors[0].retryable);
    }

    #[test]
    fn buffer_creation_failure_is_a_gpu_error() {
        let mut h = Harness::new(config());
        h.device.set_fail_creates(true);
        let rx = h.streamer.subscribe();

        let report = h.load_grid_at(0, 0, 1);

        assert_eq!(report.loaded, 0);
        assert_eq!(report.failed, 9);
        assert!(h.streamer.tiles().is_empty());
        let errors = errors(&rx);
        assert_eq!(errors.len(), 9);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Gpu && !e.retryable));
    }

    #[test]
    fn write_failure_returns_buffers_to_pool() {
        let mut h = Harness::new(config());
        h.device.set_fail_writes(true);

        let report = h.load_grid_at(0, 0, 0);

        assert_eq!(report.failed, 1);
        let stats = h.streamer.allocator().detailed_stats();
        assert_eq!(stats.vertex.in_use_count, 0);
        assert_eq!(stats.index.in_use_count, 0);
        assert_eq!(stats.vertex.available_count, 1);
        assert_eq!(stats.index.available_count, 1);
    }

    #[test]
    fn fallback_meshing_still_loads_tiles() {
        let mut h = Harness::new(config().with_mesh_workers(0));
        assert!(h.streamer.mesh_pool().is_fallback());

        let report = h.load_grid_at(0, 0, 1);

        assert_eq!(report.loaded, 9);
        assert_eq!(h.streamer.current_status().total_workers, 0);
    }

    #[test]
    fn reloading_mid_fetch_reuses_the_running_fetch() {
        let mut h = Harness::new(config());
        let c = h.center(0, 0);
        let id = TileId::new(0, 0);
        let rx = h.streamer.subscribe();

        h.fetcher.hold();
        h.streamer.request_initial_grid(c.lat, c.lng, 0).unwrap();
        while h.fetcher.running_for(id) == 0 {
            std::thread::yield_now();
        }
        assert!(h.streamer.evict_tile(id));
        assert!(h.streamer.loading_queue().is_idle());
        assert!(h.streamer.loading_queue().has_orphaned_fetch(id));

        // Reload while the first fetch is still blocked.
        let started = h.streamer.request_initial_grid(c.lat, c.lng, 0).unwrap();
        assert_eq!(started, vec![id]);
        assert!(h.streamer.loading_queue().is_fetching(id));
        assert!(!h.streamer.loading_queue().has_orphaned_fetch(id));

        h.fetcher.release();
        h.streamer.settle();

        assert!(h.is_loaded(id));
        assert_eq!(h.fetcher.calls_for(id), 1);
        assert_eq!(h.fetcher.peak_concurrent_for(id), 1);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(count_kind(&events, EventKind::TileUnloaded), 1);
        assert_eq!(count_kind(&events, EventKind::MeshGenerated), 1);
        assert_eq!(count_kind(&events, EventKind::TileLoaded), 1);
    }

    #[test]
    fn evicting_mid_fetch_discards_the_late_result() {
        let mut h = Harness::new(config());
        let c = h.center(0, 0);
        let id = TileId::new(0, 0);
        let rx = h.streamer.subscribe();

        h.fetcher.hold();
        h.streamer.request_initial_grid(c.lat, c.lng, 0).unwrap();
        assert!(h.streamer.evict_tile(id));
        h.fetcher.release();

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.streamer.loading_queue().orphaned_len() > 0 {
            assert!(Instant::now() < deadline, "orphaned fetch never drained");
            h.streamer.pump(Duration::from_millis(20));
        }

        assert!(!h.streamer.tiles().contains(id));
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(count_kind(&events, EventKind::MeshGenerated), 0);
        assert_eq!(count_kind(&events, EventKind::TileLoaded), 0);

        // Once drained, a reload fetches again.
        let report = h.load_grid_at(0, 0, 0);
        assert_eq!(report.loaded, 1);
        assert_eq!(h.fetcher.calls_for(id), 2);
        assert_eq!(h.fetcher.peak_concurrent_for(id), 1);
    }

    #[test]
    fn refused_ready_transition_returns_fresh_buffers() {
        let mut h = Harness::new(config());
        let id = TileId::new(0, 0);
        h.load_grid_at(0, 0, 0);
        let rx = h.streamer.subscribe();

        // A second upload of a tile that is already ready leases new buffers
        // the tile cannot take.
        h.streamer.upload_tile(id);

        assert!(!h.streamer.tiles().contains(id));
        let stats = h.streamer.allocator().detailed_stats();
        assert_eq!(stats.vertex.in_use_count, 0);
        assert_eq!(stats.index.in_use_count, 0);
        assert_eq!(stats.vertex.available_count, 2);
        assert_eq!(stats.index.available_count, 2);

        let errors = errors(&rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tile_id, Some(id));
        assert_eq!(errors[0].kind, ErrorKind::State);
    }

    #[test]
    fn handlers_accumulate_per_event() {
        let mut h = Harness::new(config());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let perf = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let f = Arc::clone(&first);
        h.streamer.on(EventKind::TileLoaded, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        h.streamer.on(EventKind::TileLoaded, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let p = Arc::clone(&perf);
        h.streamer.on(EventKind::PerformanceUpdate, move |event| {
            if let StreamEvent::PerformanceUpdate(sample) = event {
                p.lock().push(sample.clone());
            }
        });

        h.load_grid_at(0, 0, 1);

        assert_eq!(first.load(Ordering::SeqCst), 9);
        assert_eq!(second.load(Ordering::SeqCst), 9);
        let perf = perf.lock();
        assert_eq!(perf.len(), 1);
        assert_eq!(perf[0].batch_size, 9);
        assert_eq!(perf[0].loaded, 9);
        assert_eq!(perf[0].tiles_resident, 9);
    }

    #[test]
    fn tile_events_follow_pipeline_order() {
        let mut h = Harness::new(config());
        let rx = h.streamer.subscribe();
        h.load_grid_at(0, 0, 0);

        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::MeshGenerated,
                EventKind::GpuResourcesCreated,
                EventKind::TileLoaded,
                EventKind::PerformanceUpdate,
            ]
        );
    }

    #[test]
    fn memory_warning_is_reported_without_unloading() {
        let mut h = Harness::new(config().with_memory_warning_mb(0.0));
        let rx = h.streamer.subscribe();

        h.load_grid_at(0, 0, 0);

        let errors = errors(&rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Memory);
        assert_eq!(errors[0].tile_id, None);
        assert!(!errors[0].retryable);
        assert!(h.is_loaded(TileId::new(0, 0)));
    }

    #[test]
    fn visible_tiles_refresh_last_access() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 0);
        let id = TileId::new(0, 0);
        let before = h.streamer.tiles().with_tile(id, |t| t.last_access).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        h.streamer.visible_tiles();

        let after = h.streamer.tiles().with_tile(id, |t| t.last_access).unwrap();
        assert!(after > before);
    }

    #[test]
    fn status_and_memory_stats_reflect_loaded_tiles() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);

        let status = h.streamer.current_status();
        assert_eq!(status.tiles_loaded, 9);
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.total_workers, 2);
        assert_eq!(status.player_coords, Some(h.center(0, 0)));
        assert!(status.memory_usage_mb > 0.0);

        let memory = h.streamer.memory_stats();
        assert_eq!(memory.tiles_ready, 9);
        assert_eq!(memory.tiles_resident, 9);
        assert_eq!(memory.gpu.vertex.in_use_count, 9);
        assert!(memory.cpu_bytes > 0);
    }

    #[test]
    fn provider_failure_surfaces_network_error() {
        let mut h = Harness::new(config());
        h.provider.set_failing(true);
        let rx = h.streamer.subscribe();
        let c = h.center(0, 0);

        let result = h.streamer.load_initial_grid(c.lat, c.lng, 1);

        assert!(matches!(result, Err(StreamError::Network(_))));
        let errors = errors(&rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tile_id, None);
        assert!(errors[0].retryable);
    }

    #[test]
    fn loading_requires_initialize() {
        let mut h = Harness::uninitialized(config());
        let c = h.center(0, 0);

        let result = h.streamer.load_initial_grid(c.lat, c.lng, 1);

        assert!(matches!(result, Err(StreamError::NotInitialized)));
        assert_eq!(h.provider.grid_calls(), 0);
    }

    #[test]
    fn destroy_evicts_everything_and_stops_pools() {
        let mut h = Harness::new(config());
        h.load_grid_at(0, 0, 1);
        let rx = h.streamer.subscribe();

        h.streamer.destroy();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(count_kind(&events, EventKind::TileUnloaded), 9);
        assert!(h.streamer.tiles().is_empty());
        assert_eq!(h.device.live_count(), 0);
        assert_eq!(h.streamer.allocator().memory_usage().total_allocated_bytes, 0);
        assert!(!h.streamer.mesh_pool().is_ready());

        let c = h.center(0, 0);
        assert!(matches!(
            h.streamer.load_initial_grid(c.lat, c.lng, 1),
            Err(StreamError::Destroyed)
        ));
        assert!(h.streamer.initialize().is_err());
    }
}

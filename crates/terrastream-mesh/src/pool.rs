//! Fixed-size mesh worker pool.
//!
//! Layout:
//! - N worker threads, each owning one request channel (one task at a time).
//! - One coordinator thread that owns the queue, the pending table and the
//!   worker slots. It multiplexes handle commands and worker events.
//! - The [`MeshWorkerPool`] handle, which only sends commands.
//!
//! Requests are dispatched first-come to the first idle worker. Cancelling a
//! queued task removes it cleanly; cancelling a dispatched task rejects its
//! ticket immediately but the worker keeps going and its result is dropped.
//! A new task for that tile is held back until the abandoned one finishes, so
//! a tile never occupies two workers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use terrastream_core::TileId;
use tracing::{debug, info, trace, warn};

use crate::builder::{build_fallback_mesh, build_mesh, respond};
use crate::error::{MeshError, Result};
use crate::protocol::{
    MeshRequest, MeshResponse, TaskId, WorkerCommand, WorkerEvent, PROTOCOL_VERSION,
};

/// Outcome delivered through a [`MeshTicket`].
pub type MeshResult = Result<MeshResponse>;

/// Worker pool configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPoolConfig {
    /// Number of worker threads to spawn.
    pub worker_count: usize,
    /// How long a worker has to report ready before it is dropped.
    pub ready_timeout: Duration,
}

impl Default for MeshPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            ready_timeout: Duration::from_secs(3),
        }
    }
}

impl MeshPoolConfig {
    /// Set the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the worker ready timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Snapshot of pool activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub queue_length: usize,
    pub completed_tasks: u64,
    /// Lifetime completed count per worker slot.
    pub completed_per_worker: Vec<u64>,
    /// Highest number of simultaneously busy workers observed.
    pub peak_busy_workers: usize,
    /// Results dropped because their task had been cancelled.
    pub dropped_results: u64,
    /// Whether meshing runs on the synchronous fallback.
    pub fallback: bool,
}

/// Result of [`MeshWorkerPool::cancel_task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task was still queued and has been removed.
    Dequeued,
    /// Task was already running; its ticket was rejected and its result will be dropped.
    Abandoned,
    /// No pending task for this tile.
    NotFound,
}

/// Pending mesh result for one tile.
#[derive(Debug)]
pub struct MeshTicket {
    tile_id: TileId,
    rx: Receiver<MeshResult>,
}

impl MeshTicket {
    fn resolved(tile_id: TileId, result: MeshResult) -> Self {
        let (tx, rx) = channel::bounded(1);
        let _ = tx.send(result);
        Self { tile_id, rx }
    }

    /// Tile this ticket belongs to.
    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    /// Block until the result arrives.
    pub fn wait(self) -> MeshResult {
        self.rx.recv().unwrap_or(Err(MeshError::Terminated))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<MeshResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(MeshError::Terminated)),
        }
    }

    /// Take the result if it has arrived.
    pub fn try_result(&self) -> Option<MeshResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(channel::TryRecvError::Empty) => None,
            Err(channel::TryRecvError::Disconnected) => Some(Err(MeshError::Terminated)),
        }
    }

    /// Underlying receiver, for use with `crossbeam::channel::Select`.
    pub fn receiver(&self) -> &Receiver<MeshResult> {
        &self.rx
    }
}

enum PoolCommand {
    Generate {
        request: MeshRequest,
        reply: Sender<MeshResult>,
    },
    Cancel {
        tile_id: TileId,
        reply: Sender<CancelOutcome>,
    },
    Terminate,
}

enum PoolMode {
    Uninitialized,
    Workers {
        commands: Sender<PoolCommand>,
        coordinator: Option<JoinHandle<()>>,
    },
    Fallback,
    Terminated,
}

/// Handle to the mesh worker pool.
pub struct MeshWorkerPool {
    config: MeshPoolConfig,
    mode: PoolMode,
    stats: Arc<Mutex<WorkerPoolStats>>,
    /// Per-worker delay before announcing readiness.
    #[cfg(test)]
    startup_delays: HashMap<usize, Duration>,
}

impl MeshWorkerPool {
    /// Create an uninitialized pool.
    pub fn new(config: MeshPoolConfig) -> Self {
        Self {
            config,
            mode: PoolMode::Uninitialized,
            stats: Arc::new(Mutex::new(WorkerPoolStats::default())),
            #[cfg(test)]
            startup_delays: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_startup_delay(mut self, worker: usize, delay: Duration) -> Self {
        self.startup_delays.insert(worker, delay);
        self
    }

    /// Pool configuration.
    pub fn config(&self) -> &MeshPoolConfig {
        &self.config
    }

    /// Spawn workers and wait for them to report ready.
    ///
    /// Workers that miss the ready timeout are dropped. With zero ready
    /// workers the pool permanently switches to the in-process fallback.
    /// Calling this on an initialized pool does nothing.
    pub fn initialize(&mut self) {
        if !matches!(self.mode, PoolMode::Uninitialized) {
            return;
        }

        let (event_tx, event_rx) = channel::unbounded::<WorkerEvent>();
        let mut spawned = Vec::with_capacity(self.config.worker_count);

        for id in 0..self.config.worker_count {
            let (command_tx, command_rx) = channel::bounded::<WorkerCommand>(1);
            let events = event_tx.clone();
            #[cfg(test)]
            let startup = self.startup_delays.get(&id).copied();
            #[cfg(not(test))]
            let startup: Option<Duration> = None;
            let spawn = thread::Builder::new()
                .name(format!("mesh-worker-{id}"))
                .spawn(move || {
                    if let Some(delay) = startup {
                        thread::sleep(delay);
                    }
                    worker_loop(id, &command_rx, &events);
                });
            match spawn {
                Ok(handle) => spawned.push((id, command_tx, handle)),
                Err(e) => warn!("Failed to spawn mesh worker {id}: {e}"),
            }
        }

        let deadline = Instant::now() + self.config.ready_timeout;
        let mut ready = HashSet::new();
        while ready.len() < spawned.len() {
            match event_rx.recv_deadline(deadline) {
                Ok(WorkerEvent::Ready { worker, version }) if version == PROTOCOL_VERSION => {
                    ready.insert(worker);
                }
                Ok(WorkerEvent::Ready { worker, version }) => {
                    warn!(worker, version, "Mesh worker speaks an unsupported protocol version");
                }
                Ok(WorkerEvent::Finished { .. }) => {}
                Err(_) => break,
            }
        }

        let mut slots = Vec::with_capacity(ready.len());
        for (id, commands, handle) in spawned {
            if ready.contains(&id) {
                slots.push(WorkerSlot::new(id, commands, handle));
            } else {
                // Dropping the sender makes a late worker exit on its first receive.
                warn!(worker = id, "Mesh worker missed ready timeout, dropping it");
            }
        }

        if slots.is_empty() {
            warn!("No mesh workers available, using synchronous fallback meshing");
            self.enter_fallback();
            return;
        }

        let worker_count = slots.len();
        let (command_tx, command_rx) = channel::unbounded();
        let coordinator = Coordinator {
            slots,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            next_task: 0,
            dropped_results: 0,
            peak_busy: 0,
            stats: Arc::clone(&self.stats),
            commands: command_rx,
            events: event_rx,
            _events_keepalive: event_tx,
        };
        coordinator.publish_stats();

        match thread::Builder::new()
            .name("mesh-coordinator".to_string())
            .spawn(move || coordinator.run())
        {
            Ok(handle) => {
                info!(workers = worker_count, "Mesh worker pool initialized");
                self.mode = PoolMode::Workers {
                    commands: command_tx,
                    coordinator: Some(handle),
                };
            }
            Err(e) => {
                warn!("Failed to spawn mesh coordinator: {e}");
                self.enter_fallback();
            }
        }
    }

    fn enter_fallback(&mut self) {
        *self.stats.lock() = WorkerPoolStats {
            fallback: true,
            ..WorkerPoolStats::default()
        };
        self.mode = PoolMode::Fallback;
    }

    /// Whether the pool runs on the synchronous fallback.
    pub fn is_fallback(&self) -> bool {
        matches!(self.mode, PoolMode::Fallback)
    }

    /// Whether `initialize` has completed and `terminate` has not been called.
    pub fn is_ready(&self) -> bool {
        matches!(self.mode, PoolMode::Workers { .. } | PoolMode::Fallback)
    }

    /// Submit a mesh request.
    ///
    /// A second request for a tile that still has a pending task supersedes
    /// the first one.
    pub fn generate_mesh(&self, request: MeshRequest) -> Result<MeshTicket> {
        let tile_id = request.tile_id;
        match &self.mode {
            PoolMode::Uninitialized => Err(MeshError::NotInitialized),
            PoolMode::Terminated => Err(MeshError::Terminated),
            PoolMode::Fallback => {
                let response = respond(&request, build_fallback_mesh);
                let mut stats = self.stats.lock();
                stats.completed_tasks += 1;
                Ok(MeshTicket::resolved(tile_id, Ok(response)))
            }
            PoolMode::Workers { commands, .. } => {
                let (reply, rx) = channel::bounded(1);
                commands
                    .send(PoolCommand::Generate { request, reply })
                    .map_err(|_| MeshError::Terminated)?;
                Ok(MeshTicket { tile_id, rx })
            }
        }
    }

    /// Cancel the pending task for `tile_id`.
    pub fn cancel_task(&self, tile_id: TileId) -> CancelOutcome {
        let PoolMode::Workers { commands, .. } = &self.mode else {
            return CancelOutcome::NotFound;
        };
        let (reply, rx) = channel::bounded(1);
        if commands.send(PoolCommand::Cancel { tile_id, reply }).is_err() {
            return CancelOutcome::NotFound;
        }
        rx.recv().unwrap_or(CancelOutcome::NotFound)
    }

    /// Reject every pending task and stop all workers.
    pub fn terminate(&mut self) {
        let mode = std::mem::replace(&mut self.mode, PoolMode::Terminated);
        if let PoolMode::Workers {
            commands,
            mut coordinator,
        } = mode
        {
            let _ = commands.send(PoolCommand::Terminate);
            if let Some(handle) = coordinator.take() {
                if handle.join().is_err() {
                    warn!("Mesh coordinator panicked during shutdown");
                }
            }
            info!("Mesh worker pool terminated");
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        self.stats.lock().clone()
    }
}

impl Drop for MeshWorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Worker thread body: announce readiness, then mesh one request at a time.
fn worker_loop(id: usize, commands: &Receiver<WorkerCommand>, events: &Sender<WorkerEvent>) {
    if events
        .send(WorkerEvent::Ready {
            worker: id,
            version: PROTOCOL_VERSION,
        })
        .is_err()
    {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Process {
                version,
                task,
                request,
            } => {
                let response = if version == PROTOCOL_VERSION {
                    respond(&request, build_mesh)
                } else {
                    MeshResponse {
                        tile_id: request.tile_id,
                        success: false,
                        mesh_data: None,
                        error: Some(format!("unsupported protocol version {version}")),
                        processing_time: Duration::ZERO,
                    }
                };
                let finished = WorkerEvent::Finished {
                    worker: id,
                    version: PROTOCOL_VERSION,
                    task,
                    response,
                };
                if events.send(finished).is_err() {
                    return;
                }
            }
            WorkerCommand::Shutdown => return,
        }
    }
}

/// One worker execution unit as seen by the coordinator.
struct WorkerSlot {
    id: usize,
    current: Option<(TileId, TaskId)>,
    completed: u64,
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    fn new(id: usize, commands: Sender<WorkerCommand>, thread: JoinHandle<()>) -> Self {
        Self {
            id,
            current: None,
            completed: 0,
            commands,
            thread: Some(thread),
        }
    }

    fn is_busy(&self) -> bool {
        self.current.is_some()
    }
}

struct QueuedTask {
    task: TaskId,
    request: MeshRequest,
}

struct PendingTask {
    task: TaskId,
    reply: Sender<MeshResult>,
}

struct Coordinator {
    slots: Vec<WorkerSlot>,
    queue: VecDeque<QueuedTask>,
    pending: HashMap<TileId, PendingTask>,
    next_task: u64,
    dropped_results: u64,
    peak_busy: usize,
    stats: Arc<Mutex<WorkerPoolStats>>,
    commands: Receiver<PoolCommand>,
    events: Receiver<WorkerEvent>,
    /// Keeps the event channel connected even if every worker exits.
    _events_keepalive: Sender<WorkerEvent>,
}

impl Coordinator {
    fn run(mut self) {
        let commands = self.commands.clone();
        let events = self.events.clone();
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(PoolCommand::Generate { request, reply }) => self.enqueue(request, reply),
                    Ok(PoolCommand::Cancel { tile_id, reply }) => {
                        let outcome = self.cancel(tile_id);
                        let _ = reply.send(outcome);
                    }
                    Ok(PoolCommand::Terminate) | Err(_) => {
                        self.shutdown();
                        return;
                    }
                },
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.handle_event(event);
                    }
                },
            }
            self.dispatch();
            self.publish_stats();
        }
    }

    fn enqueue(&mut self, request: MeshRequest, reply: Sender<MeshResult>) {
        let tile_id = request.tile_id;
        if let Some(previous) = self.pending.remove(&tile_id) {
            debug!(%tile_id, "Superseding pending mesh task");
            self.queue.retain(|queued| queued.task != previous.task);
            let _ = previous.reply.send(Err(MeshError::Superseded(tile_id)));
        }

        self.next_task += 1;
        let task = TaskId(self.next_task);
        self.pending.insert(tile_id, PendingTask { task, reply });
        self.queue.push_back(QueuedTask { task, request });
        trace!(%tile_id, task = task.0, queued = self.queue.len(), "Queued mesh task");
    }

    fn cancel(&mut self, tile_id: TileId) -> CancelOutcome {
        let Some(pending) = self.pending.remove(&tile_id) else {
            return CancelOutcome::NotFound;
        };
        let _ = pending.reply.send(Err(MeshError::Cancelled(tile_id)));

        let before = self.queue.len();
        self.queue.retain(|queued| queued.task != pending.task);
        if self.queue.len() < before {
            debug!(%tile_id, "Cancelled queued mesh task");
            CancelOutcome::Dequeued
        } else {
            debug!(%tile_id, "Abandoned in-flight mesh task");
            CancelOutcome::Abandoned
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent::Finished {
            worker,
            task,
            response,
            ..
        } = event
        else {
            // Ready from a worker that missed the timeout; it is not in `slots`.
            return;
        };

        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == worker) {
            slot.current = None;
            slot.completed += 1;
        }

        let tile_id = response.tile_id;
        let is_current = self
            .pending
            .get(&tile_id)
            .is_some_and(|pending| pending.task == task);
        if is_current {
            if let Some(pending) = self.pending.remove(&tile_id) {
                let _ = pending.reply.send(Ok(response));
            }
        } else {
            self.dropped_results += 1;
            trace!(%tile_id, task = task.0, "Dropping result of abandoned mesh task");
        }
    }

    /// Hand queued tasks to idle workers, first available first.
    fn dispatch(&mut self) {
        loop {
            let Some(idle) = self.slots.iter().position(|slot| !slot.is_busy()) else {
                break;
            };
            // Skip tiles whose abandoned task still holds a worker.
            let running: HashSet<TileId> = self
                .slots
                .iter()
                .filter_map(|slot| slot.current.map(|(tile, _)| tile))
                .collect();
            let Some(next) = self
                .queue
                .iter()
                .position(|queued| !running.contains(&queued.request.tile_id))
            else {
                break;
            };
            let Some(QueuedTask { task, request }) = self.queue.remove(next) else {
                break;
            };
            let slot = &mut self.slots[idle];

            let tile_id = request.tile_id;
            let command = WorkerCommand::Process {
                version: PROTOCOL_VERSION,
                task,
                request,
            };
            if slot.commands.try_send(command).is_ok() {
                slot.current = Some((tile_id, task));
                trace!(%tile_id, worker = slot.id, "Dispatched mesh task");
            } else {
                let worker = slot.id;
                warn!(worker, "Mesh worker unreachable, retiring slot");
                self.slots.retain(|slot| slot.id != worker);
                if let Some(pending) = self.pending.remove(&tile_id) {
                    let _ = pending.reply.send(Err(MeshError::WorkerLost(worker)));
                }
            }
        }

        let busy = self.slots.iter().filter(|slot| slot.is_busy()).count();
        self.peak_busy = self.peak_busy.max(busy);
    }

    fn publish_stats(&self) {
        let mut stats = self.stats.lock();
        stats.total_workers = self.slots.len();
        stats.busy_workers = self.slots.iter().filter(|slot| slot.is_busy()).count();
        stats.queue_length = self.queue.len();
        stats.completed_per_worker = self.slots.iter().map(|slot| slot.completed).collect();
        stats.completed_tasks = stats.completed_per_worker.iter().sum();
        stats.peak_busy_workers = self.peak_busy;
        stats.dropped_results = self.dropped_results;
        stats.fallback = false;
    }

    fn shutdown(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(MeshError::Terminated));
        }
        self.queue.clear();

        for slot in &self.slots {
            let _ = slot.commands.send(WorkerCommand::Shutdown);
        }
        for slot in &mut self.slots {
            if let Some(handle) = slot.thread.take() {
                if handle.join().is_err() {
                    warn!(worker = slot.id, "Mesh worker panicked");
                }
            }
        }
        self.publish_stats();
    }
}

//! Bulk dispatch: rate-limited drips of synthesis work per viewer, and batched positional updates.

use std::time::Duration;

use crate::config::ConfigHandle;
use crate::events::{BlocksSendEvent, BlocksSendListener, Decision, Listeners};
use crate::host::{ChunkTransport, ViewerDirectory};
use crate::metrics::*;
use crate::overlay::OverlayCache;
use crate::pipeline::{ChunkSynthesizer, ChunkUnit};
use crate::pool::BufferPools;
use crate::prelude::*;
use crate::scheduler::{TaskControl, TaskHandle, TickScheduler};
use crate::stage::Stage;
use crate::workers::WorkerPool;

/// Why chunks are being resent.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DispatchKind {
    /// The stage's overrides are (re)sent.
    Overlay,
    /// A single viewer's overrides changed, the affected chunks are resent.
    Refresh,
    /// Columns are replaced with empty ones.
    Unload,
}

impl DispatchKind {
    fn unload(self) -> bool {
        self == Self::Unload
    }
}

/// Units a drip has not started yet. Once `finished` is set nothing is taken from or added to `units` anymore.
#[derive(Default)]
struct DripQueue {
    units: Vec<ChunkUnit>,
    finished: bool,
}

struct Drip {
    id: u64,
    handle: TaskHandle,
    queue: Arc<Mutex<DripQueue>>,
}

/// Schedules chunk work for viewers, at most one drip per viewer at a time.
pub struct Dispatcher {
    scheduler: Arc<dyn TickScheduler>,
    workers: Arc<WorkerPool>,
    synthesizer: Arc<ChunkSynthesizer>,
    overlay: Arc<OverlayCache>,
    directory: Arc<dyn ViewerDirectory>,
    transport: Arc<dyn ChunkTransport>,
    pools: Arc<BufferPools>,
    config: ConfigHandle,
    metrics: Arc<PerformanceMonitor>,
    drips: DashMap<ViewerId, Drip>,
    next_drip: AtomicU64,
    listeners: Listeners<dyn BlocksSendListener>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scheduler: Arc<dyn TickScheduler>,
        workers: Arc<WorkerPool>,
        synthesizer: Arc<ChunkSynthesizer>,
        overlay: Arc<OverlayCache>,
        directory: Arc<dyn ViewerDirectory>,
        transport: Arc<dyn ChunkTransport>,
        pools: Arc<BufferPools>,
        config: ConfigHandle,
        metrics: Arc<PerformanceMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            workers,
            synthesizer,
            overlay,
            directory,
            transport,
            pools,
            config,
            metrics,
            drips: DashMap::new(),
            next_drip: AtomicU64::new(1),
            listeners: Listeners::default(),
        })
    }

    /// Adds a listener observing (and possibly vetoing) every per-viewer dispatch.
    pub fn register_listener(&self, listener: Arc<dyn BlocksSendListener>) {
        self.listeners.register(listener);
    }

    /// Dispatches `chunks` of a stage to every online audience member in the stage's world. Returns the number of viewers dispatched to.
    pub fn send_block_changes(self: &Arc<Self>, stage: &Stage, chunks: &[ChunkPos], kind: DispatchKind) -> usize {
        if !stage.audience().is_visible() {
            trace!(stage = stage.name(), "Skipping dispatch of a hidden stage");
            return 0;
        }
        stage
            .online_audience()
            .into_iter()
            .filter(|&viewer| self.directory.world_of(viewer).as_ref() == Some(stage.world()))
            .filter(|&viewer| self.dispatch_to_viewer(stage, viewer, chunks, kind))
            .count()
    }

    /// Starts a drip of `chunks` to one viewer, replacing its running drip. Units the replaced drip had not started yet are kept.
    /// Returns `false` if a listener cancelled the dispatch.
    pub fn dispatch_to_viewer(self: &Arc<Self>, stage: &Stage, viewer: ViewerId, chunks: &[ChunkPos], kind: DispatchKind) -> bool {
        let start = std::time::Instant::now();
        let event = BlocksSendEvent {
            viewer,
            stage: KString::from_ref(stage.name()),
            world: stage.world().clone(),
            kind,
            chunks: chunks.to_vec(),
            blocks: if kind.unload() {
                HashMap::new()
            } else {
                self.overlay.get_chunks_for_viewer(viewer, chunks)
            },
        };
        if self.listeners.decide(|l| l.on_blocks_send(&event)) == Decision::Cancel {
            debug!(viewer = %viewer, stage = stage.name(), "Dispatch cancelled by a listener");
            return false;
        }

        let mut queue = self.pools.chunk_lists.acquire();
        queue.extend(chunks.iter().map(|&chunk| ChunkUnit {
            viewer,
            world: stage.world().clone(),
            chunk,
            unload: kind.unload(),
        }));
        let per_tick = stage.chunks_per_tick().max(1) as usize;
        self.start_drip(viewer, queue, per_tick);
        self.metrics.record(OP_DISPATCH, start.elapsed());
        trace!(viewer = %viewer, stage = stage.name(), chunks = chunks.len(), ?kind, "Drip scheduled");
        true
    }

    /// Schedules a drip of `units`, taking over whatever a running drip of the viewer had not started.
    fn start_drip(self: &Arc<Self>, viewer: ViewerId, mut units: Vec<ChunkUnit>, per_tick: usize) {
        if let Some((_, previous)) = self.drips.remove(&viewer) {
            self.absorb(previous, &mut units);
        }
        let queue = Arc::new(Mutex::new(DripQueue { units, finished: false }));
        let id = self.next_drip.fetch_add(1, AtomicOrdering::Relaxed);
        let weak = Arc::downgrade(self);
        let task_queue = Arc::clone(&queue);
        // The scheduler may run the first tick before this returns, so no drip entry is locked here
        let handle = self.scheduler.schedule_repeating(
            Box::new(move || {
                let Some(dispatcher) = weak.upgrade() else {
                    return TaskControl::Stop;
                };
                dispatcher.drip_tick(viewer, id, &task_queue, per_tick)
            }),
            Duration::ZERO,
            self.config.load().tick_period,
        );
        let own_queue = Arc::clone(&queue);
        // A concurrent dispatch to the same viewer may have inserted its drip in the meantime
        if let Some(replaced) = self.drips.insert(viewer, Drip { id, handle, queue }) {
            let mut leftovers = self.pools.chunk_lists.acquire();
            self.absorb(replaced, &mut leftovers);
            let mut own = own_queue.lock();
            if own.finished {
                drop(own);
                self.finish(viewer, id, &own_queue);
                if leftovers.is_empty() {
                    self.pools.chunk_lists.release(leftovers);
                } else {
                    // Ours already drained, the leftovers need a drip of their own
                    self.start_drip(viewer, leftovers, per_tick);
                }
                return;
            }
            let covered: HashSet<(WorldId, ChunkPos)> = own.units.iter().map(|u| (u.world.clone(), u.chunk)).collect();
            own.units
                .extend(leftovers.drain(..).filter(|u| !covered.contains(&(u.world.clone(), u.chunk))));
            drop(own);
            self.pools.chunk_lists.release(leftovers);
        }
        if own_queue.lock().finished {
            self.drips.remove_if(&viewer, |_, d| d.id == id);
        }
    }

    /// Cancels a replaced drip and moves the units it had not started into `queue`, unless `queue` already covers them.
    fn absorb(&self, replaced: Drip, queue: &mut Vec<ChunkUnit>) {
        replaced.handle.cancel();
        self.metrics.increment(COUNTER_DRIPS_REPLACED);
        let leftovers = {
            let mut replaced_queue = replaced.queue.lock();
            replaced_queue.finished = true;
            std::mem::take(&mut replaced_queue.units)
        };
        let covered: HashSet<(WorldId, ChunkPos)> = queue.iter().map(|u| (u.world.clone(), u.chunk)).collect();
        queue.extend(
            leftovers
                .into_iter()
                .filter(|u| !covered.contains(&(u.world.clone(), u.chunk))),
        );
    }

    fn drip_tick(&self, viewer: ViewerId, id: u64, queue: &Mutex<DripQueue>, per_tick: usize) -> TaskControl {
        let batch: Vec<ChunkUnit> = {
            let mut queue = queue.lock();
            if queue.finished {
                return TaskControl::Stop;
            }
            let count = per_tick.min(queue.units.len());
            let batch = queue.units.drain(..count).collect();
            // Marked under the same lock that absorbing takes, so leftovers never land in a drained queue
            queue.finished = queue.units.is_empty();
            batch
        };
        for unit in batch {
            let synthesizer = Arc::clone(&self.synthesizer);
            if !self.workers.submit(move || synthesizer.run_unit(unit)) {
                debug!(viewer = %viewer, "Worker pool is closed, stopping drip");
                queue.lock().finished = true;
                self.finish(viewer, id, queue);
                return TaskControl::Stop;
            }
        }
        if queue.lock().finished {
            self.finish(viewer, id, queue);
            TaskControl::Stop
        } else {
            TaskControl::Continue
        }
    }

    fn finish(&self, viewer: ViewerId, id: u64, queue: &Mutex<DripQueue>) {
        self.drips.remove_if(&viewer, |_, d| d.id == id);
        let list = std::mem::take(&mut queue.lock().units);
        self.pools.chunk_lists.release(list);
    }

    /// Sends the cached override of each position to every online member in the stage's world, as one batched update each.
    /// Positions without an override for a viewer are left out of its batch. Returns the number of viewers sent to.
    pub fn send_multi_block_change(&self, stage: &Stage, positions: &[BlockPos]) -> usize {
        if !stage.audience().is_visible() || positions.is_empty() {
            return 0;
        }
        let _span = tracing::trace_span!("multi_block_change", stage = stage.name(), positions = positions.len()).entered();
        self.metrics.time(OP_MULTI_BLOCK_CHANGE, || {
            let mut sent = 0;
            for viewer in stage.online_audience() {
                if self.directory.world_of(viewer).as_ref() != Some(stage.world()) {
                    continue;
                }
                let Some(session) = self.transport.session(viewer) else {
                    continue;
                };
                let mut changes = self.pools.position_maps.acquire();
                changes.extend(
                    positions
                        .iter()
                        .filter_map(|&pos| Some((pos, self.overlay.get_block(viewer, pos)?))),
                );
                if !changes.is_empty() {
                    match session.send_positional_block_change(&changes) {
                        Ok(()) => sent += 1,
                        Err(e) => warn!(viewer = %viewer, "Positional block change failed: {e}"),
                    }
                }
                self.pools.position_maps.release(changes);
            }
            sent
        })
    }

    /// Stops the viewer's drip. Units already handed to workers still complete.
    pub fn cancel_drip(&self, viewer: ViewerId) -> bool {
        match self.drips.remove(&viewer) {
            Some((_, drip)) => {
                drip.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every drip.
    pub fn cancel_all(&self) -> usize {
        let viewers: Vec<ViewerId> = self.drips.iter().map(|d| *d.key()).collect();
        viewers.into_iter().filter(|&viewer| self.cancel_drip(viewer)).count()
    }

    /// Checks if the viewer has a drip that still has units to start.
    pub fn has_active_drip(&self, viewer: ViewerId) -> bool {
        self.drips.get(&viewer).is_some_and(|d| !d.handle.is_cancelled())
    }

    /// Chunks still waiting in the viewer's drip, in sending order.
    pub fn queued_chunks(&self, viewer: ViewerId) -> Vec<ChunkPos> {
        let Some(queue) = self.drips.get(&viewer).map(|d| Arc::clone(&d.queue)) else {
            return Vec::new();
        };
        let chunks = queue.lock().units.iter().map(|u| u.chunk).collect();
        chunks
    }

    /// Number of viewers with a drip.
    pub fn drip_count(&self) -> usize {
        self.drips.len()
    }
}

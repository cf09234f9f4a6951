//! The overlay engine: wires the components together and owns the stage registry.

use mg_schemas::coordinates::BlockRegion;
use thiserror::Error;

use crate::audience::DEFAULT_MINING_SPEED;
use crate::concurrency::Snapshot;
use crate::config::{ConfigError, ConfigHandle, EngineConfig};
use crate::dispatch::Dispatcher;
use crate::events::{BlocksSendListener, LightingListener};
use crate::host::{ChunkTransport, TerrainSource, ViewerDirectory};
use crate::lighting::BlockLightingManager;
use crate::metrics::{PerformanceMonitor, PerformanceReport};
use crate::overlay::sweep::OverlaySweeper;
use crate::overlay::OverlayCache;
use crate::pipeline::ChunkSynthesizer;
use crate::pool::BufferPools;
use crate::prelude::*;
use crate::scheduler::{TickScheduler, TokioTickScheduler};
use crate::stage::Stage;
use crate::workers::WorkerPool;

/// Shared state every stage and view reaches through its stage.
pub(crate) struct EngineContext {
    pub(crate) config: ConfigHandle,
    pub(crate) directory: Arc<dyn ViewerDirectory>,
    pub(crate) overlay: Arc<OverlayCache>,
    pub(crate) lighting: Arc<BlockLightingManager>,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

/// Errors when building an [`OverlayEngine`].
#[derive(Debug, Error)]
pub enum EngineBuildError {
    /// A required host collaborator was not provided.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    /// The configuration failed validation.
    #[error("Invalid configuration")]
    InvalidConfig(#[from] ConfigError),
    /// The worker runtime could not be started.
    #[error("Could not start the chunk workers: {0}")]
    Runtime(String),
}

/// Collects the host collaborators and configuration of an [`OverlayEngine`].
#[derive(Default)]
pub struct OverlayEngineBuilder {
    config: EngineConfig,
    terrain: Option<Arc<dyn TerrainSource>>,
    transport: Option<Arc<dyn ChunkTransport>>,
    directory: Option<Arc<dyn ViewerDirectory>>,
    scheduler: Option<Arc<dyn TickScheduler>>,
}

impl OverlayEngineBuilder {
    /// A builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the source of authoritative terrain.
    pub fn terrain_source(mut self, terrain: Arc<dyn TerrainSource>) -> Self {
        self.terrain = Some(terrain);
        self
    }

    /// Sets the packet transport.
    pub fn transport(mut self, transport: Arc<dyn ChunkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the connected viewer directory.
    pub fn viewer_directory(mut self, directory: Arc<dyn ViewerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Sets the drip scheduler. Defaults to a [`TokioTickScheduler`] on the worker runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn TickScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validates the configuration and starts the worker pool. Background tasks only run after [`OverlayEngine::start`].
    pub fn build(self) -> Result<OverlayEngine, EngineBuildError> {
        let terrain = self.terrain.ok_or(EngineBuildError::MissingCollaborator("terrain source"))?;
        let transport = self.transport.ok_or(EngineBuildError::MissingCollaborator("transport"))?;
        let directory = self.directory.ok_or(EngineBuildError::MissingCollaborator("viewer directory"))?;
        let config = self.config.into_handle()?;
        let settings = config.load();

        let workers = WorkerPool::new(settings.worker_threads, settings.max_blocking_threads)
            .map_err(|e| EngineBuildError::Runtime(format!("{e:#}")))?;
        let workers = Arc::new(workers);
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioTickScheduler::new(workers.handle().clone())) as Arc<dyn TickScheduler>);
        let metrics = Arc::new(PerformanceMonitor::new());
        let overlay = Arc::new(OverlayCache::new(settings.recent_chunk_capacity, Arc::clone(&metrics)));
        let lighting = Arc::new(BlockLightingManager::new());
        let pools = Arc::new(BufferPools::new(settings.pool_capacity));
        let synthesizer = Arc::new(ChunkSynthesizer {
            terrain,
            transport: Arc::clone(&transport),
            directory: Arc::clone(&directory),
            overlay: Arc::clone(&overlay),
            lighting: Arc::clone(&lighting),
            pools: Arc::clone(&pools),
            config: config.clone(),
            metrics: Arc::clone(&metrics),
        });
        let dispatcher = Dispatcher::new(
            scheduler,
            Arc::clone(&workers),
            Arc::clone(&synthesizer),
            Arc::clone(&overlay),
            Arc::clone(&directory),
            transport,
            Arc::clone(&pools),
            config.clone(),
            Arc::clone(&metrics),
        );
        let sweeper = OverlaySweeper::new(Arc::clone(&overlay), config.clone(), Arc::clone(&metrics));
        drop(settings);

        Ok(OverlayEngine {
            ctx: Arc::new(EngineContext {
                config,
                directory,
                overlay,
                lighting,
                dispatcher,
            }),
            workers,
            synthesizer,
            pools,
            metrics,
            sweeper,
            stages: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// What an intercepted dig or place action at a position would hit.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OverrideHit {
    /// The block the viewer sees
    pub block: BlockState,
    /// The view painting it, with its stage
    pub view: ViewKey,
    /// The view allows breaking
    pub breakable: bool,
    /// The view allows placing
    pub placeable: bool,
}

/// The virtual block overlay engine.
pub struct OverlayEngine {
    ctx: Arc<EngineContext>,
    workers: Arc<WorkerPool>,
    synthesizer: Arc<ChunkSynthesizer>,
    pools: Arc<BufferPools>,
    metrics: Arc<PerformanceMonitor>,
    sweeper: OverlaySweeper,
    stages: RwLock<HashMap<KString, Arc<Stage>>>,
    shut_down: AtomicBool,
}

impl OverlayEngine {
    /// Shorthand for [`OverlayEngineBuilder::new`].
    pub fn builder() -> OverlayEngineBuilder {
        OverlayEngineBuilder::new()
    }

    /// Starts the background cache sweep. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let started = self.sweeper.start(self.workers.handle());
        if started {
            info!("Overlay engine started");
        }
        started
    }

    /// Stops the background cache sweep.
    pub fn stop(&self) -> bool {
        self.sweeper.stop()
    }

    /// The current configuration.
    pub fn config(&self) -> Snapshot<EngineConfig> {
        self.ctx.config.load()
    }

    /// Validates and publishes a new configuration, returns its revision.
    pub fn update_config(&self, config: EngineConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        self.ctx.config.try_update(move |current| {
            *current = config;
            Ok(())
        })
    }

    /// Creates a stage spanning the box between two corners. Returns `None` if the name is taken.
    pub fn create_stage(&self, name: &str, world: &WorldId, corner_a: BlockPos, corner_b: BlockPos) -> Option<Arc<Stage>> {
        let mut stages = self.stages.write();
        let key = KString::from_ref(name);
        if stages.contains_key(&key) {
            warn!(stage = name, "A stage with this name already exists");
            return None;
        }
        let region = BlockRegion::from_corners(corner_a, corner_b);
        let stage = Arc::new(Stage::new(name, world.clone(), region, Arc::clone(&self.ctx)));
        stages.insert(key, Arc::clone(&stage));
        debug!(stage = name, %world, %region, "Stage created");
        Some(stage)
    }

    /// Looks up a stage.
    pub fn stage(&self, name: &str) -> Option<Arc<Stage>> {
        self.stages.read().get(name).cloned()
    }

    /// Every stage, sorted by name.
    pub fn stages(&self) -> Vec<Arc<Stage>> {
        let mut stages: Vec<Arc<Stage>> = self.stages.read().values().cloned().collect();
        stages.sort_by(|a, b| a.name().cmp(b.name()));
        stages
    }

    /// Deletes a stage, purging its views from every viewer's cache and dropping its custom lighting.
    pub fn delete_stage(&self, name: &str) -> bool {
        let Some(stage) = self.stages.write().remove(name) else {
            return false;
        };
        stage.teardown();
        true
    }

    /// Allocates a viewer's cache and merges every stage it is an audience member of.
    pub fn viewer_connected(&self, viewer: ViewerId) -> bool {
        if !self.ctx.overlay.initialize_player(viewer) {
            return false;
        }
        for stage in self.stages() {
            if stage.audience().contains(viewer) {
                for view in stage.views() {
                    view.merge_into(viewer, &stage);
                }
            }
        }
        debug!(viewer = %viewer, "Viewer initialized");
        true
    }

    /// Cancels the viewer's drip and drops its cache. Units already queued for it fail closed.
    pub fn viewer_disconnected(&self, viewer: ViewerId) -> bool {
        self.ctx.dispatcher.cancel_drip(viewer);
        let removed = self.ctx.overlay.remove_player(viewer);
        if removed {
            debug!(viewer = %viewer, "Viewer removed");
        }
        removed
    }

    /// The override a viewer sees at a position and the view it comes from.
    pub fn override_at(&self, viewer: ViewerId, pos: BlockPos) -> Option<OverrideHit> {
        let (key, block) = self.ctx.overlay.top_layer_at(viewer, pos)?;
        let view = self.stage(key.stage())?.get_view(key.view())?;
        Some(OverrideHit {
            block,
            view: key,
            breakable: view.is_breakable(),
            placeable: view.is_placeable(),
        })
    }

    /// The mining speed multiplier applying to a viewer digging at a position.
    pub fn mining_speed(&self, viewer: ViewerId, pos: BlockPos) -> f64 {
        self.ctx
            .overlay
            .top_layer_at(viewer, pos)
            .and_then(|(key, _)| self.stage(key.stage()))
            .map_or(DEFAULT_MINING_SPEED, |stage| stage.audience().mining_speed(viewer))
    }

    /// The custom lighting store.
    pub fn lighting(&self) -> &Arc<BlockLightingManager> {
        &self.ctx.lighting
    }

    /// The per-viewer overlay cache.
    pub fn overlay(&self) -> &Arc<OverlayCache> {
        &self.ctx.overlay
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    /// The chunk synthesizer.
    pub fn synthesizer(&self) -> &Arc<ChunkSynthesizer> {
        &self.synthesizer
    }

    /// The performance monitor.
    pub fn metrics(&self) -> &Arc<PerformanceMonitor> {
        &self.metrics
    }

    /// Registers a listener that may veto lighting changes.
    pub fn on_lighting_change(&self, listener: Arc<dyn LightingListener>) {
        self.ctx.lighting.register_listener(listener);
    }

    /// Registers a listener observing dispatches.
    pub fn on_blocks_send(&self, listener: Arc<dyn BlocksSendListener>) {
        self.ctx.dispatcher.register_listener(listener);
    }

    /// Timings, counters and pool statistics so far.
    pub fn performance_report(&self) -> PerformanceReport {
        let mut report = self.metrics.report();
        report.pools = vec![
            ("chunk_lists", self.pools.chunk_lists.stats()),
            ("light_arrays", self.pools.light_arrays.stats()),
            ("position_maps", self.pools.position_maps.stats()),
        ];
        report
    }

    /// Forgets all timings and counters.
    pub fn reset_performance(&self) {
        self.metrics.reset();
    }

    /// Blocks until the workers are idle, bounded by the shutdown timeout.
    pub fn wait_idle(&self) -> bool {
        self.workers.wait_idle(self.config().shutdown_timeout)
    }

    /// Cancels every drip, drains the workers within the shutdown timeout, clears all per-viewer and pooled state,
    /// and returns the final performance summary. Calling it again only returns a fresh report.
    /// Must not be called from within an async context.
    pub fn shutdown(&self) -> PerformanceReport {
        if self.shut_down.swap(true, AtomicOrdering::AcqRel) {
            return self.performance_report();
        }
        self.sweeper.stop();
        let cancelled = self.ctx.dispatcher.cancel_all();
        let drained = self.workers.shutdown(self.config().shutdown_timeout);
        self.ctx.overlay.clear();
        self.pools.clear();
        let report = self.performance_report();
        info!(cancelled, drained, "Overlay engine shut down\n{report}");
        report
    }
}

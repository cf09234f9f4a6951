//! An in-memory host for unit tests.

use std::time::Duration;

use mg_schemas::column::{ColumnLight, ColumnSection, SectionBlocks, TerrainColumn, WorldHeight};
use mg_schemas::light::{LightLevel, NibbleArray};

use crate::config::EngineConfig;
use crate::engine::OverlayEngine;
use crate::host::*;
use crate::prelude::*;
use crate::scheduler::{ManualScheduler, TickScheduler};

pub const STONE: BlockState = BlockState::new(1);
pub const COAL: BlockState = BlockState::new(16);
pub const IRON: BlockState = BlockState::new(15);
pub const DIAMOND: BlockState = BlockState::new(56);

pub fn world() -> WorldId {
    WorldId::new("overworld")
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SentKind {
    Unload(ChunkPos),
    Column(ChunkPos),
    Positional(usize),
}

#[derive(Default)]
pub struct RecordingSession {
    sent: Mutex<Vec<SentKind>>,
}

impl RecordingSession {
    pub fn kinds(&self) -> Vec<SentKind> {
        self.sent.lock().clone()
    }

    pub fn columns(&self) -> Vec<ChunkPos> {
        self.kinds()
            .into_iter()
            .filter_map(|k| match k {
                SentKind::Column(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn unloads(&self) -> Vec<ChunkPos> {
        self.kinds()
            .into_iter()
            .filter_map(|k| match k {
                SentKind::Unload(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

impl ViewerSession for RecordingSession {
    fn send_unload_chunk(&self, chunk: ChunkPos) -> Result<(), TransportError> {
        self.sent.lock().push(SentKind::Unload(chunk));
        Ok(())
    }

    fn send_chunk_column(&self, column: &TerrainColumn, _light: &ColumnLight) -> Result<(), TransportError> {
        self.sent.lock().push(SentKind::Column(column.pos()));
        Ok(())
    }

    fn send_positional_block_change(&self, changes: &HashMap<BlockPos, BlockState>) -> Result<(), TransportError> {
        self.sent.lock().push(SentKind::Positional(changes.len()));
        Ok(())
    }
}

/// Stone from y=0 to y=63 in every column of a single world.
#[derive(Default)]
pub struct TestHost {
    online: DashMap<ViewerId, WorldId>,
    sessions: DashMap<ViewerId, Arc<RecordingSession>>,
    failing: DashMap<ChunkPos, bool>,
    captured_light: AtomicBool,
    short_columns: AtomicBool,
    on_connected_check: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_viewer(&self, world: &WorldId) -> ViewerId {
        let viewer = ViewerId::new_random();
        self.online.insert(viewer, world.clone());
        self.sessions.insert(viewer, Arc::default());
        viewer
    }

    pub fn disconnect_viewer(&self, viewer: ViewerId) {
        self.online.remove(&viewer);
    }

    pub fn fail_chunk(&self, chunk: ChunkPos) {
        self.failing.insert(chunk, false);
    }

    pub fn panic_on_chunk(&self, chunk: ChunkPos) {
        self.failing.insert(chunk, true);
    }

    pub fn set_captured_light(&self, captured: bool) {
        self.captured_light.store(captured, AtomicOrdering::SeqCst);
    }

    /// Columns come back one section shorter than the world's height.
    pub fn set_short_columns(&self, short: bool) {
        self.short_columns.store(short, AtomicOrdering::SeqCst);
    }

    /// Runs `hook` during the next connection check, before answering it.
    pub fn before_next_connected_check(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_connected_check.lock() = Some(Box::new(hook));
    }

    /// Everything sent to a viewer, kept after it disconnects.
    pub fn recorded(&self, viewer: ViewerId) -> Arc<RecordingSession> {
        Arc::clone(&self.sessions.get(&viewer).expect("viewer was never connected"))
    }
}

impl TerrainSource for TestHost {
    fn world_height(&self, world: &WorldId) -> Option<WorldHeight> {
        (*world == crate::test_support::world()).then(|| WorldHeight::try_new(0, 64).unwrap())
    }

    fn terrain_column(&self, world: &WorldId, chunk: ChunkPos) -> Result<TerrainColumn, TerrainError> {
        let height = self
            .world_height(world)
            .ok_or_else(|| TerrainError::WorldUnavailable(world.clone()))?;
        match self.failing.get(&chunk).map(|entry| *entry) {
            Some(true) => panic!("terrain of {chunk} exploded"),
            Some(false) => {
                return Err(TerrainError::ColumnUnavailable {
                    chunk,
                    reason: "region file is corrupt".to_owned(),
                })
            }
            None => {}
        }
        let captured = self.captured_light.load(AtomicOrdering::SeqCst);
        let (height, count) = if self.short_columns.load(AtomicOrdering::SeqCst) {
            let short = WorldHeight::try_new(height.min_y(), height.height() - 16).unwrap();
            (short, short.section_count())
        } else {
            (height, height.section_count())
        };
        let sections = (0..count)
            .map(|_| {
                let mut sky = NibbleArray::new();
                sky.fill(LightLevel::FULL);
                ColumnSection {
                    blocks: SectionBlocks::Singleton(STONE),
                    block_light: captured.then(NibbleArray::new),
                    sky_light: captured.then_some(sky),
                }
            })
            .collect();
        Ok(TerrainColumn::new(chunk, height, sections).unwrap())
    }
}

impl ViewerDirectory for TestHost {
    fn is_connected(&self, viewer: ViewerId) -> bool {
        let hook = self.on_connected_check.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.online.contains_key(&viewer)
    }

    fn world_of(&self, viewer: ViewerId) -> Option<WorldId> {
        self.online.get(&viewer).map(|w| w.clone())
    }
}

impl ChunkTransport for TestHost {
    fn session(&self, viewer: ViewerId) -> Option<Arc<dyn ViewerSession>> {
        if !self.is_connected(viewer) {
            return None;
        }
        let session = self.sessions.get(&viewer)?;
        Some(Arc::clone(&*session) as Arc<dyn ViewerSession>)
    }
}

pub fn test_engine() -> (OverlayEngine, Arc<TestHost>, Arc<ManualScheduler>) {
    test_engine_with(EngineConfig::default())
}

/// An engine driven by a manual scheduler, with a small worker pool.
pub fn test_engine_with(config: EngineConfig) -> (OverlayEngine, Arc<TestHost>, Arc<ManualScheduler>) {
    let scheduler = Arc::new(ManualScheduler::new(config.tick_period));
    let (engine, host) = test_engine_on(config, scheduler.clone());
    (engine, host, scheduler)
}

/// An engine driven by the given scheduler, with a small worker pool.
pub fn test_engine_on(config: EngineConfig, scheduler: Arc<dyn TickScheduler>) -> (OverlayEngine, Arc<TestHost>) {
    let host = TestHost::new();
    let engine = OverlayEngine::builder()
        .config(EngineConfig {
            worker_threads: 1,
            shutdown_timeout: Duration::from_secs(10),
            ..config
        })
        .terrain_source(host.clone())
        .transport(host.clone())
        .viewer_directory(host.clone())
        .scheduler(scheduler)
        .build()
        .unwrap();
    (engine, host)
}

//! Views: named, z-ordered layers of block overrides inside a stage.
//!
//! Every mutation is pushed into the overlay cache of each online audience member while the affected chunk of the view is still locked,
//! so the per-viewer caches always agree with the view's own map.

use mg_schemas::pattern::Pattern;

use crate::overlay::{ChunkOverlay, ViewLayer};
use crate::prelude::*;
use crate::stage::Stage;

#[derive(Copy, Clone, Debug)]
enum Write {
    /// Place a sampled block unless one is present
    Fill,
    /// Place a sampled block, replacing any present one
    Resample,
    /// Place the given block
    Set(BlockState),
    /// Remove the override
    Remove,
}

/// A named layer of position to block overrides within a [`Stage`].
pub struct View {
    key: ViewKey,
    name: KString,
    stage: Weak<Stage>,
    z_index: AtomicI32,
    breakable: AtomicBool,
    placeable: AtomicBool,
    pattern: RwLock<Arc<Pattern>>,
    blocks: DashMap<ChunkPos, ChunkOverlay>,
    /// Held shared by mutations and exclusively while a viewer merges the whole view
    propagation: RwLock<()>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("key", &self.key)
            .field("z_index", &self.z_index())
            .field("blocks", &self.block_count())
            .finish_non_exhaustive()
    }
}

impl View {
    /// Creates a view of `stage`. It becomes visible once added with [`Stage::add_view`].
    pub fn new(stage: &Arc<Stage>, name: &str, pattern: Pattern, breakable: bool) -> Arc<Self> {
        Arc::new(Self {
            key: ViewKey::new(stage.name(), name),
            name: KString::from_ref(name),
            stage: Arc::downgrade(stage),
            z_index: AtomicI32::new(0),
            breakable: AtomicBool::new(breakable),
            placeable: AtomicBool::new(false),
            pattern: RwLock::new(Arc::new(pattern)),
            blocks: DashMap::new(),
            propagation: RwLock::new(()),
        })
    }

    /// The name as given at creation.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The globally unique key.
    pub fn key(&self) -> &ViewKey {
        &self.key
    }

    /// The owning stage, `None` once it was dropped.
    pub fn stage(&self) -> Option<Arc<Stage>> {
        self.stage.upgrade()
    }

    /// The view's identity and paint order for the overlay cache.
    pub fn layer(&self) -> ViewLayer {
        ViewLayer {
            key: self.key.clone(),
            z_index: self.z_index(),
        }
    }

    /// Higher paints over lower.
    pub fn z_index(&self) -> i32 {
        self.z_index.load(AtomicOrdering::Acquire)
    }

    /// Changes the paint order and recomposites the caches of online audience members.
    pub fn set_z_index(&self, z_index: i32) {
        let _guard = self.propagation.read();
        if self.z_index.swap(z_index, AtomicOrdering::AcqRel) == z_index {
            return;
        }
        if let Some((stage, viewers)) = self.propagation_targets() {
            let layer = self.layer();
            for &viewer in &viewers {
                stage.context().overlay.set_layer_z_index(viewer, &layer);
            }
            self.retract_stale(&stage, &viewers);
        }
    }

    /// Whether intercepted dig actions on this view's blocks are allowed.
    pub fn is_breakable(&self) -> bool {
        self.breakable.load(AtomicOrdering::Acquire)
    }

    /// Sets the breakable flag.
    pub fn set_breakable(&self, breakable: bool) {
        self.breakable.store(breakable, AtomicOrdering::Release);
    }

    /// Whether intercepted place actions inside this view are allowed.
    pub fn is_placeable(&self) -> bool {
        self.placeable.load(AtomicOrdering::Acquire)
    }

    /// Sets the placeable flag.
    pub fn set_placeable(&self, placeable: bool) {
        self.placeable.store(placeable, AtomicOrdering::Release);
    }

    /// The pattern used for future fills.
    pub fn pattern(&self) -> Arc<Pattern> {
        Arc::clone(&self.pattern.read())
    }

    /// Replaces the pattern. Existing overrides are kept.
    pub fn change_pattern(&self, pattern: Pattern) {
        *self.pattern.write() = Arc::new(pattern);
    }

    /// Checks if this view is the one registered under its name in `stage`.
    fn is_registered(&self, stage: &Stage) -> bool {
        stage.get_view(self.name()).is_some_and(|v| std::ptr::eq(Arc::as_ptr(&v), self))
    }

    /// Online audience members of the owning stage, if this view is the one registered under its name.
    fn propagation_targets(&self) -> Option<(Arc<Stage>, Vec<ViewerId>)> {
        let stage = self.stage.upgrade()?;
        if !self.is_registered(&stage) {
            return None;
        }
        let viewers = stage.online_audience();
        Some((stage, viewers))
    }

    /// Detaches this view again from viewers it was just propagated to, if it was unregistered or they left the audience meanwhile.
    /// Removal unregisters before purging the caches, so either the purge comes after the propagation or this sees the removal.
    fn retract_stale(&self, stage: &Stage, viewers: &[ViewerId]) {
        let registered = self.is_registered(stage);
        for &viewer in viewers {
            if (!registered || !stage.audience().contains(viewer))
                && stage.context().overlay.remove_view_from_player(viewer, &self.key)
            {
                debug!(view = %self.key, viewer = %viewer, "Retracted a propagation that raced a removal");
            }
        }
    }

    fn write(&self, changes: impl IntoIterator<Item = (BlockPos, Write)>) -> usize {
        let Some(stage) = self.stage.upgrade() else {
            return 0;
        };
        let region = *stage.region();
        let mut by_chunk: HashMap<ChunkPos, Vec<(BlockPos, Write)>> = HashMap::new();
        for (pos, write) in changes {
            if region.contains(pos) {
                by_chunk.entry(pos.chunk()).or_default().push((pos, write));
            } else {
                trace!(view = %self.key, %pos, "Ignoring block outside of the stage");
            }
        }
        drop(stage);

        let _guard = self.propagation.read();
        let targets = self.propagation_targets();
        let layer = self.layer();
        let pattern = self.pattern();
        let mut rng = rand::thread_rng();
        let mut changed = 0;
        let mut effective: Vec<(BlockPos, Option<BlockState>)> = Vec::new();
        for (chunk, writes) in by_chunk {
            effective.clear();
            let mut blocks = self.blocks.entry(chunk).or_default();
            for (pos, write) in writes {
                let block = match write {
                    Write::Fill if blocks.contains_key(&pos) => continue,
                    Write::Fill | Write::Resample => Some(pattern.sample(&mut rng)),
                    Write::Set(block) => Some(block),
                    Write::Remove => None,
                };
                let old = match block {
                    Some(block) => blocks.insert(pos, block),
                    None => blocks.remove(&pos),
                };
                if old != block {
                    effective.push((pos, block));
                }
            }
            changed += effective.len();
            if let Some((stage, viewers)) = &targets {
                if !effective.is_empty() {
                    for &viewer in viewers {
                        stage.context().overlay.apply_block_changes(viewer, &layer, &effective);
                    }
                }
            }
            let now_empty = blocks.is_empty();
            drop(blocks);
            if now_empty {
                self.blocks.remove_if(&chunk, |_, b| b.is_empty());
            }
        }
        if let Some((stage, viewers)) = &targets {
            self.retract_stale(stage, viewers);
        }
        changed
    }

    /// Fills a position with a sample of the pattern unless it already has an override. Positions outside the stage are ignored.
    pub fn add_block(&self, pos: BlockPos) -> bool {
        self.write([(pos, Write::Fill)]) > 0
    }

    /// [`Self::add_block`] for many positions, returns the number of filled ones.
    pub fn add_blocks(&self, positions: impl IntoIterator<Item = BlockPos>) -> usize {
        self.write(positions.into_iter().map(|p| (p, Write::Fill)))
    }

    /// Overrides a position with an explicit block.
    pub fn set_block(&self, pos: BlockPos, block: BlockState) -> bool {
        self.write([(pos, Write::Set(block))]) > 0
    }

    /// [`Self::set_block`] for many positions, returns the number of changed ones.
    pub fn set_blocks(&self, blocks: impl IntoIterator<Item = (BlockPos, BlockState)>) -> usize {
        self.write(blocks.into_iter().map(|(p, b)| (p, Write::Set(b))))
    }

    /// Replaces the override with a fresh sample of the pattern.
    pub fn reset_block(&self, pos: BlockPos) -> bool {
        self.write([(pos, Write::Resample)]) > 0
    }

    /// [`Self::reset_block`] for many positions.
    pub fn reset_blocks(&self, positions: impl IntoIterator<Item = BlockPos>) -> usize {
        self.write(positions.into_iter().map(|p| (p, Write::Resample)))
    }

    /// Drops the override of a position.
    pub fn remove_block(&self, pos: BlockPos) -> bool {
        self.write([(pos, Write::Remove)]) > 0
    }

    /// [`Self::remove_block`] for many positions.
    pub fn remove_blocks(&self, positions: impl IntoIterator<Item = BlockPos>) -> usize {
        self.write(positions.into_iter().map(|p| (p, Write::Remove)))
    }

    /// Drops every override.
    pub fn remove_all_blocks(&self) -> usize {
        let positions: Vec<BlockPos> = self.blocks.iter().flat_map(|e| e.keys().copied().collect::<Vec<_>>()).collect();
        self.remove_blocks(positions)
    }

    /// Checks if a position is overridden.
    pub fn has_block(&self, pos: BlockPos) -> bool {
        self.blocks.get(&pos.chunk()).is_some_and(|b| b.contains_key(&pos))
    }

    /// The override at a position.
    pub fn get_block(&self, pos: BlockPos) -> Option<BlockState> {
        self.blocks.get(&pos.chunk())?.get(&pos).copied()
    }

    /// Number of overridden positions.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().map(|e| e.len()).sum()
    }

    /// Chunks containing at least one override, sorted.
    pub fn chunks(&self) -> Vec<ChunkPos> {
        let mut chunks: Vec<ChunkPos> = self.blocks.iter().map(|e| *e.key()).collect();
        chunks.sort();
        chunks
    }

    /// A copy of the overrides in one chunk.
    pub fn blocks_in_chunk(&self, chunk: ChunkPos) -> ChunkOverlay {
        self.blocks.get(&chunk).map(|b| b.clone()).unwrap_or_default()
    }

    /// A copy of every override, grouped by chunk.
    pub fn snapshot(&self) -> HashMap<ChunkPos, ChunkOverlay> {
        self.blocks.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    /// The topmost solid override in the column at (x, z) within the stage's Y range.
    pub fn highest_block(&self, x: i32, z: i32) -> Option<(BlockPos, BlockState)> {
        let stage = self.stage.upgrade()?;
        let found = stage
            .region()
            .iter_column_down(x, z)
            .find_map(|pos| self.get_block(pos).filter(|b| !b.is_air()).map(|b| (pos, b)));
        found
    }

    /// The bottommost solid override in the column at (x, z) within the stage's Y range.
    pub fn lowest_block(&self, x: i32, z: i32) -> Option<(BlockPos, BlockState)> {
        let stage = self.stage.upgrade()?;
        let region = *stage.region();
        (region.min().y..=region.max().y)
            .map(|y| BlockPos::new(x, y, z))
            .filter(|&pos| region.contains(pos))
            .find_map(|pos| self.get_block(pos).filter(|b| !b.is_air()).map(|b| (pos, b)))
    }

    /// Merges this whole view into one viewer's cache, excluding concurrent mutations while the copy is taken.
    pub(crate) fn merge_into(&self, viewer: ViewerId, stage: &Stage) -> bool {
        let _guard = self.propagation.write();
        if !stage.context().overlay.add_view_to_player(viewer, self) {
            return false;
        }
        if !self.is_registered(stage) {
            stage.context().overlay.remove_view_from_player(viewer, &self.key);
            debug!(view = %self.key, viewer = %viewer, "View was removed while merging");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn fill_set_reset_and_remove() {
        let (engine, _host, _scheduler) = test_engine();
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        let view = View::new(&stage, "Ore", Pattern::single(STONE), false);
        assert!(stage.add_view(Arc::clone(&view)));

        let pos = BlockPos::new(3, 3, 3);
        assert!(view.add_block(pos));
        assert!(!view.add_block(pos));
        assert!(!view.add_block(BlockPos::new(32, 0, 0)));
        assert_eq!(view.get_block(pos), Some(STONE));

        view.change_pattern(Pattern::single(COAL));
        assert_eq!(view.get_block(pos), Some(STONE));
        assert!(view.reset_block(pos));
        assert_eq!(view.get_block(pos), Some(COAL));
        assert!(!view.set_block(pos, COAL));
        assert!(view.set_block(pos, IRON));

        assert_eq!(view.add_blocks((0..16).map(|y| BlockPos::new(20, y, 20))), 16);
        assert_eq!(view.chunks(), vec![ChunkPos::new(0, 0), ChunkPos::new(1, 1)]);
        assert_eq!(view.block_count(), 17);
        assert!(view.remove_block(pos));
        assert!(!view.remove_block(pos));
        assert_eq!(view.remove_all_blocks(), 16);
        assert!(view.chunks().is_empty());
        assert!(!view.has_block(BlockPos::new(20, 0, 20)));
    }

    #[test]
    fn highest_and_lowest_skip_air() {
        let (engine, _host, _scheduler) = test_engine();
        let stage = engine.create_stage("tower", &world(), BlockPos::new(0, 0, 0), BlockPos::new(15, 40, 15)).unwrap();
        let view = View::new(&stage, "walls", Pattern::single(STONE), true);
        stage.add_view(Arc::clone(&view));
        view.set_block(BlockPos::new(1, 5, 1), COAL);
        view.set_block(BlockPos::new(1, 30, 1), IRON);
        view.set_block(BlockPos::new(1, 35, 1), BlockState::AIR);
        assert_eq!(view.highest_block(1, 1), Some((BlockPos::new(1, 30, 1), IRON)));
        assert_eq!(view.lowest_block(1, 1), Some((BlockPos::new(1, 5, 1), COAL)));
        assert_eq!(view.highest_block(2, 2), None);
    }

    #[test]
    fn mutations_reach_online_audience_only() {
        let (engine, host, _scheduler) = test_engine();
        let online = host.connect_viewer(&world());
        let offline = ViewerId::new_random();
        engine.viewer_connected(online);
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        stage.add_viewer(online);
        stage.add_viewer(offline);
        let view = View::new(&stage, "ore", Pattern::single(STONE), false);
        let pos = BlockPos::new(8, 8, 8);

        // Not registered with the stage yet, nothing propagates
        view.set_block(pos, COAL);
        assert_eq!(engine.overlay().get_block(online, pos), None);

        stage.add_view(Arc::clone(&view));
        assert_eq!(engine.overlay().get_block(online, pos), Some(COAL));
        view.set_block(pos, IRON);
        assert_eq!(engine.overlay().get_block(online, pos), Some(IRON));
        assert!(!engine.overlay().is_initialized(offline));

        view.set_z_index(4);
        assert_eq!(engine.overlay().top_layer_at(online, pos).map(|(k, _)| k), Some(view.key().clone()));
        view.remove_block(pos);
        assert_eq!(engine.overlay().get_block(online, pos), None);
    }

    #[test]
    fn removal_during_a_write_leaves_no_stale_layer() {
        let (engine, host, _scheduler) = test_engine();
        let viewer = host.connect_viewer(&world());
        engine.viewer_connected(viewer);
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        stage.add_viewer(viewer);
        let view = View::new(&stage, "ore", Pattern::single(STONE), false);
        stage.add_view(Arc::clone(&view));
        let pos = BlockPos::new(4, 4, 4);

        // Removed after the write picked its targets, before it reaches the caches
        let removing = Arc::clone(&stage);
        host.before_next_connected_check(move || {
            assert!(removing.remove_view("ore").is_some());
        });
        assert!(view.set_block(pos, COAL));
        assert!(stage.get_view("ore").is_none());
        assert_eq!(engine.overlay().get_block(viewer, pos), None);
        assert!(engine.overlay().attached_views(viewer).is_empty());
        assert_eq!(engine.overlay().validate_all(), 0);
    }

    #[test]
    fn leaving_the_audience_during_a_write_detaches_the_view() {
        let (engine, host, _scheduler) = test_engine();
        let viewer = host.connect_viewer(&world());
        engine.viewer_connected(viewer);
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        stage.add_viewer(viewer);
        let view = View::new(&stage, "ore", Pattern::single(STONE), false);
        stage.add_view(Arc::clone(&view));
        let pos = BlockPos::new(4, 4, 4);

        let leaving = Arc::clone(&stage);
        host.before_next_connected_check(move || {
            assert!(leaving.remove_viewer(viewer));
        });
        assert!(view.set_block(pos, IRON));
        assert_eq!(view.get_block(pos), Some(IRON));
        assert_eq!(engine.overlay().get_block(viewer, pos), None);
        assert!(engine.overlay().attached_views(viewer).is_empty());
    }
}

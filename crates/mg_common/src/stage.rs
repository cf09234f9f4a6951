//! Stages: bounded regions holding views and the audience that sees them.

use mg_schemas::coordinates::BlockRegion;

use crate::audience::Audience;
use crate::dispatch::DispatchKind;
use crate::engine::EngineContext;
use crate::identity::fold_name;
use crate::lighting::LightScope;
use crate::prelude::*;
use crate::view::View;

/// A bounded region of a world with its views and audience.
pub struct Stage {
    name: KString,
    world: WorldId,
    region: BlockRegion,
    views: RwLock<HashMap<KString, Arc<View>>>,
    audience: Audience,
    chunks_per_tick: AtomicU32,
    ctx: Arc<EngineContext>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("world", &self.world)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Stage {
    pub(crate) fn new(name: &str, world: WorldId, region: BlockRegion, ctx: Arc<EngineContext>) -> Self {
        let chunks_per_tick = ctx.config.load().chunks_per_tick;
        Self {
            name: KString::from_ref(name),
            world,
            region,
            views: RwLock::new(HashMap::new()),
            audience: Audience::new(),
            chunks_per_tick: AtomicU32::new(chunks_per_tick),
            ctx,
        }
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// The unique stage name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The world the stage is in.
    pub fn world(&self) -> &WorldId {
        &self.world
    }

    /// The inclusive bounding box.
    pub fn region(&self) -> &BlockRegion {
        &self.region
    }

    /// The viewers entitled to see this stage.
    pub fn audience(&self) -> &Audience {
        &self.audience
    }

    /// Registers a view. Views belonging to another stage and duplicate names (ignoring case) are rejected.
    /// The view is merged into the caches of every online audience member.
    pub fn add_view(&self, view: Arc<View>) -> bool {
        if view.key().stage() != self.name() {
            warn!(stage = %self.name, view = %view.key(), "View belongs to another stage");
            return false;
        }
        {
            let mut views = self.views.write();
            let folded = fold_name(view.name());
            if views.contains_key(&folded) {
                warn!(stage = %self.name, view = view.name(), "A view with this name already exists");
                return false;
            }
            views.insert(folded, Arc::clone(&view));
        }
        for viewer in self.online_audience() {
            view.merge_into(viewer, self);
        }
        true
    }

    /// Unregisters a view, purging it from every viewer's cache and dropping its custom lighting.
    pub fn remove_view(&self, name: &str) -> Option<Arc<View>> {
        let Some(view) = self.views.write().remove(&fold_name(name)) else {
            debug!(stage = %self.name, view = name, "No view to remove");
            return None;
        };
        // Unregistered before purging, so writes already past their registration check retract themselves
        self.ctx.overlay.clear_view_cache(view.key());
        self.ctx.lighting.purge_scope(&LightScope::View(view.key().clone()));
        Some(view)
    }

    /// Looks up a view by name, ignoring case.
    pub fn get_view(&self, name: &str) -> Option<Arc<View>> {
        self.views.read().get(&fold_name(name)).cloned()
    }

    /// Every view, in paint order (lowest z-index first).
    pub fn views(&self) -> Vec<Arc<View>> {
        let mut views: Vec<Arc<View>> = self.views.read().values().cloned().collect();
        views.sort_by(|a, b| a.z_index().cmp(&b.z_index()).then_with(|| a.key().cmp(b.key())));
        views
    }

    /// Every chunk column intersecting the bounding box.
    pub fn chunks(&self) -> Vec<ChunkPos> {
        self.region.chunks().collect()
    }

    /// Checks the world and the inclusive bounding box.
    pub fn is_location_within(&self, world: &WorldId, pos: BlockPos) -> bool {
        *world == self.world && self.region.contains(pos)
    }

    /// Chunks started per viewer on every dispatch tick.
    pub fn chunks_per_tick(&self) -> u32 {
        self.chunks_per_tick.load(AtomicOrdering::Acquire)
    }

    /// Changes the dispatch throughput, zero is rejected.
    pub fn set_chunks_per_tick(&self, chunks_per_tick: u32) -> bool {
        if chunks_per_tick == 0 {
            warn!(stage = %self.name, "Rejected zero chunks per tick");
            return false;
        }
        self.chunks_per_tick.store(chunks_per_tick, AtomicOrdering::Release);
        true
    }

    /// Members with a live connection and an initialized overlay cache.
    pub fn online_audience(&self) -> Vec<ViewerId> {
        let mut online = self.audience.online_members(self.ctx.directory.as_ref());
        online.retain(|&viewer| self.ctx.overlay.is_initialized(viewer));
        online
    }

    /// Resynthesizes every chunk of the stage for every online member in this stage's world. Returns the number of viewers dispatched to.
    pub fn send_blocks_to_audience(&self) -> usize {
        self.ctx.dispatcher.send_block_changes(self, &self.chunks(), DispatchKind::Overlay)
    }

    /// Sends the cached blocks of a few positions as one positional update per online member.
    pub fn refresh_blocks_to_audience(&self, positions: &[BlockPos]) -> usize {
        self.ctx.dispatcher.send_multi_block_change(self, positions)
    }

    /// Merges one of this stage's views into one viewer's cache, then resends the view's chunks to that viewer.
    pub fn add_view_for_player(&self, viewer: ViewerId, view: &Arc<View>) -> bool {
        if !self.owns(view) || !view.merge_into(viewer, self) {
            return false;
        }
        self.ctx
            .dispatcher
            .dispatch_to_viewer(self, viewer, &view.chunks(), DispatchKind::Refresh);
        true
    }

    /// Removes one view from one viewer's cache, then resends the affected chunks to that viewer.
    pub fn remove_view_for_player(&self, viewer: ViewerId, view: &Arc<View>) -> bool {
        if !self.owns(view) {
            return false;
        }
        let chunks = self.ctx.overlay.view_positions(viewer, view.key());
        if !self.ctx.overlay.remove_view_from_player(viewer, view.key()) {
            return false;
        }
        let mut chunks: Vec<ChunkPos> = chunks.into_iter().map(BlockPos::chunk).collect();
        chunks.sort();
        chunks.dedup();
        self.ctx
            .dispatcher
            .dispatch_to_viewer(self, viewer, &chunks, DispatchKind::Refresh);
        true
    }

    fn owns(&self, view: &Arc<View>) -> bool {
        self.get_view(view.name()).is_some_and(|v| Arc::ptr_eq(&v, view))
    }

    /// Adds an audience member. If it is online, every view of the stage is merged into its cache.
    pub fn add_viewer(&self, viewer: ViewerId) -> bool {
        if !self.audience.add(viewer) {
            return false;
        }
        if self.ctx.directory.is_connected(viewer) && self.ctx.overlay.is_initialized(viewer) {
            for view in self.views() {
                view.merge_into(viewer, self);
            }
        }
        true
    }

    /// Removes an audience member, unmerging the stage's views and resending the stage's chunks without them.
    pub fn remove_viewer(&self, viewer: ViewerId) -> bool {
        if !self.audience.remove(viewer) {
            return false;
        }
        let mut detached = false;
        for view in self.views() {
            detached |= self.ctx.overlay.remove_view_from_player(viewer, view.key());
        }
        if detached && self.ctx.directory.is_connected(viewer) {
            self.ctx
                .dispatcher
                .dispatch_to_viewer(self, viewer, &self.chunks(), DispatchKind::Refresh);
        }
        true
    }

    /// Shows or hides the stage. Hidden stages receive no dispatches; becoming visible resends everything.
    pub fn set_visible(&self, visible: bool) -> bool {
        let changed = self.audience.set_visible(visible);
        if changed && visible {
            self.send_blocks_to_audience();
        }
        changed
    }

    /// Purges everything the engine holds for this stage. Called when it is deleted.
    pub(crate) fn teardown(&self) {
        let views: Vec<Arc<View>> = self.views.write().drain().map(|(_, v)| v).collect();
        let detached = self.ctx.overlay.clear_stage_cache(self.name());
        for view in &views {
            self.ctx.lighting.purge_scope(&LightScope::View(view.key().clone()));
        }
        self.ctx.lighting.purge_scope(&LightScope::Stage(self.name.clone()));
        debug!(stage = %self.name, views = views.len(), detached, "Stage torn down");
    }
}

#[cfg(test)]
mod test {
    use mg_schemas::pattern::Pattern;

    use super::*;
    use crate::test_support::*;

    #[test]
    fn views_are_unique_ignoring_case() {
        let (engine, _host, _scheduler) = test_engine();
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        assert!(stage.add_view(View::new(&stage, "Ore", Pattern::single(STONE), false)));
        assert!(!stage.add_view(View::new(&stage, "ORE", Pattern::single(COAL), false)));
        assert!(stage.get_view("ore").is_some());

        let other = engine.create_stage("arena", &world(), BlockPos::new(0, 0, 0), BlockPos::new(1, 1, 1)).unwrap();
        assert!(!stage.add_view(View::new(&other, "walls", Pattern::single(STONE), false)));

        assert!(stage.remove_view("oRe").is_some());
        assert!(stage.remove_view("ore").is_none());
        assert!(stage.views().is_empty());
    }

    #[test]
    fn geometry() {
        let (engine, _host, _scheduler) = test_engine();
        let stage = engine.create_stage("mine", &world(), BlockPos::new(31, 15, 31), BlockPos::new(0, 0, 0)).unwrap();
        assert_eq!(
            stage.chunks(),
            vec![ChunkPos::new(0, 0), ChunkPos::new(0, 1), ChunkPos::new(1, 0), ChunkPos::new(1, 1)]
        );
        assert!(stage.is_location_within(&world(), BlockPos::new(31, 15, 31)));
        assert!(!stage.is_location_within(&world(), BlockPos::new(32, 15, 31)));
        assert!(!stage.is_location_within(&WorldId::new("nether"), BlockPos::new(1, 1, 1)));
        assert_eq!(stage.chunks_per_tick(), 4);
        assert!(!stage.set_chunks_per_tick(0));
        assert!(stage.set_chunks_per_tick(9));
        assert_eq!(stage.chunks_per_tick(), 9);
    }

    #[test]
    fn audience_membership_merges_and_unmerges() {
        let (engine, host, scheduler) = test_engine();
        let viewer = host.connect_viewer(&world());
        engine.viewer_connected(viewer);
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        let view = View::new(&stage, "ore", Pattern::single(IRON), false);
        stage.add_view(Arc::clone(&view));
        let pos = BlockPos::new(17, 1, 17);
        view.add_block(pos);
        assert_eq!(engine.overlay().get_block(viewer, pos), None);

        assert!(stage.add_viewer(viewer));
        assert!(!stage.add_viewer(viewer));
        assert_eq!(engine.overlay().get_block(viewer, pos), Some(IRON));

        assert!(stage.remove_viewer(viewer));
        assert_eq!(engine.overlay().get_block(viewer, pos), None);
        assert_eq!(engine.dispatcher().queued_chunks(viewer).len(), 4);
        scheduler.run_until_idle(100);
        assert!(engine.wait_idle());
        assert_eq!(host.recorded(viewer).columns().len(), 4);
    }

    #[test]
    fn per_player_views() {
        let (engine, host, scheduler) = test_engine();
        let (a, b) = (host.connect_viewer(&world()), host.connect_viewer(&world()));
        engine.viewer_connected(a);
        engine.viewer_connected(b);
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(31, 15, 31)).unwrap();
        let view = View::new(&stage, "secret", Pattern::single(DIAMOND), false);
        stage.add_view(Arc::clone(&view));
        view.add_blocks([BlockPos::new(1, 1, 1), BlockPos::new(20, 1, 1)]);

        assert!(stage.add_view_for_player(a, &view));
        assert_eq!(engine.overlay().get_block(a, BlockPos::new(20, 1, 1)), Some(DIAMOND));
        assert_eq!(engine.overlay().get_block(b, BlockPos::new(20, 1, 1)), None);
        assert_eq!(engine.dispatcher().queued_chunks(a), vec![ChunkPos::new(0, 0), ChunkPos::new(1, 0)]);
        scheduler.run_until_idle(100);

        assert!(stage.remove_view_for_player(a, &view));
        assert!(!stage.remove_view_for_player(a, &view));
        assert_eq!(engine.overlay().get_block(a, BlockPos::new(1, 1, 1)), None);
        assert_eq!(engine.dispatcher().queued_chunks(a), vec![ChunkPos::new(0, 0), ChunkPos::new(1, 0)]);
    }

    #[test]
    fn hidden_stages_are_not_dispatched() {
        let (engine, host, _scheduler) = test_engine();
        let viewer = host.connect_viewer(&world());
        engine.viewer_connected(viewer);
        let stage = engine.create_stage("mine", &world(), BlockPos::new(0, 0, 0), BlockPos::new(15, 15, 15)).unwrap();
        stage.add_viewer(viewer);
        assert!(stage.set_visible(false));
        assert_eq!(stage.send_blocks_to_audience(), 0);
        assert!(stage.set_visible(true));
        assert_eq!(engine.dispatcher().queued_chunks(viewer), vec![ChunkPos::ZERO]);
    }
}

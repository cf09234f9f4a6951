//! The per-viewer overlay cache: for every connected viewer, the merged set of blocks it sees instead of the real world.
//!
//! Each viewer keeps two structures behind one lock:
//! - the merged map, chunk -> position -> block, which is what gets sent;
//! - the per-view contributions, view -> chunk -> position -> block, with the view's z-index.
//!
//! A merged entry always equals the contribution of the highest z-index view that covers the position,
//! ties going to the view that started contributing last. Every mutation recomposites only the positions it touched.

pub mod sweep;

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::lighting::LightScope;
use crate::metrics::{PerformanceMonitor, COUNTER_RECENT_HITS, COUNTER_RECENT_MISSES};
use crate::prelude::*;
use crate::view::View;

/// Overridden blocks of a single chunk column.
pub type ChunkOverlay = HashMap<BlockPos, BlockState>;

/// Identity and paint order of a view, as seen by the cache.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ViewLayer {
    /// The view's key
    pub key: ViewKey,
    /// Higher paints over lower
    pub z_index: i32,
}

struct LayerSlot {
    z_index: i32,
    order: u64,
    chunks: HashMap<ChunkPos, ChunkOverlay>,
}

impl LayerSlot {
    fn positions(&self) -> impl Iterator<Item = BlockPos> + '_ {
        self.chunks.values().flat_map(|c| c.keys().copied())
    }
}

#[derive(Default)]
struct ViewerOverlay {
    merged: HashMap<ChunkPos, ChunkOverlay>,
    layers: HashMap<ViewKey, LayerSlot>,
    next_order: u64,
    /// Chunks whose merged content changed since the last drain
    dirty: HashSet<ChunkPos>,
}

impl ViewerOverlay {
    fn top(&self, pos: BlockPos) -> Option<(&ViewKey, BlockState)> {
        let chunk = pos.chunk();
        self.layers
            .iter()
            .filter_map(|(key, slot)| {
                let block = *slot.chunks.get(&chunk)?.get(&pos)?;
                Some((key, (slot.z_index, slot.order), block))
            })
            .max_by_key(|&(_, paint_order, _)| paint_order)
            .map(|(key, _, block)| (key, block))
    }

    fn recomposite(&mut self, pos: BlockPos) {
        let chunk = pos.chunk();
        match self.top(pos).map(|(_, block)| block) {
            Some(block) => {
                if self.merged.entry(chunk).or_default().insert(pos, block) != Some(block) {
                    self.dirty.insert(chunk);
                }
            }
            None => {
                if let Some(blocks) = self.merged.get_mut(&chunk) {
                    if blocks.remove(&pos).is_some() {
                        self.dirty.insert(chunk);
                    }
                    if blocks.is_empty() {
                        self.merged.remove(&chunk);
                    }
                }
            }
        }
    }

    fn sync_z_index(&mut self, layer: &ViewLayer) {
        let Some(slot) = self.layers.get_mut(&layer.key) else {
            return;
        };
        if slot.z_index == layer.z_index {
            return;
        }
        slot.z_index = layer.z_index;
        let positions: Vec<BlockPos> = slot.positions().collect();
        for pos in positions {
            self.recomposite(pos);
        }
    }

    fn apply(&mut self, layer: &ViewLayer, pos: BlockPos, block: Option<BlockState>) {
        let chunk = pos.chunk();
        self.sync_z_index(layer);
        match block {
            Some(block) => {
                let next_order = &mut self.next_order;
                let slot = self.layers.entry(layer.key.clone()).or_insert_with(|| {
                    *next_order += 1;
                    LayerSlot {
                        z_index: layer.z_index,
                        order: *next_order,
                        chunks: HashMap::new(),
                    }
                });
                slot.chunks.entry(chunk).or_default().insert(pos, block);
            }
            None => {
                if let Some(slot) = self.layers.get_mut(&layer.key) {
                    if let Some(blocks) = slot.chunks.get_mut(&chunk) {
                        blocks.remove(&pos);
                        if blocks.is_empty() {
                            slot.chunks.remove(&chunk);
                        }
                    }
                    if slot.chunks.is_empty() {
                        self.layers.remove(&layer.key);
                    }
                }
            }
        }
        self.recomposite(pos);
    }

    fn attach(&mut self, layer: &ViewLayer, mut contents: HashMap<ChunkPos, ChunkOverlay>) {
        contents.retain(|_, blocks| !blocks.is_empty());
        let old = self.layers.remove(&layer.key);
        let order = match &old {
            Some(slot) => slot.order,
            None => {
                self.next_order += 1;
                self.next_order
            }
        };
        let mut touched: Vec<BlockPos> = old.iter().flat_map(|slot| slot.positions()).collect();
        touched.extend(contents.values().flat_map(|c| c.keys().copied()));
        if !contents.is_empty() {
            self.layers.insert(
                layer.key.clone(),
                LayerSlot {
                    z_index: layer.z_index,
                    order,
                    chunks: contents,
                },
            );
        }
        for pos in touched {
            self.recomposite(pos);
        }
    }

    fn detach(&mut self, key: &ViewKey) -> bool {
        let Some(slot) = self.layers.remove(key) else {
            return false;
        };
        for pos in slot.positions() {
            self.recomposite(pos);
        }
        true
    }

    fn sweep(&mut self) -> usize {
        let before = self.merged.len() + self.layers.len();
        self.merged.retain(|_, blocks| !blocks.is_empty());
        for slot in self.layers.values_mut() {
            slot.chunks.retain(|_, blocks| !blocks.is_empty());
        }
        self.layers.retain(|_, slot| !slot.chunks.is_empty());
        before - (self.merged.len() + self.layers.len())
    }

    /// Recomputes the merged map from the contributions, returns the number of positions that were wrong.
    fn rebuild(&mut self) -> usize {
        let referenced: HashSet<BlockPos> = self.layers.values().flat_map(|slot| slot.positions()).collect();
        let stale: Vec<BlockPos> = self
            .merged
            .values()
            .flat_map(|c| c.keys().copied())
            .filter(|pos| !referenced.contains(pos))
            .collect();
        let mut corrected = stale.len();
        for pos in stale {
            self.recomposite(pos);
        }
        for pos in referenced {
            let expected = self.top(pos).map(|(_, block)| block);
            let actual = self.merged.get(&pos.chunk()).and_then(|c| c.get(&pos)).copied();
            if expected != actual {
                corrected += 1;
                self.recomposite(pos);
            }
        }
        corrected
    }
}

/// The merged overlay state of all connected viewers.
pub struct OverlayCache {
    viewers: DashMap<ViewerId, Arc<Mutex<ViewerOverlay>>>,
    recent: Mutex<LruCache<(ViewerId, ChunkPos), Arc<ChunkOverlay>>>,
    metrics: Arc<PerformanceMonitor>,
}

impl OverlayCache {
    /// Creates an empty cache whose recency cache holds up to `recent_capacity` chunk slices.
    pub fn new(recent_capacity: usize, metrics: Arc<PerformanceMonitor>) -> Self {
        Self {
            viewers: DashMap::new(),
            recent: Mutex::new(LruCache::new(
                NonZeroUsize::new(recent_capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            metrics,
        }
    }

    fn viewer(&self, viewer: ViewerId) -> Option<Arc<Mutex<ViewerOverlay>>> {
        self.viewers.get(&viewer).map(|e| Arc::clone(e.value()))
    }

    fn all_viewers(&self) -> Vec<(ViewerId, Arc<Mutex<ViewerOverlay>>)> {
        self.viewers.iter().map(|e| (*e.key(), Arc::clone(e.value()))).collect()
    }

    /// Drops the recency entries of chunks changed by the last operation. Called with the viewer's lock held.
    fn flush_dirty(&self, viewer: ViewerId, state: &mut ViewerOverlay) {
        if state.dirty.is_empty() {
            return;
        }
        let mut recent = self.recent.lock();
        for chunk in state.dirty.drain() {
            recent.pop(&(viewer, chunk));
        }
    }

    fn forget_recent(&self, viewer: ViewerId) {
        let mut recent = self.recent.lock();
        let keys: Vec<(ViewerId, ChunkPos)> = recent.iter().map(|(k, _)| *k).filter(|(v, _)| *v == viewer).collect();
        for key in keys {
            recent.pop(&key);
        }
    }

    /// Allocates the structures of a newly connected viewer, returns `false` if they already exist.
    pub fn initialize_player(&self, viewer: ViewerId) -> bool {
        match self.viewers.entry(viewer) {
            dashmap::Entry::Occupied(_) => return false,
            dashmap::Entry::Vacant(v) => {
                v.insert(Default::default());
            }
        }
        self.forget_recent(viewer);
        true
    }

    /// Frees everything held for a viewer, returns `false` if it wasn't initialized.
    pub fn remove_player(&self, viewer: ViewerId) -> bool {
        let removed = self.viewers.remove(&viewer).is_some();
        self.forget_recent(viewer);
        removed
    }

    /// Checks if the viewer's structures exist.
    pub fn is_initialized(&self, viewer: ViewerId) -> bool {
        self.viewers.contains_key(&viewer)
    }

    /// Number of initialized viewers.
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Sets (`Some`) or clears (`None`) the contribution of one view at one position for one viewer.
    /// Returns `false` if the viewer is not initialized or the position is not inside `chunk`.
    pub fn apply_block_change(
        &self,
        viewer: ViewerId,
        chunk: ChunkPos,
        pos: BlockPos,
        block: Option<BlockState>,
        layer: &ViewLayer,
    ) -> bool {
        if !chunk.contains(pos) {
            warn!(viewer = %viewer, %chunk, %pos, "Block change position is outside of its chunk");
            return false;
        }
        self.apply_block_changes(viewer, layer, &[(pos, block)])
    }

    /// Applies a batch of changes from one view under a single lock acquisition.
    pub fn apply_block_changes(
        &self,
        viewer: ViewerId,
        layer: &ViewLayer,
        changes: &[(BlockPos, Option<BlockState>)],
    ) -> bool {
        let Some(state) = self.viewer(viewer) else {
            return false;
        };
        let mut state = state.lock();
        for &(pos, block) in changes {
            state.apply(layer, pos, block);
        }
        self.flush_dirty(viewer, &mut state);
        true
    }

    /// Merges a view's current blocks into a viewer. Merging the same view again replaces its previous contribution.
    pub fn add_view_to_player(&self, viewer: ViewerId, view: &View) -> bool {
        self.attach_layer(viewer, &view.layer(), view.snapshot())
    }

    /// Merges an explicit contribution under the given layer, replacing any earlier contribution of that layer.
    pub fn attach_layer(&self, viewer: ViewerId, layer: &ViewLayer, contents: HashMap<ChunkPos, ChunkOverlay>) -> bool {
        let Some(state) = self.viewer(viewer) else {
            return false;
        };
        let mut state = state.lock();
        state.attach(layer, contents);
        self.flush_dirty(viewer, &mut state);
        true
    }

    /// Removes exactly the positions a view contributed, uncovering lower views. Returns `false` if the view wasn't attached.
    pub fn remove_view_from_player(&self, viewer: ViewerId, key: &ViewKey) -> bool {
        let Some(state) = self.viewer(viewer) else {
            return false;
        };
        let mut state = state.lock();
        let detached = state.detach(key);
        self.flush_dirty(viewer, &mut state);
        detached
    }

    /// Updates the paint order of an attached view and recomposites its positions.
    pub fn set_layer_z_index(&self, viewer: ViewerId, layer: &ViewLayer) -> bool {
        let Some(state) = self.viewer(viewer) else {
            return false;
        };
        let mut state = state.lock();
        state.sync_z_index(layer);
        self.flush_dirty(viewer, &mut state);
        true
    }

    /// The merged block a viewer sees at a position.
    pub fn get_block(&self, viewer: ViewerId, pos: BlockPos) -> Option<BlockState> {
        let state = self.viewer(viewer)?;
        let state = state.lock();
        state.merged.get(&pos.chunk())?.get(&pos).copied()
    }

    /// The view painting the merged block at a position, with that block.
    pub fn top_layer_at(&self, viewer: ViewerId, pos: BlockPos) -> Option<(ViewKey, BlockState)> {
        let state = self.viewer(viewer)?;
        let state = state.lock();
        state.top(pos).map(|(key, block)| (key.clone(), block))
    }

    /// The merged blocks of one chunk, `None` if the viewer has no overrides there.
    pub fn get_chunk(&self, viewer: ViewerId, chunk: ChunkPos) -> Option<Arc<ChunkOverlay>> {
        if let Some(hit) = self.recent.lock().get(&(viewer, chunk)) {
            self.metrics.increment(COUNTER_RECENT_HITS);
            return Some(Arc::clone(hit));
        }
        self.metrics.increment(COUNTER_RECENT_MISSES);
        let owner = self.viewer(viewer)?;
        let state = owner.lock();
        let blocks = state.merged.get(&chunk).filter(|blocks| !blocks.is_empty())?;
        let slice = Arc::new(blocks.clone());
        self.remember(viewer, &owner, chunk, &slice);
        Some(slice)
    }

    /// Caches a merged slice, unless `owner` stopped being the viewer's state since it was read.
    /// Checked under the recent lock, which removal takes after unregistering the viewer.
    fn remember(&self, viewer: ViewerId, owner: &Arc<Mutex<ViewerOverlay>>, chunk: ChunkPos, slice: &Arc<ChunkOverlay>) {
        let mut recent = self.recent.lock();
        if self.viewers.get(&viewer).is_some_and(|current| Arc::ptr_eq(current.value(), owner)) {
            recent.put((viewer, chunk), Arc::clone(slice));
        }
    }

    /// The merged blocks of every requested chunk that has overrides for the viewer; chunks without any are left out.
    pub fn get_chunks_for_viewer(&self, viewer: ViewerId, chunks: &[ChunkPos]) -> HashMap<ChunkPos, Arc<ChunkOverlay>> {
        chunks
            .iter()
            .filter_map(|&chunk| Some((chunk, self.get_chunk(viewer, chunk)?)))
            .collect()
    }

    /// Keys of the views currently contributing to a viewer, sorted.
    pub fn attached_views(&self, viewer: ViewerId) -> Vec<ViewKey> {
        let Some(state) = self.viewer(viewer) else {
            return Vec::new();
        };
        let mut keys: Vec<ViewKey> = state.lock().layers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Positions tracked for one view of one viewer, sorted.
    pub fn view_positions(&self, viewer: ViewerId, key: &ViewKey) -> Vec<BlockPos> {
        let Some(state) = self.viewer(viewer) else {
            return Vec::new();
        };
        let state = state.lock();
        let mut positions: Vec<BlockPos> = state.layers.get(key).map(|s| s.positions().collect()).unwrap_or_default();
        positions.sort();
        positions
    }

    /// Number of chunks in the viewer's merged map.
    pub fn merged_chunk_count(&self, viewer: ViewerId) -> usize {
        self.viewer(viewer).map_or(0, |s| s.lock().merged.len())
    }

    /// Lighting scopes whose custom light applies to the viewer: the stages of attached views first, then the views in paint order.
    pub fn visible_light_scopes(&self, viewer: ViewerId) -> Vec<LightScope> {
        let Some(state) = self.viewer(viewer) else {
            return Vec::new();
        };
        let state = state.lock();
        let mut views: Vec<(&ViewKey, (i32, u64))> =
            state.layers.iter().map(|(k, s)| (k, (s.z_index, s.order))).collect();
        views.sort_by_key(|&(_, paint_order)| paint_order);
        let mut stages: Vec<KString> = views.iter().map(|(k, _)| KString::from_ref(k.stage())).collect();
        stages.sort();
        stages.dedup();
        stages
            .into_iter()
            .map(LightScope::Stage)
            .chain(views.into_iter().map(|(k, _)| LightScope::View(k.clone())))
            .collect()
    }

    /// Removes every contribution of every view of a stage from every viewer. Returns the number of detached (viewer, view) pairs.
    pub fn clear_stage_cache(&self, stage: &str) -> usize {
        self.detach_matching(|key| key.stage() == stage)
    }

    /// Removes every contribution of a view from every viewer. Returns the number of viewers it was attached to.
    pub fn clear_view_cache(&self, key: &ViewKey) -> usize {
        self.detach_matching(|k| k == key)
    }

    fn detach_matching(&self, matches: impl Fn(&ViewKey) -> bool) -> usize {
        let mut detached = 0;
        for (_, state) in self.all_viewers() {
            let mut state = state.lock();
            let keys: Vec<ViewKey> = state.layers.keys().filter(|k| matches(k)).cloned().collect();
            for key in keys {
                detached += usize::from(state.detach(&key));
            }
            state.dirty.clear();
        }
        self.recent.lock().clear();
        detached
    }

    /// Drops empty maps left behind by churn. Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        self.all_viewers().into_iter().map(|(_, state)| state.lock().sweep()).sum()
    }

    /// Rebuilds a viewer's merged map from its per-view contributions. Returns the number of corrected positions.
    pub fn validate_viewer(&self, viewer: ViewerId) -> Option<usize> {
        let state = self.viewer(viewer)?;
        let mut state = state.lock();
        let corrected = state.rebuild();
        if corrected > 0 {
            warn!(viewer = %viewer, corrected, "Overlay cache diverged from its view contributions");
        }
        self.flush_dirty(viewer, &mut state);
        Some(corrected)
    }

    /// Runs [`Self::validate_viewer`] for every viewer, returns the total number of corrected positions.
    pub fn validate_all(&self) -> usize {
        self.all_viewers()
            .into_iter()
            .filter_map(|(viewer, _)| self.validate_viewer(viewer))
            .sum()
    }

    /// Drops every viewer and cached slice.
    pub fn clear(&self) {
        self.viewers.clear();
        self.recent.lock().clear();
    }
}

#[cfg(test)]
mod test {
    use quickcheck_macros::quickcheck;

    use super::*;

    const STONE: BlockState = BlockState(1);
    const GLASS: BlockState = BlockState(5);

    fn cache() -> OverlayCache {
        OverlayCache::new(16, Arc::new(PerformanceMonitor::new()))
    }

    fn layer(view: &str, z_index: i32) -> ViewLayer {
        ViewLayer {
            key: ViewKey::new("mine", view),
            z_index,
        }
    }

    fn contents(blocks: &[(BlockPos, BlockState)]) -> HashMap<ChunkPos, ChunkOverlay> {
        let mut map: HashMap<ChunkPos, ChunkOverlay> = HashMap::new();
        for &(pos, block) in blocks {
            map.entry(pos.chunk()).or_default().insert(pos, block);
        }
        map
    }

    #[test]
    fn apply_and_remove_single_block() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        let pos = BlockPos::new(3, 4, 5);
        let ore = layer("ore", 0);
        assert!(!cache.apply_block_change(viewer, pos.chunk(), pos, Some(STONE), &ore));
        assert!(cache.initialize_player(viewer));
        assert!(!cache.initialize_player(viewer));
        assert!(cache.apply_block_change(viewer, pos.chunk(), pos, Some(STONE), &ore));
        assert_eq!(cache.get_block(viewer, pos), Some(STONE));
        assert!(!cache.apply_block_change(viewer, ChunkPos::new(9, 9), pos, None, &ore));
        assert!(cache.apply_block_change(viewer, pos.chunk(), pos, None, &ore));
        assert_eq!(cache.get_block(viewer, pos), None);
        assert_eq!(cache.merged_chunk_count(viewer), 0);
        assert!(cache.attached_views(viewer).is_empty());
    }

    #[test]
    fn slices_read_before_removal_are_not_cached_after_it() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        let pos = BlockPos::new(3, 4, 5);
        cache.initialize_player(viewer);
        cache.attach_layer(viewer, &layer("ore", 0), contents(&[(pos, STONE)]));
        let owner = cache.viewer(viewer).unwrap();
        let slice = Arc::new(owner.lock().merged[&pos.chunk()].clone());

        // A lookup that read the slice just before the viewer left, then reconnected
        assert!(cache.remove_player(viewer));
        cache.remember(viewer, &owner, pos.chunk(), &slice);
        assert!(cache.initialize_player(viewer));
        cache.remember(viewer, &owner, pos.chunk(), &slice);
        assert_eq!(cache.recent.lock().len(), 0);
        assert_eq!(cache.get_chunk(viewer, pos.chunk()), None);
        assert_eq!(cache.get_block(viewer, pos), None);

        cache.attach_layer(viewer, &layer("ore", 0), contents(&[(pos, GLASS)]));
        assert_eq!(cache.get_chunk(viewer, pos.chunk()).map(|c| c.get(&pos).copied()), Some(Some(GLASS)));
        assert_eq!(cache.recent.lock().len(), 1);
    }

    #[test]
    fn attaching_twice_does_not_duplicate() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        let ore = layer("ore", 0);
        let blocks = [(BlockPos::new(0, 0, 0), STONE), (BlockPos::new(20, 0, 0), GLASS)];
        assert!(cache.attach_layer(viewer, &ore, contents(&blocks)));
        assert!(cache.attach_layer(viewer, &ore, contents(&blocks[..1])));
        assert_eq!(cache.view_positions(viewer, &ore.key), vec![BlockPos::new(0, 0, 0)]);
        assert_eq!(cache.get_block(viewer, BlockPos::new(20, 0, 0)), None);
        assert_eq!(cache.merged_chunk_count(viewer), 1);
    }

    #[test]
    fn removing_the_top_view_uncovers_the_lower_one() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        let pos = BlockPos::new(1, 1, 1);
        let (low, high) = (layer("floor", 0), layer("glass", 5));
        cache.attach_layer(viewer, &high, contents(&[(pos, GLASS)]));
        cache.attach_layer(viewer, &low, contents(&[(pos, STONE)]));
        assert_eq!(cache.get_block(viewer, pos), Some(GLASS));
        assert_eq!(cache.top_layer_at(viewer, pos), Some((high.key.clone(), GLASS)));

        assert!(cache.remove_view_from_player(viewer, &high.key));
        assert!(!cache.remove_view_from_player(viewer, &high.key));
        assert_eq!(cache.get_block(viewer, pos), Some(STONE));
        assert!(cache.remove_view_from_player(viewer, &low.key));
        assert_eq!(cache.get_block(viewer, pos), None);
        assert_eq!(cache.merged_chunk_count(viewer), 0);
    }

    #[test]
    fn z_index_changes_recomposite() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        let pos = BlockPos::new(-4, 60, 7);
        let a = layer("a", 1);
        let b = layer("b", 2);
        cache.attach_layer(viewer, &a, contents(&[(pos, STONE)]));
        cache.attach_layer(viewer, &b, contents(&[(pos, GLASS)]));
        assert_eq!(cache.get_block(viewer, pos), Some(GLASS));
        cache.set_layer_z_index(viewer, &layer("a", 3));
        assert_eq!(cache.get_block(viewer, pos), Some(STONE));
        // Equal z-index: the view that started contributing last wins
        cache.set_layer_z_index(viewer, &layer("b", 3));
        assert_eq!(cache.get_block(viewer, pos), Some(GLASS));
    }

    #[test]
    fn bulk_retrieval_skips_empty_chunks_and_uses_recency_cache() {
        let metrics = Arc::new(PerformanceMonitor::new());
        let cache = OverlayCache::new(16, Arc::clone(&metrics));
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        let ore = layer("ore", 0);
        let pos = BlockPos::new(17, 2, 2);
        cache.apply_block_change(viewer, pos.chunk(), pos, Some(STONE), &ore);

        let wanted = [ChunkPos::new(0, 0), ChunkPos::new(1, 0)];
        let chunks = cache.get_chunks_for_viewer(viewer, &wanted);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[&ChunkPos::new(1, 0)].get(&pos), Some(&STONE));
        let _ = cache.get_chunks_for_viewer(viewer, &wanted);
        assert_eq!(metrics.counter(COUNTER_RECENT_HITS), 1);

        // A change to the chunk invalidates its cached slice
        cache.apply_block_change(viewer, pos.chunk(), pos, Some(GLASS), &ore);
        assert_eq!(cache.get_chunk(viewer, pos.chunk()).unwrap().get(&pos), Some(&GLASS));
    }

    #[test]
    fn clearing_a_stage_removes_only_its_views() {
        let cache = cache();
        let viewers = [ViewerId::new_random(), ViewerId::new_random()];
        let other = ViewLayer {
            key: ViewKey::new("arena", "walls"),
            z_index: 0,
        };
        for &viewer in &viewers {
            cache.initialize_player(viewer);
            cache.attach_layer(viewer, &layer("ore", 0), contents(&[(BlockPos::new(0, 0, 0), STONE)]));
            cache.attach_layer(viewer, &layer("shaft", 1), contents(&[(BlockPos::new(1, 0, 0), GLASS)]));
            cache.attach_layer(viewer, &other, contents(&[(BlockPos::new(2, 0, 0), GLASS)]));
        }
        assert_eq!(cache.clear_stage_cache("mine"), 4);
        for &viewer in &viewers {
            assert_eq!(cache.attached_views(viewer), vec![other.key.clone()]);
            assert_eq!(cache.get_block(viewer, BlockPos::new(0, 0, 0)), None);
            assert_eq!(cache.get_block(viewer, BlockPos::new(2, 0, 0)), Some(GLASS));
        }
        assert_eq!(cache.clear_view_cache(&other.key), 2);
        assert_eq!(cache.merged_chunk_count(viewers[0]), 0);
    }

    #[test]
    fn validator_repairs_divergence() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        let pos = BlockPos::new(5, 5, 5);
        cache.attach_layer(viewer, &layer("ore", 0), contents(&[(pos, STONE)]));
        {
            let state = cache.viewer(viewer).unwrap();
            let mut state = state.lock();
            let stray = BlockPos::new(6, 5, 5);
            state.merged.get_mut(&pos.chunk()).unwrap().insert(stray, GLASS);
            state.merged.get_mut(&pos.chunk()).unwrap().insert(pos, GLASS);
            state.merged.insert(ChunkPos::new(4, 4), HashMap::new());
        }
        assert_eq!(cache.validate_viewer(viewer), Some(2));
        assert_eq!(cache.get_block(viewer, pos), Some(STONE));
        assert_eq!(cache.get_block(viewer, BlockPos::new(6, 5, 5)), None);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.validate_all(), 0);
    }

    #[test]
    fn removing_a_player_forgets_everything() {
        let cache = cache();
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        let pos = BlockPos::new(0, 0, 0);
        cache.apply_block_change(viewer, pos.chunk(), pos, Some(STONE), &layer("ore", 0));
        assert!(cache.get_chunk(viewer, pos.chunk()).is_some());
        assert!(cache.remove_player(viewer));
        assert!(!cache.remove_player(viewer));
        assert!(cache.get_chunk(viewer, pos.chunk()).is_none());
        assert_eq!(cache.viewer_count(), 0);
    }

    #[quickcheck]
    fn merged_map_matches_contributions(changes: Vec<(u8, i8, i8, Option<u8>)>) -> bool {
        let cache = cache();
        let viewer = ViewerId::new_random();
        cache.initialize_player(viewer);
        for (view, x, z, block) in changes {
            let view = view % 4;
            let layer = layer(&format!("v{view}"), i32::from(view % 2));
            let pos = BlockPos::new(i32::from(x % 20), 3, i32::from(z % 20));
            cache.apply_block_change(viewer, pos.chunk(), pos, block.map(|b| BlockState(u32::from(b))), &layer);
        }
        let views = cache.attached_views(viewer);
        cache.validate_viewer(viewer) == Some(0) && views.len() <= 4
    }
}

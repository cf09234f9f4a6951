//! Custom per-position light values, kept apart from block overrides so each can be toggled on its own.

use std::fmt::{Display, Formatter};

use mg_schemas::light::{LightChannels, LightLevel, LightingData};

use crate::events::{Decision, LightingChangeEvent, LightingListener, Listeners};
use crate::prelude::*;

/// The owner of a set of custom light values.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum LightScope {
    /// Light attached to a single view.
    View(ViewKey),
    /// Light attached to a whole stage.
    Stage(KString),
}

impl LightScope {
    /// Scope of a view.
    pub fn view(stage: &str, view: &str) -> Self {
        Self::View(ViewKey::new(stage, view))
    }

    /// Scope of a stage.
    pub fn stage(stage: &str) -> Self {
        Self::Stage(KString::from_ref(stage))
    }
}

impl Display for LightScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::View(key) => write!(f, "view:{key}"),
            Self::Stage(name) => write!(f, "stage:{name}"),
        }
    }
}

type ScopeLighting = HashMap<ChunkPos, HashMap<BlockPos, LightingData>>;

/// Stores custom lighting per scope and position. Every change is offered to the registered listeners first.
#[derive(Default)]
pub struct BlockLightingManager {
    scopes: DashMap<LightScope, ScopeLighting>,
    listeners: Listeners<dyn LightingListener>,
}

impl BlockLightingManager {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener that may veto lighting changes.
    pub fn register_listener(&self, listener: Arc<dyn LightingListener>) {
        self.listeners.register(listener);
    }

    fn validate(scope: &LightScope, pos: BlockPos, level: i32) -> Option<LightLevel> {
        match LightLevel::try_new(level) {
            Ok(level) => Some(level),
            Err(e) => {
                warn!(%scope, %pos, "Rejected custom light: {e}");
                None
            }
        }
    }

    /// Overrides the block light channel. Returns `false` without changing anything if the level is outside 0..=15 or a listener cancels.
    pub fn set_block_light(&self, scope: &LightScope, pos: BlockPos, level: i32) -> bool {
        let Some(level) = Self::validate(scope, pos, level) else {
            return false;
        };
        self.commit(scope, pos, |data| data.with(LightChannels::BLOCK, level), LightChannels::BLOCK)
    }

    /// Overrides the sky light channel. Returns `false` without changing anything if the level is outside 0..=15 or a listener cancels.
    pub fn set_sky_light(&self, scope: &LightScope, pos: BlockPos, level: i32) -> bool {
        let Some(level) = Self::validate(scope, pos, level) else {
            return false;
        };
        self.commit(scope, pos, |data| data.with(LightChannels::SKY, level), LightChannels::SKY)
    }

    /// Overrides both channels at once, rejecting the change as a whole if either level is invalid.
    pub fn set_lighting(&self, scope: &LightScope, pos: BlockPos, block_light: i32, sky_light: i32) -> bool {
        let (Some(block), Some(sky)) = (
            Self::validate(scope, pos, block_light),
            Self::validate(scope, pos, sky_light),
        ) else {
            return false;
        };
        self.commit(
            scope,
            pos,
            |data| data.with(LightChannels::BLOCK, block).with(LightChannels::SKY, sky),
            LightChannels::all(),
        )
    }

    fn commit(
        &self,
        scope: &LightScope,
        pos: BlockPos,
        change: impl FnOnce(LightingData) -> LightingData,
        channels: LightChannels,
    ) -> bool {
        let previous = self.get_lighting(scope, pos);
        let new_value = change(previous.unwrap_or_default());
        let event = LightingChangeEvent {
            scope: scope.clone(),
            position: pos,
            previous,
            new_value: Some(new_value),
            channels,
        };
        if self.listeners.decide(|l| l.on_lighting_change(&event)) == Decision::Cancel {
            debug!(%scope, %pos, "Lighting change cancelled by a listener");
            return false;
        }
        self.scopes
            .entry(scope.clone())
            .or_default()
            .entry(pos.chunk())
            .or_default()
            .insert(pos, new_value);
        true
    }

    /// The stored light of a position.
    pub fn get_lighting(&self, scope: &LightScope, pos: BlockPos) -> Option<LightingData> {
        self.scopes.get(scope)?.get(&pos.chunk())?.get(&pos).copied()
    }

    /// Removes the custom light of a position. Returns `false` if there was none or a listener cancelled.
    pub fn remove_lighting(&self, scope: &LightScope, pos: BlockPos) -> bool {
        let Some(previous) = self.get_lighting(scope, pos) else {
            return false;
        };
        let event = LightingChangeEvent {
            scope: scope.clone(),
            position: pos,
            previous: Some(previous),
            new_value: None,
            channels: previous.channels(),
        };
        if self.listeners.decide(|l| l.on_lighting_change(&event)) == Decision::Cancel {
            return false;
        }
        let Some(mut chunks) = self.scopes.get_mut(scope) else {
            return false;
        };
        let chunk = pos.chunk();
        let removed = match chunks.get_mut(&chunk) {
            Some(positions) => {
                let removed = positions.remove(&pos).is_some();
                if positions.is_empty() {
                    chunks.remove(&chunk);
                }
                removed
            }
            None => false,
        };
        let now_empty = chunks.is_empty();
        drop(chunks);
        if now_empty {
            self.scopes.remove_if(scope, |_, chunks| chunks.is_empty());
        }
        removed
    }

    /// Removes every custom light of a scope, one notified change per position. Returns the number removed.
    pub fn remove_all_lighting(&self, scope: &LightScope) -> usize {
        self.positions(scope)
            .into_iter()
            .filter(|&pos| self.remove_lighting(scope, pos))
            .count()
    }

    /// Drops a scope without notifying anyone, used when its view or stage is deleted.
    pub fn purge_scope(&self, scope: &LightScope) -> usize {
        self.scopes
            .remove(scope)
            .map_or(0, |(_, chunks)| chunks.values().map(HashMap::len).sum())
    }

    /// Every position of a scope carrying custom light, sorted.
    pub fn positions(&self, scope: &LightScope) -> Vec<BlockPos> {
        let Some(chunks) = self.scopes.get(scope) else {
            return Vec::new();
        };
        let mut positions: Vec<BlockPos> = chunks.values().flat_map(|c| c.keys().copied()).collect();
        positions.sort();
        positions
    }

    /// The custom light inside one chunk across the given scopes, later scopes overriding earlier ones per channel.
    pub fn lighting_in_chunk(&self, scopes: &[LightScope], chunk: ChunkPos) -> HashMap<BlockPos, LightingData> {
        let mut merged: HashMap<BlockPos, LightingData> = HashMap::new();
        for scope in scopes {
            let Some(chunks) = self.scopes.get(scope) else {
                continue;
            };
            let Some(positions) = chunks.get(&chunk) else {
                continue;
            };
            for (&pos, &data) in positions {
                let slot = merged.entry(pos).or_default();
                *slot = slot.overlaid_with(data);
            }
        }
        merged
    }

    /// Number of scopes holding any custom light.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Drops everything without notifying anyone.
    pub fn clear(&self) {
        self.scopes.clear();
    }
}

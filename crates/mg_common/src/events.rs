//! Notifications the engine emits to host listeners.

use mg_schemas::light::{LightChannels, LightingData};

use crate::dispatch::DispatchKind;
use crate::lighting::LightScope;
use crate::overlay::ChunkOverlay;
use crate::prelude::*;

/// A listener's verdict on a pending change.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Decision {
    /// Let the change happen.
    #[default]
    Proceed,
    /// Veto the change; nothing is stored.
    Cancel,
}

/// Fired once per viewer before a drip of chunk work is scheduled for it.
#[derive(Clone, Debug)]
pub struct BlocksSendEvent {
    /// The receiving viewer
    pub viewer: ViewerId,
    /// The stage being dispatched
    pub stage: KString,
    /// The stage's world
    pub world: WorldId,
    /// What kind of dispatch is scheduled
    pub kind: DispatchKind,
    /// Every chunk that will be resynthesized for the viewer
    pub chunks: Vec<ChunkPos>,
    /// The viewer's overrides in those chunks, chunks without any are left out
    pub blocks: HashMap<ChunkPos, Arc<ChunkOverlay>>,
}

/// Observes bulk dispatches. A [`Decision::Cancel`] skips the dispatch to that viewer.
pub trait BlocksSendListener: Send + Sync + 'static {
    /// Called before the drip is scheduled.
    fn on_blocks_send(&self, event: &BlocksSendEvent) -> Decision;
}

impl<F: Fn(&BlocksSendEvent) -> Decision + Send + Sync + 'static> BlocksSendListener for F {
    fn on_blocks_send(&self, event: &BlocksSendEvent) -> Decision {
        self(event)
    }
}

/// Fired before a custom lighting change is stored.
#[derive(Clone, Debug)]
pub struct LightingChangeEvent {
    /// The view or stage the lighting belongs to
    pub scope: LightScope,
    /// The affected position
    pub position: BlockPos,
    /// The stored value before the change
    pub previous: Option<LightingData>,
    /// The value after the change, `None` for removals
    pub new_value: Option<LightingData>,
    /// The channels that change
    pub channels: LightChannels,
}

/// Can veto custom lighting changes.
pub trait LightingListener: Send + Sync + 'static {
    /// Called before the change is committed.
    fn on_lighting_change(&self, event: &LightingChangeEvent) -> Decision;
}

impl<F: Fn(&LightingChangeEvent) -> Decision + Send + Sync + 'static> LightingListener for F {
    fn on_lighting_change(&self, event: &LightingChangeEvent) -> Decision {
        self(event)
    }
}

/// A registration list of listeners of one kind.
pub struct Listeners<L: ?Sized> {
    list: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    /// Adds a listener, called after the ones registered before it.
    pub fn register(&self, listener: Arc<L>) {
        self.list.write().push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Checks if nobody listens.
    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Asks every listener in registration order, stopping at the first [`Decision::Cancel`].
    /// Listeners are called without the registration lock held, so they may register others.
    pub fn decide(&self, ask: impl Fn(&L) -> Decision) -> Decision {
        let snapshot: Vec<Arc<L>> = self.list.read().clone();
        if snapshot.iter().any(|listener| ask(&**listener) == Decision::Cancel) {
            Decision::Cancel
        } else {
            Decision::Proceed
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_cancel_wins() {
        let listeners: Listeners<dyn LightingListener> = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&calls);
        listeners.register(Arc::new(move |_: &LightingChangeEvent| {
            c1.fetch_add(1, AtomicOrdering::SeqCst);
            Decision::Cancel
        }));
        let c2 = Arc::clone(&calls);
        listeners.register(Arc::new(move |_: &LightingChangeEvent| {
            c2.fetch_add(1, AtomicOrdering::SeqCst);
            Decision::Proceed
        }));
        let event = LightingChangeEvent {
            scope: LightScope::Stage(KString::from_static("mine")),
            position: BlockPos::ZERO,
            previous: None,
            new_value: None,
            channels: LightChannels::all(),
        };
        assert_eq!(listeners.decide(|l| l.on_lighting_change(&event)), Decision::Cancel);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(listeners.len(), 2);
    }
}

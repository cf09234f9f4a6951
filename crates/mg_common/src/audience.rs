//! The viewers entitled to see a stage.

use crate::host::ViewerDirectory;
use crate::prelude::*;

/// Mining speed of viewers without an explicit multiplier.
pub const DEFAULT_MINING_SPEED: f64 = 1.0;

/// A set of viewers, a visibility flag and per-viewer mining speed multipliers.
#[derive(Debug)]
pub struct Audience {
    members: RwLock<HashSet<ViewerId>>,
    visible: AtomicBool,
    mining_speeds: RwLock<HashMap<ViewerId, f64>>,
}

impl Default for Audience {
    fn default() -> Self {
        Self {
            members: RwLock::default(),
            visible: AtomicBool::new(true),
            mining_speeds: RwLock::default(),
        }
    }
}

impl Audience {
    /// An empty, visible audience.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, viewer: ViewerId) -> bool {
        self.members.write().insert(viewer)
    }

    pub(crate) fn remove(&self, viewer: ViewerId) -> bool {
        self.mining_speeds.write().remove(&viewer);
        self.members.write().remove(&viewer)
    }

    /// Checks membership.
    pub fn contains(&self, viewer: ViewerId) -> bool {
        self.members.read().contains(&viewer)
    }

    /// All members, sorted.
    pub fn members(&self) -> Vec<ViewerId> {
        let mut members: Vec<ViewerId> = self.members.read().iter().copied().collect();
        members.sort();
        members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Checks if nobody is a member.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// The members that currently have a live connection.
    pub fn online_members(&self, directory: &dyn ViewerDirectory) -> Vec<ViewerId> {
        // The directory is asked without holding the member lock
        let members: Vec<ViewerId> = self.members.read().iter().copied().collect();
        let mut online: Vec<ViewerId> = members.into_iter().filter(|&viewer| directory.is_connected(viewer)).collect();
        online.sort();
        online
    }

    /// Hidden audiences receive no dispatches.
    pub fn is_visible(&self) -> bool {
        self.visible.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn set_visible(&self, visible: bool) -> bool {
        self.visible.swap(visible, AtomicOrdering::AcqRel) != visible
    }

    /// Sets a member's mining speed multiplier. Exactly 1.0 is the default and is rejected, as are negative and non-finite values.
    pub fn set_mining_speed(&self, viewer: ViewerId, speed: f64) -> bool {
        if speed == DEFAULT_MINING_SPEED || speed < 0.0 || !speed.is_finite() {
            warn!(viewer = %viewer, speed, "Rejected mining speed multiplier");
            return false;
        }
        if !self.contains(viewer) {
            return false;
        }
        self.mining_speeds.write().insert(viewer, speed);
        true
    }

    /// The member's mining speed multiplier, 1.0 if unset.
    pub fn mining_speed(&self, viewer: ViewerId) -> f64 {
        self.mining_speeds
            .read()
            .get(&viewer)
            .copied()
            .unwrap_or(DEFAULT_MINING_SPEED)
    }

    /// Restores the default multiplier, returns `false` if none was set.
    pub fn reset_mining_speed(&self, viewer: ViewerId) -> bool {
        self.mining_speeds.write().remove(&viewer).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mining_speed_rules() {
        let audience = Audience::new();
        let viewer = ViewerId::new_random();
        assert!(!audience.set_mining_speed(viewer, 2.0));
        assert!(audience.add(viewer));
        assert!(!audience.add(viewer));
        assert!(!audience.set_mining_speed(viewer, 1.0));
        assert!(!audience.set_mining_speed(viewer, -0.5));
        assert!(!audience.set_mining_speed(viewer, f64::NAN));
        assert_eq!(audience.mining_speed(viewer), 1.0);
        assert!(audience.set_mining_speed(viewer, 0.0));
        assert!(audience.set_mining_speed(viewer, 2.5));
        assert_eq!(audience.mining_speed(viewer), 2.5);
        assert!(audience.reset_mining_speed(viewer));
        assert!(!audience.reset_mining_speed(viewer));

        audience.set_mining_speed(viewer, 3.0);
        assert!(audience.remove(viewer));
        assert_eq!(audience.mining_speed(viewer), 1.0);
        assert!(audience.is_empty());
    }

    #[test]
    fn visibility_toggles() {
        let audience = Audience::new();
        assert!(audience.is_visible());
        assert!(audience.set_visible(false));
        assert!(!audience.set_visible(false));
        assert!(!audience.is_visible());
    }
}

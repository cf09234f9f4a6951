//! Block identities as stored in terrain sections and overlay maps.

use std::fmt::{Debug, Display, Formatter};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// A fully resolved block variant (block type plus its state), identified by the host's global state id.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockState(pub u32);

impl BlockState {
    /// The empty block, treated as "no solid block" by height scans.
    pub const AIR: Self = Self(0);

    /// Helper to construct a block state from a raw state id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw state id.
    pub const fn id(self) -> u32 {
        self.0
    }

    /// Checks if this is [`Self::AIR`].
    pub const fn is_air(self) -> bool {
        self.0 == 0
    }
}

impl Debug for BlockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockState{{id={}}}", self.0)
    }
}

impl Display for BlockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#![warn(missing_docs)]
#![deny(clippy::disallowed_types)]

//! A library crate of the in-memory representations of the overlay engine's core data:
//! coordinates, block identities, weighted block patterns, light values and terrain columns.

pub mod block;
pub mod column;
pub mod coordinates;
pub mod light;
pub mod pattern;

/// Re-exported dependencies used in API types
pub mod dependencies {
    pub use bitflags;
    pub use bitvec;
    pub use bytemuck;
    pub use glam;
    pub use hashbrown;
    pub use rand;
    pub use smallvec;
    pub use thiserror;
}

#![warn(missing_docs)]
#![deny(clippy::disallowed_types, clippy::await_holding_lock)]
#![allow(clippy::type_complexity)]

//! Mirage: per-viewer virtual block overlays painted on top of a host's authoritative world.
//!
//! Stages group views (named sets of overridden positions) and the audience allowed to see them.
//! Every connected viewer gets a merged overlay cache, and dispatched chunks are re-synthesized
//! from terrain plus that cache on a worker pool, a few chunks per tick.

pub mod audience;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod host;
pub mod identity;
pub mod lighting;
pub mod metrics;
pub mod overlay;
pub mod pipeline;
pub mod pool;
pub mod prelude;
pub mod scheduler;
pub mod stage;
pub mod view;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use engine::{EngineBuildError, OverlayEngine, OverlayEngineBuilder, OverrideHit};
pub use stage::Stage;
pub use view::View;

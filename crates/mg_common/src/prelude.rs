//! Common type aliases

// some of the imports here are not used yet, but are pre-defined for symmetry
#![allow(unused)]

// Anyhow error handling
pub use anyhow::{anyhow, bail, ensure, Context, Result};

// Tokio channels
pub use tokio::sync::oneshot::{
    channel as async_oneshot_channel, Receiver as AsyncOneshotReceiver, Sender as AsyncOneshotSender,
};

// Common synchronization types, parking_lot locks don't poison
pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use std::sync::atomic::{Ordering as AtomicOrdering, *};
pub use std::sync::{Arc, Weak};

// hashbrown Hash* types and the sharded concurrent map
pub use dashmap::DashMap;
pub use hashbrown::{HashMap, HashSet};

// Logging
pub use tracing::{debug, error, info, trace, warn};

// Core value types
pub use kstring::KString;
pub use mg_schemas::block::BlockState;
pub use mg_schemas::coordinates::{BlockPos, ChunkPos};

pub use crate::identity::{ViewKey, ViewerId, WorldId};

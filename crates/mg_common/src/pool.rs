//! Reusable buffers for the synthesis and dispatch hot paths.

use mg_schemas::light::NibbleArray;

use crate::overlay::ChunkOverlay;
use crate::pipeline::ChunkUnit;
use crate::prelude::*;

/// An object that can be cleared and handed out again by an [`ObjectPool`].
pub trait Poolable: Send + 'static {
    /// Allocates a fresh object when the pool is empty.
    fn create() -> Self;
    /// Clears all state so nothing leaks to the next user.
    fn reset(&mut self);
}

impl<K: Send + 'static, V: Send + 'static> Poolable for HashMap<K, V> {
    fn create() -> Self {
        HashMap::new()
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl<T: Send + 'static> Poolable for Vec<T> {
    fn create() -> Self {
        Vec::new()
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl Poolable for NibbleArray {
    fn create() -> Self {
        NibbleArray::new()
    }

    fn reset(&mut self) {
        self.fill(mg_schemas::light::LightLevel::DARK);
    }
}

/// Usage statistics of a single pool.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct PoolStats {
    /// Objects currently idle in the pool
    pub idle: usize,
    /// Acquisitions served from the pool
    pub hits: u64,
    /// Acquisitions that had to allocate
    pub misses: u64,
    /// Released objects dropped because the pool was full or busy
    pub dropped: u64,
}

/// A bounded free list. [`Self::acquire`] never blocks and [`Self::release`] never grows the pool past its capacity.
pub struct ObjectPool<T: Poolable> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates an empty pool holding at most `capacity` idle objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Takes an idle object, or allocates a new one if none is idle or the pool is contended.
    pub fn acquire(&self) -> T {
        let reused = self.free.try_lock().and_then(|mut free| free.pop());
        match reused {
            Some(obj) => {
                self.hits.fetch_add(1, AtomicOrdering::Relaxed);
                obj
            }
            None => {
                self.misses.fetch_add(1, AtomicOrdering::Relaxed);
                T::create()
            }
        }
    }

    /// Clears the object and keeps it for reuse, unless the pool is full or contended.
    pub fn release(&self, mut obj: T) {
        obj.reset();
        if let Some(mut free) = self.free.try_lock() {
            if free.len() < self.capacity {
                free.push(obj);
                return;
            }
        }
        self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Drops every idle object.
    pub fn clear(&self) {
        self.free.lock().clear();
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.free.lock().len(),
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
        }
    }
}

/// The process-wide pools shared by the engine components.
pub struct BufferPools {
    /// Position to block maps, used for positional update batches
    pub position_maps: ObjectPool<ChunkOverlay>,
    /// Unit lists, used as per-viewer drip queues
    pub chunk_lists: ObjectPool<Vec<ChunkUnit>>,
    /// Packed light arrays, used for custom lighting in synthesized columns
    pub light_arrays: ObjectPool<NibbleArray>,
}

impl BufferPools {
    /// Creates the pools with the same capacity each.
    pub fn new(capacity: usize) -> Self {
        Self {
            position_maps: ObjectPool::new(capacity),
            chunk_lists: ObjectPool::new(capacity),
            light_arrays: ObjectPool::new(capacity),
        }
    }

    /// Drops every idle object of every pool.
    pub fn clear(&self) {
        self.position_maps.clear();
        self.chunk_lists.clear();
        self.light_arrays.clear();
    }
}

#[cfg(test)]
mod test {
    use mg_schemas::light::LightLevel;

    use super::*;

    #[test]
    fn released_objects_are_cleared_and_reused() {
        let pool: ObjectPool<Vec<ChunkPos>> = ObjectPool::new(2);
        let mut list = pool.acquire();
        list.push(ChunkPos::new(1, 2));
        pool.release(list);
        let list = pool.acquire();
        assert!(list.is_empty());
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn release_past_capacity_drops() {
        let pool: ObjectPool<NibbleArray> = ObjectPool::new(1);
        let mut a = pool.acquire();
        a.fill(LightLevel::FULL);
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.dropped, 1);
        assert!(pool.acquire().is_dark());
    }

    #[test]
    fn acquire_does_not_block_on_contention() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(4);
        pool.release(vec![1, 2, 3]);
        let _held = pool.free.lock();
        let fresh = pool.acquire();
        assert!(fresh.is_empty());
        pool.release(fresh);
        assert_eq!(pool.dropped.load(AtomicOrdering::Relaxed), 1);
    }
}

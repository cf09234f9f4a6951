//! Concurrency utility types

use std::ops::Deref;

use arc_swap::ArcSwap;

use crate::prelude::*;

/// A cloneable, [`Sync`] handle to a value that is replaced as a whole when updated.
/// Optimized for cheap reads, few writes; every published update bumps a revision number.
pub struct VersionedArc<T> {
    inner: Arc<VersionedArcInner<T>>,
}

struct VersionedArcInner<T> {
    // Holds (revision, inner data)
    swapper: ArcSwap<(u64, T)>,
    updater_mutex: Mutex<()>,
}

impl<T> Clone for VersionedArc<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A consistent snapshot of a [`VersionedArc`] value, cheap to clone and hold onto.
#[derive(Clone)]
pub struct Snapshot<T>(Arc<(u64, T)>);

impl<T> Snapshot<T> {
    /// The revision this snapshot was taken at.
    pub fn revision(&self) -> u64 {
        self.0 .0
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0 .1
    }
}

impl<T: Clone> VersionedArc<T> {
    /// Wraps the initial value at revision 1.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(VersionedArcInner {
                swapper: ArcSwap::new(Arc::new((1, value))),
                updater_mutex: Mutex::new(()),
            }),
        }
    }

    /// Takes a snapshot of the latest published value.
    pub fn load(&self) -> Snapshot<T> {
        Snapshot(self.inner.swapper.load_full())
    }

    /// The latest published revision.
    pub fn revision(&self) -> u64 {
        self.inner.swapper.load().0
    }

    /// Runs `updater` on a copy of the latest value and publishes the copy if it returns `Ok`.
    /// Only one updater runs at a time. Returns the new revision.
    pub fn try_update<E, F: FnOnce(&mut T) -> Result<(), E>>(&self, updater: F) -> Result<u64, E> {
        let _lock = self.inner.updater_mutex.lock();
        let current = self.inner.swapper.load();
        let mut data = T::clone(&current.1);
        let new_revision = current.0.wrapping_add(1);
        drop(current);
        updater(&mut data)?;
        self.inner.swapper.store(Arc::new((new_revision, data)));
        Ok(new_revision)
    }
}

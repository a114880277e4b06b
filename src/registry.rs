//! Exclusive-access registry for volumes and snapshots.
//!
//! The CSI specification states that the orchestrator normally guarantees at
//! most one in-flight call per volume, but MAY lose state and issue multiple
//! simultaneous calls for the same volume. The registry makes the driver safe
//! against that: every mutation first obtains a [`Handle`], which grants
//! exclusive access to one named entity while leaving operations on disjoint
//! names fully concurrent.
//!
//! Each entry carries a latch (an async mutex held across appliance I/O), an
//! atomic reference count, and a lifecycle state
//! (`Creating → Created → Deleted`). A second acquirer that reaches the latch
//! while the entity is not in `Created` observes *aborted: busy* instead of
//! racing the first. Dropping the last handle of an entity that is not in
//! `Created` removes the entry from the map.
//!
//! Lock discipline: the map lock is only ever held to look up or insert an
//! entry and adjust its reference count, never across I/O. Latches are held
//! across I/O and do not observe cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::CsiError;

/// Lifecycle state of a registered entity.
///
/// `Creating` is the entry state; `Created` is the only state in which
/// operations other than create may proceed; `Deleted` is terminal and makes
/// the entry eligible for garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Creating,
    Created,
    Deleted,
}

impl ResourceState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Creating => 0,
            Self::Created => 1,
            Self::Deleted => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Creating,
            1 => Self::Created,
            _ => Self::Deleted,
        }
    }
}

struct Slot<T> {
    name: String,
    latch: Arc<AsyncMutex<()>>,
    refcount: AtomicI32,
    state: AtomicU8,
    data: RwLock<T>,
}

impl<T> Slot<T> {
    fn state(&self) -> ResourceState {
        ResourceState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

struct Entries<T> {
    map: RwLock<HashMap<String, Arc<Slot<T>>>>,
}

/// One registry, keyed by resource name. Cloning yields another view of the
/// same registry.
pub struct Registry<T> {
    entries: Arc<Entries<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Entries {
                map: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entries.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.map.read().is_empty()
    }

    /// Whether an entity with this name is currently registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.map.read().contains_key(name)
    }

    /// Visits every entity without latching it and collects the non-`None`
    /// results. Used by the list operations, which only need a consistent
    /// point-in-time read of each entity.
    pub fn collect<R>(&self, f: impl Fn(ResourceState, &T) -> Option<R>) -> Vec<R> {
        let map = self.entries.map.read();
        map.values()
            .filter_map(|slot| f(slot.state(), &slot.data.read()))
            .collect()
    }

    /// Returns a latched handle for `name`, inserting a fresh entity from
    /// `make` when none is registered.
    ///
    /// A fresh entity starts in `Creating` with its latch already held by the
    /// caller. For an existing entity the caller queues on the latch; once
    /// through, a state other than `Created` means another request owns the
    /// resource's lifecycle and the acquisition fails with *aborted*.
    pub async fn acquire(
        &self,
        name: &str,
        make: impl FnOnce() -> T,
    ) -> Result<Handle<T>, CsiError> {
        let slot = {
            let mut map = self.entries.map.write();
            if let Some(slot) = map.get(name) {
                let slot = Arc::clone(slot);
                slot.refcount.fetch_add(1, Ordering::SeqCst);
                slot
            } else {
                let latch = Arc::new(AsyncMutex::new(()));
                let guard = latch.clone().try_lock_owned().map_err(|_| {
                    CsiError::Internal(format!("fresh latch for ({name}) is contended"))
                })?;
                let slot = Arc::new(Slot {
                    name: name.to_owned(),
                    latch,
                    refcount: AtomicI32::new(1),
                    state: AtomicU8::new(ResourceState::Creating.as_u8()),
                    data: RwLock::new(make()),
                });
                map.insert(name.to_owned(), Arc::clone(&slot));
                return Ok(Handle {
                    slot,
                    entries: Arc::clone(&self.entries),
                    guard: Some(guard),
                });
            }
        };

        // The map lock is gone; wait for the latch and re-inspect the state.
        self.latch_held(slot).await
    }

    /// Returns a latched handle for `name` only if the entity is already
    /// registered. `None` means the caller should fall back to
    /// [`Registry::acquire`] and populate the entity from the appliance.
    pub async fn acquire_if_cached(&self, name: &str) -> Option<Result<Handle<T>, CsiError>> {
        let slot = {
            let map = self.entries.map.read();
            let slot = Arc::clone(map.get(name)?);
            slot.refcount.fetch_add(1, Ordering::SeqCst);
            slot
        };
        Some(self.latch_held(slot).await)
    }

    async fn latch_held(&self, slot: Arc<Slot<T>>) -> Result<Handle<T>, CsiError> {
        let guard = slot.latch.clone().lock_owned().await;
        let handle = Handle {
            slot,
            entries: Arc::clone(&self.entries),
            guard: Some(guard),
        };
        if handle.state() != ResourceState::Created {
            let name = handle.name().to_owned();
            drop(handle);
            return Err(CsiError::Aborted(format!("resource ({name}) is busy")));
        }
        Ok(handle)
    }
}

/// Exclusive access to one registered entity.
///
/// Holding a handle means holding the entity's latch and a non-zero reference
/// count. Dropping it releases both; if the entity is not in `Created` and no
/// other reference remains, the registry entry is removed.
pub struct Handle<T> {
    slot: Arc<Slot<T>>,
    entries: Arc<Entries<T>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<T> Handle<T> {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn state(&self) -> ResourceState {
        self.slot.state()
    }

    pub fn set_state(&self, state: ResourceState) {
        self.slot.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Read access to the entity payload.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, T> {
        self.slot.data.read()
    }

    /// Write access to the entity payload. The latch already serializes
    /// mutators; the inner lock only protects unlatched list readers.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, T> {
        self.slot.data.write()
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        let remaining = self.slot.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.slot.state() != ResourceState::Created {
            // Upgrade to the map write lock, release the latch underneath it,
            // and re-check before removing: another request may have gained a
            // reference since the decrement.
            let mut map = self.entries.map.write();
            drop(self.guard.take());
            if self.slot.refcount.load(Ordering::SeqCst) == 0
                && self.slot.state() != ResourceState::Created
            {
                if let Some(current) = map.get(&self.slot.name) {
                    if Arc::ptr_eq(current, &self.slot) {
                        map.remove(&self.slot.name);
                    }
                }
            }
        } else {
            drop(self.guard.take());
        }
    }
}

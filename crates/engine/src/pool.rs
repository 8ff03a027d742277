//! Fixed-capacity pool of interchangeable resource handles.
//!
//! Acquisition is fail-fast: when every handle is checked out, `acquire`
//! returns [`EngineError::ResourceExhausted`] instead of waiting.
//!
//! Invariant: `free.len() + active.len() == capacity`, and no handle is in
//! both sets.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::EngineError;

/// Opaque identifier for one pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHandle(usize);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct PoolState {
    free: Vec<ResourceHandle>,
    active: HashSet<ResourceHandle>,
}

/// Thread-safe resource pool shared by every run on a backend.
#[derive(Debug)]
pub struct ResourcePool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(capacity: usize) -> Self {
        // Reverse so handles come out as conn-0, conn-1, …
        let free = (0..capacity).rev().map(ResourceHandle).collect();
        Self {
            capacity,
            state: Mutex::new(PoolState {
                free,
                active: HashSet::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handles currently free.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of handles currently checked out.
    pub fn in_use(&self) -> usize {
        self.lock().active.len()
    }

    /// Check out one handle.
    ///
    /// # Errors
    /// [`EngineError::ResourceExhausted`] if no handle is free.
    pub fn acquire(&self) -> Result<ResourceHandle, EngineError> {
        let mut state = self.lock();
        let handle = state.free.pop().ok_or(EngineError::ResourceExhausted {
            capacity: self.capacity,
        })?;
        state.active.insert(handle);
        debug!(%handle, in_use = state.active.len(), "acquired resource");
        Ok(handle)
    }

    /// Return a checked-out handle to the free list.
    ///
    /// # Errors
    /// [`EngineError::UnknownHandle`] if `handle` is not currently checked out.
    pub fn release(&self, handle: ResourceHandle) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.active.remove(&handle) {
            return Err(EngineError::UnknownHandle(handle));
        }
        state.free.push(handle);
        debug!(%handle, in_use = state.active.len(), "released resource");
        Ok(())
    }

    /// Check out a handle that is released when the guard drops.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledResource, EngineError> {
        let handle = self.acquire()?;
        Ok(PooledResource {
            pool: Arc::clone(self),
            handle,
        })
    }

    // The state is consistent after every critical section, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RAII guard over a checked-out handle.
///
/// Releases on drop, including while unwinding from a panicking task body.
#[derive(Debug)]
pub struct PooledResource {
    pool: Arc<ResourcePool>,
    handle: ResourceHandle,
}

impl PooledResource {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }
}

impl Drop for PooledResource {
    fn drop(&mut self) {
        // Only this guard can hand the handle back, so release cannot miss.
        let _ = self.pool.release(self.handle);
    }
}

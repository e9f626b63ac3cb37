//! Check-interval locks
//!
//! The store only needs an opaque acquire/release capability to stop two
//! checkers running the same config at once. [`LockFactory`] is that seam;
//! [`InProcessLocks`] is the implementation used when every checker lives
//! in one process.

use crate::error::StoreResult;
use crate::ids::ResourceConfigId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identity of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockId {
    ResourceConfigChecking(ResourceConfigId),
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceConfigChecking(id) => write!(f, "resource-config-checking:{}", id),
        }
    }
}

/// A held lock
pub trait Lock: Send {
    fn release(&mut self);
}

/// Owns a [`Lock`] and releases it when dropped
pub struct LockGuard {
    inner: Option<Box<dyn Lock>>,
}

impl LockGuard {
    pub fn new(lock: Box<dyn Lock>) -> Self {
        Self { inner: Some(lock) }
    }

    /// Release now rather than at drop
    pub fn release(mut self) {
        if let Some(mut lock) = self.inner.take() {
            lock.release();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(mut lock) = self.inner.take() {
            lock.release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.inner.is_some())
            .finish()
    }
}

/// Acquires locks without blocking
pub trait LockFactory: Send + Sync {
    /// `None` when someone else holds `id`
    fn acquire(&self, id: LockId) -> StoreResult<Option<LockGuard>>;
}

/// Locks shared by every clone within one process
#[derive(Debug, Clone, Default)]
pub struct InProcessLocks {
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl InProcessLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, id: LockId) -> bool {
        self.held.lock().contains(&id)
    }
}

struct InProcessLock {
    id: LockId,
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl Lock for InProcessLock {
    fn release(&mut self) {
        self.held.lock().remove(&self.id);
        debug!("Released lock {}", self.id);
    }
}

impl LockFactory for InProcessLocks {
    fn acquire(&self, id: LockId) -> StoreResult<Option<LockGuard>> {
        if !self.held.lock().insert(id) {
            return Ok(None);
        }
        debug!("Acquired lock {}", id);
        Ok(Some(LockGuard::new(Box::new(InProcessLock {
            id,
            held: Arc::clone(&self.held),
        }))))
    }
}

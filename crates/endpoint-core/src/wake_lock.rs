//! Reference-counted wake lock
//!
//! The device holds one OS wake lock for the whole manager. Every piece of
//! work that must finish before the device sleeps takes the lock under its own
//! [`WakeLockOwner`] token; the OS lock is held while at least one owner is
//! registered. Acquiring twice with the same owner counts once.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::platform::WakeLockHandle;
use crate::session::SessionId;

/// Token identifying who holds the wake lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeLockOwner {
    /// A registration session with a request in flight
    Session(SessionId),
    /// A task queued on the serial executor
    Task(u64),
    /// A delayed connectivity dispatch
    Connectivity(u64),
}

/// Wake lock shared by everything the manager runs
pub struct SipWakeLock {
    handle: Arc<dyn WakeLockHandle>,
    holders: Mutex<HashSet<WakeLockOwner>>,
}

impl SipWakeLock {
    pub fn new(handle: Arc<dyn WakeLockHandle>) -> Self {
        Self {
            handle,
            holders: Mutex::new(HashSet::new()),
        }
    }

    pub fn acquire(&self, owner: WakeLockOwner) {
        let mut holders = self.holders.lock();
        let was_empty = holders.is_empty();
        if holders.insert(owner) && was_empty {
            trace!(?owner, "acquire wake lock");
            self.handle.acquire();
        }
    }

    /// Releasing an owner that does not hold the lock is a no-op
    pub fn release(&self, owner: WakeLockOwner) {
        let mut holders = self.holders.lock();
        if holders.remove(&owner) && holders.is_empty() {
            trace!(?owner, "release wake lock");
            self.handle.release();
        }
    }

    /// Drop every owner; recovers from leaks after a network loss
    pub fn reset(&self) {
        let mut holders = self.holders.lock();
        if !holders.is_empty() {
            debug!(leaked = holders.len(), "reset wake lock");
            holders.clear();
            self.handle.release();
        }
    }

    pub fn is_held(&self) -> bool {
        !self.holders.lock().is_empty()
    }

    pub fn holder_count(&self) -> usize {
        self.holders.lock().len()
    }

    /// Acquire for `owner` and release when the scope is dropped
    pub fn scope(&self, owner: WakeLockOwner) -> WakeLockScope<'_> {
        self.acquire(owner);
        WakeLockScope { lock: self, owner }
    }

    /// Release on drop for an owner that already holds the lock
    pub fn adopt(&self, owner: WakeLockOwner) -> WakeLockScope<'_> {
        WakeLockScope { lock: self, owner }
    }
}

/// Releases its owner's wake lock when dropped, including during unwinding
pub struct WakeLockScope<'a> {
    lock: &'a SipWakeLock,
    owner: WakeLockOwner,
}

impl Drop for WakeLockScope<'_> {
    fn drop(&mut self) {
        self.lock.release(self.owner);
    }
}

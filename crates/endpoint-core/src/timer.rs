//! One-shot wakeup timers
//!
//! The manager schedules every delayed action (registration refresh, backoff
//! retry, debounced connectivity dispatch, WiFi scan) through a
//! [`WakeupTimer`], keyed by a [`TimerToken`]. Setting a token that is already
//! pending replaces it, so there is at most one pending timer per token.
//! Fired callbacks hop onto the manager's serial executor themselves.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::registry::GroupId;

/// What a pending timer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerToken {
    /// Registration refresh or retry of one group
    Registration(GroupId),
    /// Delayed "connected" dispatch
    Connectivity(u64),
    /// Periodic WiFi scan
    WifiScan,
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerToken::Registration(group) => write!(f, "registration/{}", group),
            TimerToken::Connectivity(id) => write!(f, "connectivity/{}", id),
            TimerToken::WifiScan => write!(f, "wifi-scan"),
        }
    }
}

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedule/cancel-by-token service
pub trait WakeupTimer: Send + Sync {
    /// Run `callback` once after `delay`, replacing any pending timer for `token`
    fn set(&self, delay: Duration, token: TimerToken, callback: TimerCallback);

    /// Forget the pending timer for `token`, if any
    fn cancel(&self, token: &TimerToken);
}

/// [`WakeupTimer`] backed by tokio sleeps on a runtime handle
pub struct TokioWakeupTimer {
    runtime: Handle,
    pending: Arc<Mutex<HashMap<TimerToken, (u64, AbortHandle)>>>,
    next_generation: AtomicU64,
}

impl TokioWakeupTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Timer on the runtime of the calling thread
    ///
    /// Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl WakeupTimer for TokioWakeupTimer {
    fn set(&self, delay: Duration, token: TimerToken, callback: TimerCallback) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        // Holding the map lock across spawn keeps a zero delay from firing
        // before its own entry is recorded.
        let mut map = self.pending.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut map = pending.lock();
                match map.get(&token) {
                    Some((g, _)) if *g == generation => {
                        map.remove(&token);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                trace!(%token, "timer fired");
                callback();
            }
        });
        if let Some((_, previous)) = map.insert(token, (generation, task.abort_handle())) {
            previous.abort();
        }
    }

    fn cancel(&self, token: &TimerToken) {
        if let Some((_, task)) = self.pending.lock().remove(token) {
            trace!(%token, "timer cancelled");
            task.abort();
        }
    }
}

impl Drop for TokioWakeupTimer {
    fn drop(&mut self) {
        for (_, (_, task)) in self.pending.lock().drain() {
            task.abort();
        }
    }
}

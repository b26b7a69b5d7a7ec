//! Connectivity notifications
//!
//! Raw platform events are filtered by [`classify`] and then debounced:
//! good news is held back for a short while so the interim transitions of a
//! network coming up are skipped, bad news goes through at once and cancels a
//! pending "connected" of the same network.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind of network an event is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    Wifi,
    Mobile,
    Ethernet,
    Other(String),
}

impl NetworkType {
    pub fn is_wifi(&self) -> bool {
        matches!(self, NetworkType::Wifi)
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Wifi => write!(f, "WIFI"),
            NetworkType::Mobile => write!(f, "MOBILE"),
            NetworkType::Ethernet => write!(f, "ETHERNET"),
            NetworkType::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Link state carried by a platform event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkState {
    Connecting,
    Connected,
    Suspended,
    Disconnecting,
    Disconnected,
    Unknown,
}

/// A connectivity notification as delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub network: NetworkType,
    pub state: NetworkState,
    /// Network the platform currently routes through, if any
    pub active: Option<NetworkType>,
}

impl NetworkEvent {
    pub fn connected(network: NetworkType) -> Self {
        Self {
            active: Some(network.clone()),
            network,
            state: NetworkState::Connected,
        }
    }

    pub fn disconnected(network: NetworkType) -> Self {
        Self {
            network,
            state: NetworkState::Disconnected,
            active: None,
        }
    }

    pub fn with_active(mut self, active: Option<NetworkType>) -> Self {
        self.active = active;
        self
    }
}

/// Reduce an event to `(network, connected)`, or `None` when it is ignored
pub fn classify(event: &NetworkEvent, wifi_only: bool) -> Option<(NetworkType, bool)> {
    if wifi_only && !event.network.is_wifi() {
        debug!(network = %event.network, "wifi only, other connectivity ignored");
        return None;
    }
    match event.state {
        NetworkState::Connected => {
            if let Some(active) = &event.active {
                if *active != event.network {
                    debug!(network = %event.network, %active, "ignore connect event");
                    return None;
                }
            }
            Some((event.network.clone(), true))
        }
        NetworkState::Disconnected => Some((event.network.clone(), false)),
        state => {
            debug!(network = %event.network, ?state, "connectivity alert not processed");
            None
        }
    }
}

#[derive(Debug)]
struct PendingDispatch {
    id: u64,
    network: NetworkType,
}

/// Tracks the single pending delayed "connected" dispatch
///
/// Ids are handed out per dispatch; the caller owns the matching timer and
/// wake-lock tokens and releases them for every id this type reports as
/// cancelled or fired.
#[derive(Debug, Default)]
pub(crate) struct ConnectivityDebouncer {
    pending: Option<PendingDispatch>,
    next_id: u64,
}

impl ConnectivityDebouncer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace any pending dispatch with one for `network`; returns the
    /// cancelled id and the new one
    pub(crate) fn schedule(&mut self, network: NetworkType) -> (Option<u64>, u64) {
        self.next_id += 1;
        let id = self.next_id;
        let cancelled = self.pending.replace(PendingDispatch { id, network }).map(|p| p.id);
        (cancelled, id)
    }

    /// Cancel the pending dispatch if it is for `network`
    pub(crate) fn cancel_for(&mut self, network: &NetworkType) -> Option<u64> {
        match &self.pending {
            Some(p) if p.network == *network => self.pending.take().map(|p| p.id),
            _ => None,
        }
    }

    /// Claim dispatch `id` when it fires; `None` if it was superseded
    pub(crate) fn take_if_current(&mut self, id: u64) -> Option<NetworkType> {
        match &self.pending {
            Some(p) if p.id == id => self.pending.take().map(|p| p.network),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_id(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.id)
    }
}

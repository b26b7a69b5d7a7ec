//! Open profiles and their session groups
//!
//! The registry maps a profile URI to exactly one active [`GroupEntry`]. An
//! entry displaced by a restart is parked as *inactive* until its replacement
//! has settled; at most one inactive entry exists per URI. Inbound sessions
//! waiting for the application are kept in a pending table keyed by call id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::events::IncomingCallTarget;
use crate::profile::{CallerId, SipProfile};
use crate::registration::{AutoRegistration, RegistrationEnv};
use crate::session::{SessionState, SipSession, SipSessionGroup};

/// Identity of one incarnation of a profile's group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Everything the manager keeps for one open profile
pub(crate) struct GroupEntry {
    pub(crate) id: GroupId,
    /// Redacted, stamped with the creator
    pub(crate) profile: SipProfile,
    pub(crate) group: Arc<dyn SipSessionGroup>,
    pub(crate) registration: AutoRegistration,
    pub(crate) opened_to_receive_calls: bool,
    pub(crate) incoming_target: Option<Arc<dyn IncomingCallTarget>>,
}

impl GroupEntry {
    pub(crate) fn new(id: GroupId, profile: SipProfile, group: Arc<dyn SipSessionGroup>) -> Self {
        let registration = AutoRegistration::new(id, profile.uri());
        Self {
            id,
            profile,
            group,
            registration,
            opened_to_receive_calls: false,
            incoming_target: None,
        }
    }

    pub(crate) fn uri(&self) -> String {
        self.profile.uri()
    }

    pub(crate) fn creator(&self) -> Option<CallerId> {
        self.profile.calling_uid()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registration.is_registered()
    }

    /// Close the group for good
    pub(crate) fn close(&mut self, env: &dyn RegistrationEnv) {
        self.opened_to_receive_calls = false;
        self.group.close();
        self.registration.stop(env);
        debug!(profile = %self.profile, group = %self.id, "group closed");
    }
}

struct PendingSession {
    session: Arc<dyn SipSession>,
    group: GroupId,
    creator: Option<CallerId>,
}

/// Where an entry was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Active,
    Inactive,
}

#[derive(Default)]
pub(crate) struct ProfileRegistry {
    /// Active entries in the order they were opened
    active: Vec<GroupEntry>,
    inactive: HashMap<String, GroupEntry>,
    pending: HashMap<String, PendingSession>,
    next_group: u64,
}

impl ProfileRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_group_id(&mut self) -> GroupId {
        self.next_group += 1;
        GroupId(self.next_group)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn get(&self, uri: &str) -> Option<&GroupEntry> {
        self.active.iter().find(|e| e.profile.uri() == uri)
    }

    pub(crate) fn get_mut(&mut self, uri: &str) -> Option<&mut GroupEntry> {
        self.active.iter_mut().find(|e| e.profile.uri() == uri)
    }

    pub(crate) fn inactive_mut(&mut self, uri: &str) -> Option<&mut GroupEntry> {
        self.inactive.get_mut(uri)
    }

    #[cfg(test)]
    pub(crate) fn has_inactive(&self, uri: &str) -> bool {
        self.inactive.contains_key(uri)
    }

    /// Look up an entry by id among active, then inactive entries
    pub(crate) fn by_id_mut(&mut self, id: GroupId) -> Option<(&mut GroupEntry, Slot)> {
        if let Some(entry) = self.active.iter_mut().find(|e| e.id == id) {
            return Some((entry, Slot::Active));
        }
        self.inactive
            .values_mut()
            .find(|e| e.id == id)
            .map(|e| (e, Slot::Inactive))
    }

    pub(crate) fn by_id(&self, id: GroupId) -> Option<&GroupEntry> {
        self.active
            .iter()
            .chain(self.inactive.values())
            .find(|e| e.id == id)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &GroupEntry> {
        self.active.iter()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut GroupEntry> {
        self.active.iter_mut()
    }

    /// Add a new active entry; the URI must not be active yet
    pub(crate) fn insert(&mut self, entry: GroupEntry) {
        debug_assert!(self.get(&entry.uri()).is_none());
        trace!(profile = %entry.profile, group = %entry.id, "add group");
        self.active.push(entry);
    }

    pub(crate) fn remove(&mut self, uri: &str) -> Option<GroupEntry> {
        let index = self.active.iter().position(|e| e.profile.uri() == uri)?;
        Some(self.active.remove(index))
    }

    pub(crate) fn take_inactive(&mut self, uri: &str) -> Option<GroupEntry> {
        self.inactive.remove(uri)
    }

    pub(crate) fn drain_inactive(&mut self) -> Vec<GroupEntry> {
        self.inactive.drain().map(|(_, e)| e).collect()
    }

    /// Move the active entry for `uri` out of the way of a replacement
    ///
    /// When an inactive entry already waits for `uri`, the active one has never
    /// settled and is handed back to be destroyed. Otherwise it becomes the
    /// inactive entry and `None` is returned.
    pub(crate) fn retire_active(&mut self, uri: &str) -> Option<GroupEntry> {
        let entry = self.remove(uri)?;
        if self.inactive.contains_key(uri) {
            debug!(profile = %uri, group = %entry.id, "replacing unsettled group");
            Some(entry)
        } else {
            debug!(profile = %uri, group = %entry.id, "group becomes inactive");
            self.inactive.insert(uri.to_string(), entry);
            None
        }
    }

    /// Whether `caller` may use `entry`
    pub(crate) fn is_authorized(entry: &GroupEntry, caller: CallerId, privileged: CallerId) -> bool {
        caller == privileged || entry.creator() == Some(caller)
    }

    /// Profiles `caller` may see
    pub(crate) fn list(&self, caller: CallerId, privileged: CallerId) -> Vec<SipProfile> {
        self.active
            .iter()
            .filter(|e| Self::is_authorized(e, caller, privileged))
            .map(|e| e.profile.clone())
            .collect()
    }

    pub(crate) fn any_opened_to_receive_calls(&self) -> bool {
        self.active.iter().any(|e| e.opened_to_receive_calls)
    }

    /// A call ringing on `ringing` that another local group also holds
    pub(crate) fn calling_self(&self, ringing: GroupId, call_id: &str) -> bool {
        let found = self
            .active
            .iter()
            .find(|e| e.id != ringing && e.group.contains_session(call_id));
        if let Some(entry) = found {
            debug!(call_id, profile = %entry.profile, "call to self");
            return true;
        }
        false
    }

    /// Keep `session` until the application picks it up
    pub(crate) fn add_pending(
        &mut self,
        call_id: String,
        session: Arc<dyn SipSession>,
        group: GroupId,
        creator: Option<CallerId>,
    ) {
        self.pending
            .retain(|_, p| p.session.state() == SessionState::IncomingCall);
        let pending = PendingSession {
            session,
            group,
            creator,
        };
        self.pending.insert(call_id, pending);
        trace!(pending = self.pending.len(), "pending sessions");
    }

    /// A pending session and the creator of the profile it rang on
    pub(crate) fn pending(&self, call_id: &str) -> Option<(Arc<dyn SipSession>, Option<CallerId>)> {
        self.pending
            .get(call_id)
            .map(|p| (p.session.clone(), p.creator))
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending sessions of a group that is gone
    pub(crate) fn forget_pending_of(&mut self, group: GroupId) {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.group != group);
        if self.pending.len() != before {
            warn!(%group, dropped = before - self.pending.len(), "pending sessions of closed group dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EndpointResult;
    use crate::session::{KeepAliveCallback, SessionId, SessionListener};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::net::IpAddr;

    struct StubGroup {
        profile: SipProfile,
        calls: HashSet<String>,
    }

    impl SipSessionGroup for StubGroup {
        fn local_profile(&self) -> SipProfile {
            self.profile.clone()
        }
        fn create_session(&self, _: Option<Arc<dyn SessionListener>>) -> Option<Arc<dyn SipSession>> {
            None
        }
        fn open_to_receive_calls(&self, _: Arc<dyn SessionListener>) -> EndpointResult<()> {
            Ok(())
        }
        fn on_connectivity_changed(&self) {}
        fn reset(&self, _: Option<IpAddr>) -> EndpointResult<()> {
            Ok(())
        }
        fn close(&self) {}
        fn contains_session(&self, call_id: &str) -> bool {
            self.calls.contains(call_id)
        }
    }

    struct StubSession {
        id: SessionId,
        state: Mutex<SessionState>,
    }

    impl SipSession for StubSession {
        fn id(&self) -> SessionId {
            self.id
        }
        fn call_id(&self) -> Option<String> {
            None
        }
        fn state(&self) -> SessionState {
            *self.state.lock()
        }
        fn local_profile(&self) -> SipProfile {
            SipProfile::new("x", "example.com")
        }
        fn set_listener(&self, _: Option<Arc<dyn SessionListener>>) {}
        fn register(&self, _: u32) {}
        fn unregister(&self) {}
        fn end_call(&self) {}
        fn start_keep_alive(&self, _: u32, _: Arc<dyn KeepAliveCallback>) -> EndpointResult<()> {
            Ok(())
        }
        fn stop_keep_alive(&self) {}
        fn duplicate(&self) -> Arc<dyn SipSession> {
            unreachable!()
        }
    }

    fn entry(registry: &mut ProfileRegistry, user: &str, creator: u32, calls: &[&str]) -> GroupEntry {
        let mut profile = SipProfile::new(user, "example.com");
        profile.set_calling_uid(CallerId(creator));
        let group = Arc::new(StubGroup {
            profile: profile.clone(),
            calls: calls.iter().map(|c| c.to_string()).collect(),
        });
        GroupEntry::new(registry.next_group_id(), profile, group)
    }

    const PHONE: CallerId = CallerId(1001);

    #[test]
    fn entries_keep_registration_order() {
        let mut registry = ProfileRegistry::new();
        for user in ["carol", "alice", "bob"] {
            let e = entry(&mut registry, user, 10_001, &[]);
            registry.insert(e);
        }
        let users: Vec<_> = registry.entries().map(|e| e.profile.user_name().to_string()).collect();
        assert_eq!(users, vec!["carol", "alice", "bob"]);
        registry.remove("sip:alice@example.com");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn authorization_is_creator_or_privileged() {
        let mut registry = ProfileRegistry::new();
        let e = entry(&mut registry, "alice", 10_001, &[]);
        assert!(ProfileRegistry::is_authorized(&e, CallerId(10_001), PHONE));
        assert!(ProfileRegistry::is_authorized(&e, PHONE, PHONE));
        assert!(!ProfileRegistry::is_authorized(&e, CallerId(10_002), PHONE));
    }

    #[test]
    fn list_filters_by_caller() {
        let mut registry = ProfileRegistry::new();
        let a = entry(&mut registry, "alice", 10_001, &[]);
        let b = entry(&mut registry, "bob", 10_002, &[]);
        registry.insert(a);
        registry.insert(b);
        assert_eq!(registry.list(CallerId(10_001), PHONE).len(), 1);
        assert_eq!(registry.list(PHONE, PHONE).len(), 2);
        assert!(registry.list(CallerId(7), PHONE).is_empty());
    }

    #[test]
    fn retire_keeps_at_most_one_inactive_entry() {
        let mut registry = ProfileRegistry::new();
        let uri = "sip:alice@example.com";
        let first = entry(&mut registry, "alice", 10_001, &[]);
        let first_id = first.id;
        registry.insert(first);

        assert!(registry.retire_active(uri).is_none());
        assert!(registry.has_inactive(uri));
        let second = entry(&mut registry, "alice", 10_001, &[]);
        let second_id = second.id;
        registry.insert(second);

        let destroyed = registry.retire_active(uri).map(|e| e.id);
        assert_eq!(destroyed, Some(second_id));
        assert_eq!(registry.inactive_mut(uri).map(|e| e.id), Some(first_id));
        assert!(registry.get(uri).is_none());
    }

    #[test]
    fn lookup_by_id_reports_slot() {
        let mut registry = ProfileRegistry::new();
        let e = entry(&mut registry, "alice", 10_001, &[]);
        let id = e.id;
        registry.insert(e);
        assert_eq!(registry.by_id_mut(id).map(|(_, s)| s), Some(Slot::Active));
        registry.retire_active("sip:alice@example.com");
        assert_eq!(registry.by_id_mut(id).map(|(_, s)| s), Some(Slot::Inactive));
        assert!(registry.by_id(GroupId(99)).is_none());
    }

    #[test]
    fn calling_self_looks_at_other_groups_only() {
        let mut registry = ProfileRegistry::new();
        let a = entry(&mut registry, "alice", 10_001, &["call-1"]);
        let b = entry(&mut registry, "bob", 10_001, &[]);
        let (a_id, b_id) = (a.id, b.id);
        registry.insert(a);
        registry.insert(b);
        assert!(registry.calling_self(b_id, "call-1"));
        assert!(!registry.calling_self(a_id, "call-1"));
        assert!(!registry.calling_self(b_id, "call-2"));
    }

    #[test]
    fn pending_table_prunes_answered_sessions() {
        let mut registry = ProfileRegistry::new();
        let owner = entry(&mut registry, "alice", 10_001, &[]);
        let ringing = Arc::new(StubSession {
            id: SessionId::new(),
            state: Mutex::new(SessionState::IncomingCall),
        });
        registry.add_pending("call-1".into(), ringing.clone(), owner.id, owner.creator());
        *ringing.state.lock() = SessionState::InCall;

        let next = Arc::new(StubSession {
            id: SessionId::new(),
            state: Mutex::new(SessionState::IncomingCall),
        });
        registry.add_pending("call-2".into(), next, owner.id, owner.creator());
        assert_eq!(registry.pending_count(), 1);
        assert!(registry.pending("call-1").is_none());
        assert_eq!(
            registry.pending("call-2").and_then(|(_, creator)| creator),
            Some(CallerId(10_001))
        );

        registry.forget_pending_of(owner.id);
        assert_eq!(registry.pending_count(), 0);
    }
}

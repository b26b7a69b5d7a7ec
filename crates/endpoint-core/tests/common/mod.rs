//! Fakes for the collaborators of the endpoint manager
//!
//! Every fake only records what it is asked to do; none of them calls back
//! into the manager from inside a call. Tests inject session-layer events
//! from the test thread instead.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use rvoip_endpoint_core::timer::TimerCallback;
use rvoip_endpoint_core::{
    Broadcaster, CallerId, EndpointBroadcast, EndpointConfig, EndpointError, EndpointManager,
    EndpointResult, IncomingCall, IncomingCallTarget, KeepAliveCallback, LocalAddressResolver,
    NetworkType, Platform, ReceiverControl, RegistrationListener, SessionGroupFactory, SessionId,
    SessionListener, SessionState, SipErrorCode, SipProfile, SipSession, SipSessionGroup,
    TimerToken, WakeLockHandle, WakeupTimer, WifiControl,
};

pub const APP: CallerId = CallerId(10_001);
pub const OTHER_APP: CallerId = CallerId(10_002);
pub const PHONE: CallerId = CallerId(1001);

pub const PUBLIC_IP: &str = "203.0.113.5";
pub const PRIVATE_IP: &str = "192.168.1.23";

pub fn alice() -> SipProfile {
    SipProfile::new("alice", "example.com").with_password("wonderland")
}

pub fn bob() -> SipProfile {
    SipProfile::new("bob", "example.com").with_password("builder")
}

/// What a fake session was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Register(u32),
    Unregister,
    EndCall,
    StartKeepAlive(u32),
    StopKeepAlive,
}

pub struct FakeSession {
    id: SessionId,
    call_id: Option<String>,
    profile: SipProfile,
    state: Mutex<SessionState>,
    listener: Mutex<Option<Arc<dyn SessionListener>>>,
    last_sink: Mutex<Option<Arc<dyn SessionListener>>>,
    keep_alive: Mutex<Option<Arc<dyn KeepAliveCallback>>>,
    last_keep_alive: Mutex<Option<Arc<dyn KeepAliveCallback>>>,
    calls: Mutex<Vec<SessionCall>>,
    duplicates: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSession {
    pub fn new(profile: SipProfile, call_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            call_id,
            profile,
            state: Mutex::new(SessionState::ReadyToCall),
            listener: Mutex::new(None),
            last_sink: Mutex::new(None),
            keep_alive: Mutex::new(None),
            last_keep_alive: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            duplicates: Mutex::new(Vec::new()),
        })
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn SipSession> {
        self.clone()
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &SessionCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn registers(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SessionCall::Register(_)))
            .count()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// The last sink ever bound, even if it was cleared since
    pub fn last_sink(&self) -> Option<Arc<dyn SessionListener>> {
        self.last_sink.lock().clone()
    }

    pub fn duplicates(&self) -> Vec<Arc<FakeSession>> {
        self.duplicates.lock().clone()
    }

    fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.lock().clone()
    }

    pub fn registering(self: &Arc<Self>) {
        self.set_state(SessionState::Registering);
        if let Some(l) = self.listener() {
            l.on_registering(&self.as_dyn());
        }
    }

    pub fn done(self: &Arc<Self>, duration: u32) {
        self.set_state(SessionState::ReadyToCall);
        if let Some(l) = self.listener() {
            l.on_registration_done(&self.as_dyn(), duration);
        }
    }

    pub fn failed(self: &Arc<Self>, code: SipErrorCode, message: &str) {
        self.set_state(SessionState::ReadyToCall);
        if let Some(l) = self.listener() {
            l.on_registration_failed(&self.as_dyn(), code, message);
        }
    }

    pub fn timeout(self: &Arc<Self>) {
        self.set_state(SessionState::ReadyToCall);
        if let Some(l) = self.listener() {
            l.on_registration_timeout(&self.as_dyn());
        }
    }

    /// Answer a keep-alive on whatever callback is running
    pub fn keep_alive_response(&self, port_changed: bool) {
        let callback = self.keep_alive.lock().clone();
        if let Some(cb) = callback {
            cb.on_response(port_changed);
        }
    }

    /// Answer on the last callback ever given, even after the keep-alive stopped
    pub fn late_keep_alive_response(&self, port_changed: bool) {
        let callback = self.last_keep_alive.lock().clone();
        if let Some(cb) = callback {
            cb.on_response(port_changed);
        }
    }

    pub fn keep_alive_running(&self) -> bool {
        self.keep_alive.lock().is_some()
    }
}

impl SipSession for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn call_id(&self) -> Option<String> {
        self.call_id.clone()
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn local_profile(&self) -> SipProfile {
        self.profile.clone()
    }

    fn set_listener(&self, listener: Option<Arc<dyn SessionListener>>) {
        if let Some(l) = &listener {
            *self.last_sink.lock() = Some(l.clone());
        }
        *self.listener.lock() = listener;
    }

    fn register(&self, expiry_secs: u32) {
        self.calls.lock().push(SessionCall::Register(expiry_secs));
    }

    fn unregister(&self) {
        self.calls.lock().push(SessionCall::Unregister);
    }

    fn end_call(&self) {
        self.calls.lock().push(SessionCall::EndCall);
        self.set_state(SessionState::ReadyToCall);
    }

    fn start_keep_alive(&self, interval_secs: u32, callback: Arc<dyn KeepAliveCallback>) -> EndpointResult<()> {
        self.calls.lock().push(SessionCall::StartKeepAlive(interval_secs));
        *self.last_keep_alive.lock() = Some(callback.clone());
        *self.keep_alive.lock() = Some(callback);
        Ok(())
    }

    fn stop_keep_alive(&self) {
        self.calls.lock().push(SessionCall::StopKeepAlive);
        *self.keep_alive.lock() = None;
    }

    fn duplicate(&self) -> Arc<dyn SipSession> {
        let copy = FakeSession::new(self.profile.clone(), None);
        self.duplicates.lock().push(copy.clone());
        copy
    }
}

pub struct FakeGroup {
    pub local_ip: Option<IpAddr>,
    pub password: String,
    profile: SipProfile,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    receiver: Mutex<Option<Arc<dyn SessionListener>>>,
    call_ids: Mutex<HashSet<String>>,
    no_session: AtomicBool,
    closes: AtomicUsize,
    opens: AtomicUsize,
    connectivity_changes: AtomicUsize,
    resets: Mutex<Vec<Option<IpAddr>>>,
    reset_failures: Mutex<VecDeque<EndpointError>>,
}

impl FakeGroup {
    fn new(local_ip: Option<IpAddr>, profile: SipProfile, password: &str) -> Arc<Self> {
        Arc::new(Self {
            local_ip,
            password: password.to_string(),
            profile,
            sessions: Mutex::new(Vec::new()),
            receiver: Mutex::new(None),
            call_ids: Mutex::new(HashSet::new()),
            no_session: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            connectivity_changes: AtomicUsize::new(0),
            resets: Mutex::new(Vec::new()),
            reset_failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn profile(&self) -> SipProfile {
        self.profile.clone()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.sessions.lock().last().cloned().expect("no session created")
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn connectivity_changes(&self) -> usize {
        self.connectivity_changes.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> Vec<Option<IpAddr>> {
        self.resets.lock().clone()
    }

    pub fn fail_next_reset(&self, error: EndpointError) {
        self.reset_failures.lock().push_back(error);
    }

    pub fn refuse_sessions(&self, refuse: bool) {
        self.no_session.store(refuse, Ordering::SeqCst);
    }

    pub fn hold_call(&self, call_id: &str) {
        self.call_ids.lock().insert(call_id.to_string());
    }

    /// Deliver an inbound INVITE to whoever opened the group for calls
    pub fn ring(&self, call_id: &str, caller: &SipProfile, sdp: &str) -> Arc<FakeSession> {
        let session = FakeSession::new(self.profile.clone(), Some(call_id.to_string()));
        session.set_state(SessionState::IncomingCall);
        self.hold_call(call_id);
        let receiver = self.receiver.lock().clone();
        if let Some(r) = receiver {
            r.on_ringing(&session.as_dyn(), caller, sdp);
        }
        session
    }
}

impl SipSessionGroup for FakeGroup {
    fn local_profile(&self) -> SipProfile {
        self.profile.clone()
    }

    fn create_session(&self, listener: Option<Arc<dyn SessionListener>>) -> Option<Arc<dyn SipSession>> {
        if self.no_session.load(Ordering::SeqCst) {
            return None;
        }
        let session = FakeSession::new(self.profile.clone(), None);
        session.set_listener(listener);
        self.sessions.lock().push(session.clone());
        Some(session)
    }

    fn open_to_receive_calls(&self, listener: Arc<dyn SessionListener>) -> EndpointResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.receiver.lock() = Some(listener);
        Ok(())
    }

    fn on_connectivity_changed(&self) {
        self.connectivity_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self, local_ip: Option<IpAddr>) -> EndpointResult<()> {
        self.resets.lock().push(local_ip);
        match self.reset_failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn contains_session(&self, call_id: &str) -> bool {
        self.call_ids.lock().contains(call_id)
    }
}

#[derive(Default)]
pub struct FakeSessionGroupFactory {
    groups: Mutex<Vec<Arc<FakeGroup>>>,
    attempts: Mutex<Vec<Option<IpAddr>>>,
    failures: Mutex<VecDeque<EndpointError>>,
}

impl FakeSessionGroupFactory {
    pub fn fail_next(&self, error: EndpointError) {
        self.failures.lock().push_back(error);
    }

    pub fn groups(&self) -> Vec<Arc<FakeGroup>> {
        self.groups.lock().clone()
    }

    pub fn groups_for(&self, uri: &str) -> Vec<Arc<FakeGroup>> {
        self.groups
            .lock()
            .iter()
            .filter(|g| g.profile.uri() == uri)
            .cloned()
            .collect()
    }

    pub fn last_group(&self, uri: &str) -> Arc<FakeGroup> {
        self.groups_for(uri).pop().expect("no group for uri")
    }

    /// Local address of every creation attempt, failed ones included
    pub fn attempts(&self) -> Vec<Option<IpAddr>> {
        self.attempts.lock().clone()
    }
}

impl SessionGroupFactory for FakeSessionGroupFactory {
    fn create_group(
        &self,
        local_ip: Option<IpAddr>,
        profile: SipProfile,
        password: &str,
    ) -> EndpointResult<Arc<dyn SipSessionGroup>> {
        self.attempts.lock().push(local_ip);
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        let group = FakeGroup::new(local_ip, profile, password);
        self.groups.lock().push(group.clone());
        Ok(group)
    }
}

/// Timer that only fires when told to
#[derive(Default)]
pub struct FakeTimer {
    pending: Mutex<HashMap<TimerToken, (Duration, TimerCallback)>>,
    log: Mutex<Vec<(TimerToken, Duration)>>,
}

impl FakeTimer {
    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.pending.lock().contains_key(&token)
    }

    pub fn pending_delay(&self, token: TimerToken) -> Option<Duration> {
        self.pending.lock().get(&token).map(|(d, _)| *d)
    }

    /// Run the callback of `token`; false if nothing was pending
    pub fn fire(&self, token: TimerToken) -> bool {
        let entry = self.pending.lock().remove(&token);
        match entry {
            Some((_, callback)) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Every delay ever set for registration timers, in seconds
    pub fn registration_delays(&self) -> Vec<u64> {
        self.log
            .lock()
            .iter()
            .filter(|(t, _)| matches!(t, TimerToken::Registration(_)))
            .map(|(_, d)| d.as_secs())
            .collect()
    }

    pub fn pending_registration(&self) -> Option<TimerToken> {
        self.pending
            .lock()
            .keys()
            .copied()
            .find(|t| matches!(t, TimerToken::Registration(_)))
    }

    pub fn pending_connectivity(&self) -> Option<TimerToken> {
        self.pending
            .lock()
            .keys()
            .copied()
            .find(|t| matches!(t, TimerToken::Connectivity(_)))
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl WakeupTimer for FakeTimer {
    fn set(&self, delay: Duration, token: TimerToken, callback: TimerCallback) {
        self.log.lock().push((token, delay));
        self.pending.lock().insert(token, (delay, callback));
    }

    fn cancel(&self, token: &TimerToken) {
        self.pending.lock().remove(token);
    }
}

#[derive(Default)]
pub struct FakeWakeLock {
    acquires: AtomicUsize,
    releases: AtomicUsize,
}

impl FakeWakeLock {
    pub fn held(&self) -> bool {
        self.acquires.load(Ordering::SeqCst) > self.releases.load(Ordering::SeqCst)
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }
}

impl WakeLockHandle for FakeWakeLock {
    fn acquire(&self) {
        self.acquires.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeWifi {
    held: AtomicBool,
    acquires: AtomicUsize,
    scans: AtomicUsize,
}

impl FakeWifi {
    pub fn lock_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl WifiControl for FakeWifi {
    fn acquire_wifi_lock(&self) {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
    }

    fn release_wifi_lock(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    fn start_scan(&self) {
        self.scans.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeReceivers {
    registered: AtomicBool,
    registrations: AtomicUsize,
}

impl FakeReceivers {
    pub fn registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl ReceiverControl for FakeReceivers {
    fn register_receivers(&self) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.registered.store(true, Ordering::SeqCst);
    }

    fn unregister_receivers(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeBroadcaster {
    events: Mutex<Vec<EndpointBroadcast>>,
}

impl FakeBroadcaster {
    pub fn events(&self) -> Vec<EndpointBroadcast> {
        self.events.lock().clone()
    }
}

impl Broadcaster for FakeBroadcaster {
    fn broadcast(&self, event: EndpointBroadcast) {
        self.events.lock().push(event);
    }
}

pub struct FixedAddress {
    address: Mutex<Option<IpAddr>>,
}

impl FixedAddress {
    pub fn new(address: &str) -> Self {
        Self {
            address: Mutex::new(address.parse().ok()),
        }
    }

    pub fn set(&self, address: Option<&str>) {
        *self.address.lock() = address.and_then(|a| a.parse().ok());
    }
}

impl LocalAddressResolver for FixedAddress {
    fn local_ip(&self) -> Option<IpAddr> {
        *self.address.lock()
    }
}

/// What a registration listener heard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heard {
    Registering,
    Done(u32),
    Failed(SipErrorCode, String),
    Timeout,
}

#[derive(Default)]
pub struct RecordingListener {
    heard: Mutex<Vec<Heard>>,
}

impl RecordingListener {
    pub fn heard(&self) -> Vec<Heard> {
        self.heard.lock().clone()
    }

    pub fn last(&self) -> Option<Heard> {
        self.heard.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.heard.lock().clear();
    }
}

impl RegistrationListener for RecordingListener {
    fn on_registering(&self, _uri: &str) {
        self.heard.lock().push(Heard::Registering);
    }

    fn on_registration_done(&self, _uri: &str, duration: u32) {
        self.heard.lock().push(Heard::Done(duration));
    }

    fn on_registration_failed(&self, _uri: &str, code: SipErrorCode, message: &str) {
        self.heard.lock().push(Heard::Failed(code, message.to_string()));
    }

    fn on_registration_timeout(&self, _uri: &str) {
        self.heard.lock().push(Heard::Timeout);
    }
}

#[derive(Default)]
pub struct RecordingTarget {
    calls: Mutex<Vec<IncomingCall>>,
    canceled: AtomicBool,
}

impl RecordingTarget {
    pub fn calls(&self) -> Vec<IncomingCall> {
        self.calls.lock().clone()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

impl IncomingCallTarget for RecordingTarget {
    fn send(&self, call: IncomingCall) -> EndpointResult<()> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(EndpointError::TargetCanceled {
                message: "application gone".to_string(),
            });
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

/// A manager wired to fakes
pub struct Harness {
    pub manager: Arc<EndpointManager>,
    pub factory: Arc<FakeSessionGroupFactory>,
    pub timer: Arc<FakeTimer>,
    pub wake_lock: Arc<FakeWakeLock>,
    pub wifi: Arc<FakeWifi>,
    pub receivers: Arc<FakeReceivers>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub address: Arc<FixedAddress>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EndpointConfig::default())
    }

    pub fn with_config(config: EndpointConfig) -> Self {
        let factory = Arc::new(FakeSessionGroupFactory::default());
        let timer = Arc::new(FakeTimer::default());
        let wake_lock = Arc::new(FakeWakeLock::default());
        let wifi = Arc::new(FakeWifi::default());
        let receivers = Arc::new(FakeReceivers::default());
        let broadcaster = Arc::new(FakeBroadcaster::default());
        let address = Arc::new(FixedAddress::new(PUBLIC_IP));
        let platform = Platform {
            session_groups: factory.clone(),
            timer: timer.clone(),
            wake_lock: wake_lock.clone(),
            wifi: wifi.clone(),
            receivers: receivers.clone(),
            broadcaster: broadcaster.clone(),
            local_address: address.clone(),
        };
        let manager = Arc::new(EndpointManager::new(config, platform).expect("manager"));
        Self {
            manager,
            factory,
            timer,
            wake_lock,
            wifi,
            receivers,
            broadcaster,
            address,
        }
    }

    pub fn connect(&self, network: NetworkType) {
        self.manager.on_connectivity_changed(network, true);
    }

    pub fn disconnect(&self, network: NetworkType) {
        self.manager.on_connectivity_changed(network, false);
    }

    /// Fire a timer and wait until its executor task has run
    pub fn fire(&self, token: TimerToken) -> bool {
        let fired = self.timer.fire(token);
        self.manager.flush();
        fired
    }

    /// Open `profile` for incoming calls as `caller` and return its group
    pub fn open_receiving(
        &self,
        caller: CallerId,
        profile: SipProfile,
        listener: Option<Arc<RecordingListener>>,
    ) -> (Arc<FakeGroup>, Arc<RecordingTarget>) {
        let target = Arc::new(RecordingTarget::default());
        let uri = profile.uri();
        let listener = listener.map(|l| l as Arc<dyn RegistrationListener>);
        self.manager
            .open_to_receive_calls(caller, profile, target.clone(), listener)
            .expect("open_to_receive_calls");
        (self.factory.last_group(&uri), target)
    }

    /// Open alice and walk her through a successful registration
    pub fn registered_alice(&self, duration: u32) -> (Arc<FakeGroup>, Arc<FakeSession>, Arc<RecordingTarget>) {
        let (group, target) = self.open_receiving(APP, alice(), None);
        let session = group.last_session();
        session.registering();
        session.done(duration);
        (group, session, target)
    }
}

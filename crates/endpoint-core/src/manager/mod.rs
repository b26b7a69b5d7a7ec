//! The endpoint manager
//!
//! [`EndpointManager`] is the service object applications talk to. It owns the
//! profile registry and one auto-registration process per open profile, reacts
//! to connectivity changes, and learns the NAT keep-alive interval.
//!
//! All state lives behind a single lock. Application calls, session-layer
//! events and executor tasks each take it for the duration of one operation,
//! so transitions of a profile's registration are strictly ordered.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_endpoint_core::{CallerId, EndpointConfig, EndpointManager, Platform, SipProfile};
//! # fn platform() -> Platform { unimplemented!() }
//! # fn target() -> Arc<dyn rvoip_endpoint_core::IncomingCallTarget> { unimplemented!() }
//!
//! # fn main() -> Result<(), rvoip_endpoint_core::EndpointError> {
//! let manager = EndpointManager::new(EndpointConfig::default(), platform())?;
//! manager.start();
//!
//! let app = CallerId(10_001);
//! let profile = SipProfile::new("alice", "example.com").with_password("secret");
//! manager.open_to_receive_calls(app, profile, target(), None)?;
//! assert!(manager.is_opened(app, "sip:alice@example.com"));
//! # Ok(())
//! # }
//! ```

mod context;
mod network;

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::EndpointConfig;
use crate::connectivity::{ConnectivityDebouncer, NetworkEvent, NetworkType};
use crate::error::{EndpointError, EndpointResult};
use crate::events::{EndpointBroadcast, IncomingCall, IncomingCallTarget, RegistrationListener};
use crate::executor::SerialExecutor;
use crate::keepalive::IntervalMeasurement;
use crate::platform::Platform;
use crate::profile::{CallerId, SipProfile};
use crate::registration::{RegistrationEnv, RegistrationSnapshot};
use crate::registry::{GroupEntry, GroupId, ProfileRegistry, Slot};
use crate::session::{SessionListener, SipErrorCode, SipSession};
use crate::timer::TimerToken;
use crate::wake_lock::{SipWakeLock, WakeLockOwner};
use crate::wifi::WifiScanKeeper;

use self::context::{Context, Notice};

/// What the manager knows about the network
#[derive(Debug, Clone, Default)]
pub(crate) struct NetworkStatus {
    pub(crate) network_type: Option<NetworkType>,
    pub(crate) connected: bool,
    pub(crate) local_ip: Option<IpAddr>,
    /// Learned keep-alive interval; `None` until measured
    pub(crate) keep_alive_interval: Option<u32>,
}

/// Registration events as routed from a session sink
#[derive(Debug, Clone, Copy)]
pub(crate) enum RegistrationEvent<'a> {
    Registering,
    Done(u32),
    Failed(SipErrorCode, &'a str),
    Timeout,
}

impl RegistrationEvent<'_> {
    /// Done, failed or timed out
    fn is_outcome(&self) -> bool {
        !matches!(self, RegistrationEvent::Registering)
    }
}

pub(crate) struct EndpointState {
    pub(crate) registry: ProfileRegistry,
    pub(crate) network: NetworkStatus,
    pub(crate) debouncer: ConnectivityDebouncer,
    pub(crate) wifi_scan: WifiScanKeeper,
    pub(crate) wifi_enabled: bool,
    pub(crate) wifi_lock_held: bool,
    pub(crate) measurement: Option<IntervalMeasurement>,
    pub(crate) next_measurement: u64,
    pub(crate) receivers_registered: bool,
    pub(crate) started: bool,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            registry: ProfileRegistry::new(),
            network: NetworkStatus::default(),
            debouncer: ConnectivityDebouncer::new(),
            wifi_scan: WifiScanKeeper::new(),
            wifi_enabled: false,
            wifi_lock_held: false,
            measurement: None,
            next_measurement: 0,
            receivers_registered: false,
            started: false,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: EndpointConfig,
    pub(crate) platform: Platform,
    pub(crate) wake_lock: Arc<SipWakeLock>,
    pub(crate) executor: SerialExecutor,
    state: Mutex<EndpointState>,
    notices: Mutex<Vec<Notice>>,
    /// Serializes listener delivery across threads
    delivery: ReentrantMutex<()>,
    pub(crate) this: Weak<Shared>,
}

/// Retry `attempt` without a local address when it fails on the transport
///
/// A transport failure without an address means the session layer cannot bind
/// at all; that is reported as an internal error.
pub(crate) fn with_address_fallback<T>(
    local_ip: Option<IpAddr>,
    what: &str,
    mut attempt: impl FnMut(Option<IpAddr>) -> EndpointResult<T>,
) -> EndpointResult<T> {
    let mut address = local_ip;
    loop {
        match attempt(address) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transport() => {
                if address.take().is_none() {
                    error!(error = %e, "{} failed without a local address", what);
                    return Err(EndpointError::internal(format!("{}: {}", what, e)));
                }
                warn!(error = %e, "{} failed; network disconnected?", what);
            }
            Err(e) => return Err(e),
        }
    }
}

impl Shared {
    fn privileged(&self) -> CallerId {
        CallerId(self.config.privileged_caller)
    }

    fn authorized(&self, entry: &GroupEntry, caller: CallerId) -> bool {
        ProfileRegistry::is_authorized(entry, caller, self.privileged())
    }

    /// Build a group entry for `profile`, owned by `owner`; not yet inserted
    fn new_entry(
        &self,
        state: &mut EndpointState,
        owner: CallerId,
        profile: &SipProfile,
    ) -> EndpointResult<GroupEntry> {
        let mut stored = profile.redacted();
        stored.set_calling_uid(owner);
        let password = profile.password();
        let group = with_address_fallback(state.network.local_ip, "create session group", |ip| {
            self.platform
                .session_groups
                .create_group(ip, stored.clone(), password)
        })?;
        let id = state.registry.next_group_id();
        debug!(profile = %stored, group = %id, "session group created");
        Ok(GroupEntry::new(id, stored, group))
    }

    /// Insert a fresh entry and announce it
    fn add_entry(&self, state: &mut EndpointState, entry: GroupEntry) {
        let uri = entry.uri();
        state.registry.insert(entry);
        if state.registry.len() == 1 {
            self.register_receivers(state);
        }
        info!(profile = %uri, "profile added");
        self.platform
            .broadcaster
            .broadcast(EndpointBroadcast::ProfileAdded { profile_uri: uri });
    }

    /// Reuse the caller's group for `profile` or create one
    ///
    /// With `inbound` set, a reused group also takes over the incoming-call
    /// target and the registration listener.
    fn find_or_create_group(
        &self,
        state: &mut EndpointState,
        caller: CallerId,
        profile: &SipProfile,
        inbound: Option<(Arc<dyn IncomingCallTarget>, Option<Arc<dyn RegistrationListener>>)>,
    ) -> EndpointResult<GroupId> {
        let uri = profile.uri();
        let ctx = self.context(&state.network);
        let privileged = self.privileged();
        if let Some(entry) = state.registry.get_mut(&uri) {
            if !ProfileRegistry::is_authorized(entry, caller, privileged) {
                warn!(profile = %uri, %caller, "only creator can access the profile");
                return Err(EndpointError::unauthorized(uri, caller.0));
            }
            if let Some((target, listener)) = inbound {
                entry.incoming_target = Some(target);
                entry.registration.set_listener(listener, &ctx);
            }
            return Ok(entry.id);
        }

        let mut entry = self.new_entry(state, caller, profile)?;
        if let Some((target, listener)) = inbound {
            entry.incoming_target = Some(target);
            if listener.is_some() {
                entry.registration.set_listener(listener, &ctx);
            }
        }
        let id = entry.id;
        self.add_entry(state, entry);
        Ok(id)
    }

    /// Accept inbound calls on `entry` and keep it registered while connected
    fn open_entry_to_receive_calls(&self, entry: &mut GroupEntry, ctx: &Context<'_>) -> EndpointResult<()> {
        entry.opened_to_receive_calls = true;
        if ctx.connected() {
            entry.group.open_to_receive_calls(ctx.group_sink(entry.id))?;
            entry.registration.start(entry.group.as_ref(), ctx);
        }
        debug!(profile = %entry.profile, "opened to receive calls");
        Ok(())
    }

    fn destroy_entry(&self, state: &mut EndpointState, mut entry: GroupEntry, ctx: &Context<'_>) {
        entry.close(ctx);
        state.registry.forget_pending_of(entry.id);
    }

    pub(crate) fn on_registration_event(
        &self,
        group: GroupId,
        session: &Arc<dyn SipSession>,
        event: RegistrationEvent<'_>,
    ) {
        let mut state = self.lock_state();
        let ctx = self.context(&state.network);
        let Some((entry, slot)) = state.registry.by_id_mut(group) else {
            trace!(%group, ?event, "event for a closed group");
            session.set_listener(None);
            self.wake_lock.release(WakeLockOwner::Session(session.id()));
            return;
        };
        let registration = &mut entry.registration;
        let current = match event {
            RegistrationEvent::Registering => registration.on_registering(session, &ctx),
            RegistrationEvent::Done(duration) => {
                registration.on_registration_done(session, duration, &ctx)
            }
            RegistrationEvent::Failed(code, message) => {
                registration.on_registration_failed(session, code, message, &ctx)
            }
            RegistrationEvent::Timeout => registration.on_registration_timeout(session, &ctx),
        };
        if !(current && slot == Slot::Active && event.is_outcome()) {
            return;
        }
        // the replacement has settled; the entry it displaced can go
        let uri = entry.uri();
        if let Some(old) = state.registry.take_inactive(&uri) {
            debug!(profile = %uri, group = %old.id, "retire inactive group");
            self.destroy_entry(&mut state, old, &ctx);
        }
    }

    pub(crate) fn on_ringing(
        &self,
        group: GroupId,
        session: &Arc<dyn SipSession>,
        caller: &SipProfile,
        session_description: &str,
    ) {
        let mut state = self.lock_state();
        let Some(entry) = state.registry.by_id(group) else {
            session.end_call();
            return;
        };
        let Some(call_id) = session.call_id() else {
            warn!(%group, "ringing session without call id");
            session.end_call();
            return;
        };
        if !entry.is_registered() || state.registry.calling_self(group, &call_id) {
            session.end_call();
            return;
        }
        let target = entry.incoming_target.clone();
        let creator = entry.creator();
        let profile_uri = entry.uri();

        state
            .registry
            .add_pending(call_id.clone(), session.clone(), group, creator);
        info!(profile = %profile_uri, caller = %caller, %call_id, "ringing");
        let call = IncomingCall {
            call_id,
            session_description: session_description.to_string(),
        };
        let delivered = match target {
            Some(target) => target.send(call),
            None => Err(EndpointError::TargetCanceled {
                message: "no incoming call target".to_string(),
            }),
        };
        if let Err(e) = delivered {
            warn!(profile = %profile_uri, error = %e, "incoming call not delivered");
            session.end_call();
        }
    }

    pub(crate) fn on_keep_alive_response(&self, group: GroupId, port_changed: bool) {
        let mut state = self.lock_state();
        let ctx = self.context(&state.network);
        let Some((entry, _)) = state.registry.by_id_mut(group) else {
            return;
        };
        if let Some(profile) = entry.registration.on_keep_alive_response(port_changed, &ctx) {
            self.start_port_mapping_measurement(&mut state, profile);
        }
    }

    /// Timer callbacks, on the executor thread
    pub(crate) fn on_timer(&self, token: TimerToken) {
        trace!(%token, "timer");
        match token {
            TimerToken::Registration(group) => {
                let mut state = self.lock_state();
                let ctx = self.context(&state.network);
                if let Some((entry, _)) = state.registry.by_id_mut(group) {
                    entry.registration.on_refresh_timer(&ctx);
                }
            }
            TimerToken::Connectivity(id) => self.on_connectivity_timer(id),
            TimerToken::WifiScan => {
                let mut state = self.lock_state();
                let ctx = self.context(&state.network);
                state.wifi_scan.on_timer(
                    self.platform.wifi.as_ref(),
                    self.config.wifi_scan_interval(),
                    |delay, token| ctx.schedule(delay, token),
                );
            }
        }
    }

    fn register_receivers(&self, state: &mut EndpointState) {
        if !state.receivers_registered {
            state.receivers_registered = true;
            debug!("register receivers");
            self.platform.receivers.register_receivers();
        }
    }

    fn unregister_receivers(&self, state: &mut EndpointState) {
        if state.receivers_registered {
            state.receivers_registered = false;
            debug!("unregister receivers");
            self.platform.receivers.unregister_receivers();
        }
    }
}

/// SIP endpoint manager service
pub struct EndpointManager {
    shared: Arc<Shared>,
}

impl EndpointManager {
    /// Validate `config` and spawn the serial executor
    pub fn new(config: EndpointConfig, platform: Platform) -> EndpointResult<Self> {
        config.validate()?;
        let wake_lock = Arc::new(SipWakeLock::new(platform.wake_lock.clone()));
        let executor = SerialExecutor::new("sip-endpoint-executor", wake_lock.clone())
            .map_err(|e| EndpointError::internal(format!("cannot spawn executor: {}", e)))?;
        let shared = Arc::new_cyclic(|this| Shared {
            config,
            platform,
            wake_lock,
            executor,
            state: Mutex::new(EndpointState::new()),
            notices: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
            this: this.clone(),
        });
        debug!(wifi_only = shared.config.wifi_only, "endpoint manager created");
        Ok(Self { shared })
    }

    /// Announce the service; further calls do nothing
    pub fn start(&self) {
        let mut state = self.shared.lock_state();
        if state.started {
            return;
        }
        state.started = true;
        info!("SIP endpoint service up");
        self.shared.platform.broadcaster.broadcast(EndpointBroadcast::ServiceUp);
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    /// Profiles visible to `caller`, in the order they were opened
    pub fn list_profiles(&self, caller: CallerId) -> Vec<SipProfile> {
        let state = self.shared.lock_state();
        state.registry.list(caller, self.shared.privileged())
    }

    /// Open `profile` for outgoing calls
    pub fn open(&self, caller: CallerId, profile: SipProfile) -> EndpointResult<()> {
        profile.validate()?;
        let mut state = self.shared.lock_state();
        self.shared
            .find_or_create_group(&mut state, caller, &profile, None)
            .map(|_| ())
    }

    /// Open `profile` for incoming calls, delivered to `target`
    ///
    /// With auto-registration enabled on the profile, the group is also opened
    /// for inbound calls and kept registered while connected.
    pub fn open_to_receive_calls(
        &self,
        caller: CallerId,
        profile: SipProfile,
        target: Arc<dyn IncomingCallTarget>,
        listener: Option<Arc<dyn RegistrationListener>>,
    ) -> EndpointResult<()> {
        profile.validate()?;
        let shared = &self.shared;
        let mut state = shared.lock_state();
        let id = shared.find_or_create_group(&mut state, caller, &profile, Some((target, listener)))?;
        if !profile.auto_registration() {
            return Ok(());
        }
        let ctx = shared.context(&state.network);
        if let Some((entry, _)) = state.registry.by_id_mut(id) {
            shared.open_entry_to_receive_calls(entry, &ctx)?;
        }
        if state.wifi_enabled {
            shared.grab_wifi_lock(&mut state);
        }
        Ok(())
    }

    /// Replace the group of `profile` with a new one
    ///
    /// The displaced group stays open, with its registration stopped, until
    /// the new group reports a registration outcome. A group displaced before
    /// the previous replacement settled is closed at once.
    pub fn restart(&self, caller: CallerId, profile: SipProfile) -> EndpointResult<()> {
        profile.validate()?;
        let shared = &self.shared;
        let mut state = shared.lock_state();
        let uri = profile.uri();

        let previous = match state.registry.get(&uri) {
            Some(entry) if !shared.authorized(entry, caller) => {
                warn!(profile = %uri, %caller, "only creator can restart the profile");
                return Err(EndpointError::unauthorized(uri, caller.0));
            }
            Some(entry) => Some((
                entry.creator().unwrap_or(caller),
                entry.incoming_target.clone(),
                entry.opened_to_receive_calls,
            )),
            None => None,
        };
        // the replacement stays with the profile's creator
        let owner = previous.as_ref().map_or(caller, |(creator, _, _)| *creator);
        let mut entry = shared.new_entry(&mut state, owner, &profile)?;
        let ctx = shared.context(&state.network);

        if let Some((_, target, receive)) = previous {
            entry.incoming_target = target;
            entry.opened_to_receive_calls = receive;
            if let Some(old) = state.registry.get_mut(&uri) {
                let listener = old.registration.take_listener();
                entry.registration.set_listener(listener, &ctx);
            }
            if let Some(doomed) = state.registry.retire_active(&uri) {
                shared.destroy_entry(&mut state, doomed, &ctx);
            } else if let Some(inactive) = state.registry.inactive_mut(&uri) {
                inactive.registration.stop(&ctx);
            }
            let id = entry.id;
            state.registry.insert(entry);
            info!(profile = %uri, group = %id, "profile restarted");
        } else {
            shared.add_entry(&mut state, entry);
        }

        let will_register = match state.registry.get_mut(&uri) {
            Some(entry) => {
                if entry.opened_to_receive_calls && profile.auto_registration() {
                    shared.open_entry_to_receive_calls(entry, &ctx)?;
                }
                entry.registration.is_running()
            }
            None => false,
        };
        if !will_register {
            if let Some(old) = state.registry.take_inactive(&uri) {
                shared.destroy_entry(&mut state, old, &ctx);
            }
        }
        Ok(())
    }

    /// Close the profile for good
    ///
    /// Unknown URIs are ignored; closing another caller's profile without
    /// privilege is refused and changes nothing.
    pub fn close(&self, caller: CallerId, profile_uri: &str) -> EndpointResult<()> {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        match state.registry.get(profile_uri) {
            None => return Ok(()),
            Some(entry) if !shared.authorized(entry, caller) => {
                warn!(profile = %profile_uri, %caller, "only creator or privileged caller can close the profile");
                return Err(EndpointError::unauthorized(profile_uri, caller.0));
            }
            Some(_) => {}
        }
        let ctx = shared.context(&state.network);
        if let Some(entry) = state.registry.remove(profile_uri) {
            info!(profile = %profile_uri, "profile removed");
            shared.platform.broadcaster.broadcast(EndpointBroadcast::ProfileRemoved {
                profile_uri: profile_uri.to_string(),
            });
            shared.destroy_entry(&mut state, entry, &ctx);
        }
        if let Some(old) = state.registry.take_inactive(profile_uri) {
            shared.destroy_entry(&mut state, old, &ctx);
        }

        if !state.registry.any_opened_to_receive_calls() {
            shared.release_wifi_lock(&mut state);
            shared.wake_lock.reset();
        }
        if state.registry.is_empty() {
            shared.unregister_receivers(&mut state);
        }
        Ok(())
    }

    pub fn is_opened(&self, caller: CallerId, profile_uri: &str) -> bool {
        let state = self.shared.lock_state();
        match state.registry.get(profile_uri) {
            Some(entry) if self.shared.authorized(entry, caller) => true,
            Some(_) => {
                warn!(profile = %profile_uri, %caller, "only creator or privileged caller can query the profile");
                false
            }
            None => false,
        }
    }

    pub fn is_registered(&self, caller: CallerId, profile_uri: &str) -> bool {
        let state = self.shared.lock_state();
        match state.registry.get(profile_uri) {
            Some(entry) if self.shared.authorized(entry, caller) => entry.is_registered(),
            Some(_) => {
                warn!(profile = %profile_uri, %caller, "only creator or privileged caller can query the profile");
                false
            }
            None => false,
        }
    }

    /// Attach `listener` to the profile's registration and replay its status;
    /// only the creator may do this
    pub fn set_registration_listener(
        &self,
        caller: CallerId,
        profile_uri: &str,
        listener: Option<Arc<dyn RegistrationListener>>,
    ) -> EndpointResult<()> {
        let mut state = self.shared.lock_state();
        let ctx = self.shared.context(&state.network);
        let Some(entry) = state.registry.get_mut(profile_uri) else {
            return Ok(());
        };
        if entry.creator() != Some(caller) {
            warn!(profile = %profile_uri, %caller, "only creator can set listener on the profile");
            return Err(EndpointError::unauthorized(profile_uri, caller.0));
        }
        entry.registration.set_listener(listener, &ctx);
        Ok(())
    }

    /// Last-known registration values of the profile
    pub fn registration_snapshot(&self, caller: CallerId, profile_uri: &str) -> Option<RegistrationSnapshot> {
        let state = self.shared.lock_state();
        state
            .registry
            .get(profile_uri)
            .filter(|entry| self.shared.authorized(entry, caller))
            .map(|entry| entry.registration.snapshot())
    }

    /// New outgoing session on the caller's group for `profile`, opening the
    /// profile if needed; `None` while disconnected or when refused
    pub fn create_session(
        &self,
        caller: CallerId,
        profile: SipProfile,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Option<Arc<dyn SipSession>> {
        if let Err(e) = profile.validate() {
            debug!(error = %e, "create_session");
            return None;
        }
        let mut state = self.shared.lock_state();
        if !state.network.connected {
            return None;
        }
        match self.shared.find_or_create_group(&mut state, caller, &profile, None) {
            Ok(id) => state
                .registry
                .by_id(id)
                .and_then(|entry| entry.group.create_session(listener)),
            Err(e) => {
                debug!(error = %e, "create_session");
                None
            }
        }
    }

    /// Inbound session waiting under `call_id`
    pub fn pending_session(&self, caller: CallerId, call_id: &str) -> Option<Arc<dyn SipSession>> {
        let state = self.shared.lock_state();
        let (session, creator) = state.registry.pending(call_id)?;
        if caller == self.shared.privileged() || creator == Some(caller) {
            Some(session)
        } else {
            warn!(call_id, %caller, "pending session belongs to another caller");
            None
        }
    }

    /// Feed a platform connectivity notification; handled on the executor
    pub fn on_network_event(&self, event: NetworkEvent) {
        let target = Arc::downgrade(&self.shared);
        self.shared.executor.execute(move || {
            if let Some(shared) = target.upgrade() {
                shared.handle_network_event(event);
            }
        });
    }

    /// Apply a connectivity change right away, bypassing the debounce
    pub fn on_connectivity_changed(&self, network: NetworkType, connected: bool) {
        let mut state = self.shared.lock_state();
        self.shared.connectivity_changed(&mut state, network, connected);
    }

    /// WiFi radio switched on or off
    pub fn on_wifi_state_changed(&self, enabled: bool) {
        let mut state = self.shared.lock_state();
        state.wifi_enabled = enabled;
        if enabled {
            if state.registry.any_opened_to_receive_calls() {
                self.shared.grab_wifi_lock(&mut state);
            }
        } else {
            self.shared.release_wifi_lock(&mut state);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock_state().network.connected
    }

    /// Keep-alive interval in effect, in seconds
    pub fn keep_alive_interval(&self) -> u32 {
        let state = self.shared.lock_state();
        state
            .network
            .keep_alive_interval
            .unwrap_or(self.shared.config.default_keep_alive_interval_secs)
    }

    /// Wait for every task queued on the executor so far
    ///
    /// Listener callbacks delivered on the executor thread return from this at
    /// once without waiting.
    pub fn flush(&self) {
        self.shared.executor.flush();
    }
}

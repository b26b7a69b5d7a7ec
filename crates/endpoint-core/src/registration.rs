//! Auto-registration of a local profile
//!
//! [`AutoRegistration`] keeps one profile registered while the manager is
//! connected:
//!
//! 1. `start` opens a session and un-registers first, clearing bindings a
//!    previous incarnation may have left on the registrar.
//! 2. Every accepted REGISTER schedules a refresh `MIN_EXPIRY` seconds before the
//!    binding runs out, and may start a keep-alive session next to it.
//! 3. Failures are retried with exponential backoff, except credential and
//!    unreachable-server failures, which pause the process until restarted.
//!
//! Events from any session other than the current one are stale: the session is
//! unbound and its wake-lock ownership dropped, nothing else changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::EndpointConfig;
use crate::events::{RegistrationListener, RegistrationStatus};
use crate::profile::SipProfile;
use crate::registry::GroupId;
use crate::session::{
    KeepAliveCallback, SessionListener, SessionState, SipErrorCode, SipSession, SipSessionGroup,
};
use crate::timer::TimerToken;
use crate::wake_lock::{SipWakeLock, WakeLockOwner};

/// What the registration process needs from its surroundings
pub(crate) trait RegistrationEnv {
    fn config(&self) -> &EndpointConfig;

    fn wake_lock(&self) -> &SipWakeLock;

    fn connected(&self) -> bool;

    /// Local address is in a private range
    fn behind_nat(&self) -> bool;

    /// Learned keep-alive interval, or the default
    fn keep_alive_interval(&self) -> u32;

    fn schedule(&self, delay: Duration, token: TimerToken);

    fn cancel(&self, token: TimerToken);

    /// Event sink routing a session's registration events back to `group`
    fn session_sink(&self, group: GroupId) -> Arc<dyn SessionListener>;

    /// Keep-alive callback routing back to `group`
    fn keep_alive_sink(&self, group: GroupId) -> Arc<dyn KeepAliveCallback>;

    /// Hand `status` to `listener`; may be delivered after the caller returns
    fn notify(&self, listener: &Arc<dyn RegistrationListener>, profile_uri: &str, status: RegistrationStatus);
}

/// Last-known values of a registration process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub profile_uri: String,
    pub running: bool,
    pub registered: bool,
    /// Seconds until the binding expires, when registered
    pub remaining_secs: Option<u32>,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_error: Option<(SipErrorCode, String)>,
    /// Multiplier for the next retry delay
    pub backoff: u32,
    pub keep_alive_active: bool,
}

fn session_owner(session: &Arc<dyn SipSession>) -> WakeLockOwner {
    WakeLockOwner::Session(session.id())
}

pub(crate) struct AutoRegistration {
    group: GroupId,
    profile_uri: String,
    session: Option<Arc<dyn SipSession>>,
    keep_alive_session: Option<Arc<dyn SipSession>>,
    listener: Option<Arc<dyn RegistrationListener>>,
    backoff: u32,
    registered: bool,
    expiry: Option<Instant>,
    registered_at: Option<DateTime<Utc>>,
    last_error: Option<(SipErrorCode, String)>,
    running: bool,
    immediate_refreshes: u32,
}

impl AutoRegistration {
    pub(crate) fn new(group: GroupId, profile_uri: impl Into<String>) -> Self {
        Self {
            group,
            profile_uri: profile_uri.into(),
            session: None,
            keep_alive_session: None,
            listener: None,
            backoff: 1,
            registered: false,
            expiry: None,
            registered_at: None,
            last_error: None,
            running: false,
            immediate_refreshes: 0,
        }
    }

    fn token(&self) -> TimerToken {
        TimerToken::Registration(self.group)
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Detach the listener without telling it anything
    pub(crate) fn take_listener(&mut self) -> Option<Arc<dyn RegistrationListener>> {
        self.listener.take()
    }

    pub(crate) fn start(&mut self, group: &dyn SipSessionGroup, env: &dyn RegistrationEnv) {
        if self.running {
            return;
        }
        self.running = true;
        self.backoff = 1;
        self.immediate_refreshes = 0;
        let Some(session) = group.create_session(Some(env.session_sink(self.group))) else {
            // no usable transport; the next connectivity change restarts us
            debug!(profile = %self.profile_uri, "no session for auto-registration");
            return;
        };
        env.wake_lock().acquire(session_owner(&session));
        session.unregister();
        self.session = Some(session);
        info!(profile = %self.profile_uri, "start auto-registration");
    }

    pub(crate) fn stop(&mut self, env: &dyn RegistrationEnv) {
        if !self.running {
            return;
        }
        self.running = false;
        if let Some(session) = &self.session {
            env.wake_lock().release(session_owner(session));
            session.set_listener(None);
            if env.connected() && self.registered {
                session.unregister();
            }
        }
        env.cancel(self.token());
        if let Some(keep_alive) = self.keep_alive_session.take() {
            keep_alive.stop_keep_alive();
        }
        self.registered = false;
        self.expiry = None;
        debug!(profile = %self.profile_uri, "stop auto-registration");
        self.replay_status(env);
    }

    /// Attach `listener` and tell it where things stand
    pub(crate) fn set_listener(
        &mut self,
        listener: Option<Arc<dyn RegistrationListener>>,
        env: &dyn RegistrationEnv,
    ) {
        self.listener = listener;
        self.replay_status(env);
    }

    fn replay_status(&self, env: &dyn RegistrationEnv) {
        self.notify(env, self.status(env.connected()));
    }

    pub(crate) fn status(&self, connected: bool) -> RegistrationStatus {
        let state = self
            .session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::ReadyToCall);
        if matches!(state, SessionState::Registering | SessionState::Deregistering) {
            RegistrationStatus::Registering
        } else if self.registered {
            RegistrationStatus::Registered {
                remaining_secs: self.remaining_secs().unwrap_or(0),
            }
        } else if let Some((code, message)) = &self.last_error {
            if *code == SipErrorCode::TimeOut {
                RegistrationStatus::TimedOut
            } else {
                RegistrationStatus::Failed {
                    code: *code,
                    message: message.clone(),
                }
            }
        } else if !connected {
            RegistrationStatus::Disconnected
        } else if !self.running {
            RegistrationStatus::NotRunning
        } else {
            RegistrationStatus::InProgress { state }
        }
    }

    fn remaining_secs(&self) -> Option<u32> {
        let left = self.expiry?.saturating_duration_since(Instant::now());
        let secs = (left.as_millis() + 999) / 1000;
        Some(u32::try_from(secs).unwrap_or(u32::MAX))
    }

    pub(crate) fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            profile_uri: self.profile_uri.clone(),
            running: self.running,
            registered: self.registered,
            remaining_secs: if self.registered { self.remaining_secs() } else { None },
            registered_at: self.registered_at,
            last_error: self.last_error.clone(),
            backoff: self.backoff,
            keep_alive_active: self.keep_alive_session.is_some(),
        }
    }

    pub(crate) fn on_keep_alive_interval_changed(&self, env: &dyn RegistrationEnv) {
        if let Some(keep_alive) = &self.keep_alive_session {
            let interval = env.keep_alive_interval();
            debug!(profile = %self.profile_uri, interval, "restart keep-alive");
            keep_alive.stop_keep_alive();
            if let Err(e) = keep_alive.start_keep_alive(interval, env.keep_alive_sink(self.group)) {
                error!(profile = %self.profile_uri, error = %e, "cannot restart keep-alive");
            }
        }
    }

    /// Handle a keep-alive answer; returns the profile to offer for port-mapping
    /// measurement
    pub(crate) fn on_keep_alive_response(
        &mut self,
        port_changed: bool,
        env: &dyn RegistrationEnv,
    ) -> Option<SipProfile> {
        let candidate = self.session.as_ref().map(|s| s.local_profile());
        if !self.running || !port_changed {
            return candidate;
        }
        // The session layer stops the keep-alive when the port moves; the next
        // successful registration starts a new one.
        self.keep_alive_session = None;
        if let Some(session) = &self.session {
            info!(profile = %self.profile_uri, "NAT port changed; re-register");
            env.wake_lock().acquire(session_owner(session));
            session.register(env.config().registration_expiry_secs);
        }
        candidate
    }

    /// Refresh or retry timer fired
    pub(crate) fn on_refresh_timer(&mut self, env: &dyn RegistrationEnv) {
        if !self.running {
            return;
        }
        self.last_error = None;
        self.register_now(env);
    }

    fn register_now(&mut self, env: &dyn RegistrationEnv) {
        debug!(profile = %self.profile_uri, "registering");
        if !env.connected() {
            return;
        }
        if let Some(session) = &self.session {
            env.wake_lock().acquire(session_owner(session));
            session.register(env.config().registration_expiry_secs);
        }
    }

    fn restart(&self, duration: u32, env: &dyn RegistrationEnv) {
        debug!(profile = %self.profile_uri, "refresh registration {}s later", duration);
        env.cancel(self.token());
        env.schedule(Duration::from_secs(u64::from(duration)), self.token());
    }

    /// Next retry delay; doubles the multiplier until the cap is reached
    fn backoff_duration(&mut self, config: &EndpointConfig) -> u32 {
        let duration = config.short_expiry_secs.saturating_mul(self.backoff);
        if duration > config.max_backoff_secs {
            config.max_backoff_secs
        } else {
            self.backoff = self.backoff.saturating_mul(2);
            duration
        }
    }

    fn restart_later(&mut self, env: &dyn RegistrationEnv) {
        self.registered = false;
        let duration = self.backoff_duration(env.config());
        self.restart(duration, env);
    }

    /// True when `session` may not drive this process; a foreign session is
    /// unbound and loses its wake-lock ownership
    fn not_current_session(&self, session: &Arc<dyn SipSession>, env: &dyn RegistrationEnv) -> bool {
        let current = self.session.as_ref().map(|s| s.id());
        if current != Some(session.id()) {
            session.set_listener(None);
            env.wake_lock().release(session_owner(session));
            return true;
        }
        !self.running
    }

    fn notify(&self, env: &dyn RegistrationEnv, status: RegistrationStatus) {
        if let Some(listener) = &self.listener {
            env.notify(listener, &self.profile_uri, status);
        }
    }

    /// Returns false when the event was stale
    pub(crate) fn on_registering(
        &mut self,
        session: &Arc<dyn SipSession>,
        env: &dyn RegistrationEnv,
    ) -> bool {
        if self.not_current_session(session, env) {
            return false;
        }
        self.registered = false;
        self.notify(env, RegistrationStatus::Registering);
        true
    }

    /// Returns false when the event was stale
    pub(crate) fn on_registration_done(
        &mut self,
        session: &Arc<dyn SipSession>,
        duration: u32,
        env: &dyn RegistrationEnv,
    ) -> bool {
        if self.not_current_session(session, env) {
            return false;
        }
        self.notify(env, RegistrationStatus::Registered { remaining_secs: duration });

        if duration > 0 {
            self.immediate_refreshes = 0;
            self.expiry = Some(Instant::now() + Duration::from_secs(u64::from(duration)));

            if !self.registered {
                self.registered = true;
                self.registered_at = Some(Utc::now());
                // overlap with the old binding so calls are not dropped during renewal
                let min_expiry = env.config().min_expiry_secs;
                let refresh = duration.saturating_sub(min_expiry).max(min_expiry);
                self.restart(refresh, env);

                let send_keep_alive = session.local_profile().send_keep_alive();
                if self.keep_alive_session.is_none() && (env.behind_nat() || send_keep_alive) {
                    let keep_alive = session.duplicate();
                    debug!(profile = %self.profile_uri, "start keep-alive");
                    if let Err(e) = keep_alive
                        .start_keep_alive(env.keep_alive_interval(), env.keep_alive_sink(self.group))
                    {
                        error!(profile = %self.profile_uri, error = %e, "cannot start keep-alive");
                    }
                    self.keep_alive_session = Some(keep_alive);
                }
            }
            env.wake_lock().release(session_owner(session));
        } else {
            self.registered = false;
            self.expiry = None;
            if self.immediate_refreshes < env.config().max_immediate_refreshes {
                self.immediate_refreshes += 1;
                debug!(profile = %self.profile_uri, "refresh registration immediately");
                self.last_error = None;
                self.register_now(env);
            } else {
                warn!(profile = %self.profile_uri,
                    "registrar keeps granting zero expiry; backing off");
                self.immediate_refreshes = 0;
                self.restart_later(env);
                env.wake_lock().release(session_owner(session));
            }
        }
        true
    }

    /// Returns false when the event was stale
    pub(crate) fn on_registration_failed(
        &mut self,
        session: &Arc<dyn SipSession>,
        code: SipErrorCode,
        message: &str,
        env: &dyn RegistrationEnv,
    ) -> bool {
        if self.not_current_session(session, env) {
            return false;
        }
        if code.pauses_registration() {
            warn!(profile = %self.profile_uri, %code, "pause auto-registration");
            self.stop(env);
        } else {
            self.restart_later(env);
        }
        self.last_error = Some((code, message.to_string()));
        self.notify(
            env,
            RegistrationStatus::Failed {
                code,
                message: message.to_string(),
            },
        );
        env.wake_lock().release(session_owner(session));
        true
    }

    /// Returns false when the event was stale
    pub(crate) fn on_registration_timeout(
        &mut self,
        session: &Arc<dyn SipSession>,
        env: &dyn RegistrationEnv,
    ) -> bool {
        if self.not_current_session(session, env) {
            return false;
        }
        self.last_error = Some((SipErrorCode::TimeOut, "registration timed out".to_string()));
        self.notify(env, RegistrationStatus::TimedOut);
        self.restart_later(env);
        env.wake_lock().release(session_owner(session));
        true
    }
}

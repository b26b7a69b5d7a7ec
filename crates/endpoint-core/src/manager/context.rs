//! Glue between the manager's shared state and the pieces it drives
//!
//! A [`Context`] is a snapshot of the network facts plus access to the timer,
//! wake lock and sink factories. The sinks handed to the session layer hold
//! only a weak reference back to the manager and re-enter it through its
//! state lock.
//!
//! Registration listeners never run under that lock. Their callbacks are
//! queued as [`Notice`]s and delivered once the [`StateGuard`] that raised
//! them is dropped.

use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use super::{EndpointState, NetworkStatus, RegistrationEvent, Shared};
use crate::config::EndpointConfig;
use crate::events::{RegistrationListener, RegistrationStatus};
use crate::platform::is_behind_nat;
use crate::profile::SipProfile;
use crate::registration::RegistrationEnv;
use crate::registry::GroupId;
use crate::session::{KeepAliveCallback, SessionListener, SipErrorCode, SipSession};
use crate::timer::TimerToken;
use crate::wake_lock::SipWakeLock;

/// A listener callback waiting for the state lock to be released
pub(crate) struct Notice {
    listener: Arc<dyn RegistrationListener>,
    profile_uri: String,
    status: RegistrationStatus,
}

/// Exclusive access to the endpoint state
///
/// Fields drop in declaration order: the lock is released before the queued
/// notices are delivered.
pub(crate) struct StateGuard<'a> {
    state: MutexGuard<'a, EndpointState>,
    _notices: NoticeFlush<'a>,
}

struct NoticeFlush<'a> {
    shared: &'a Shared,
}

impl Drop for NoticeFlush<'_> {
    fn drop(&mut self) {
        self.shared.deliver_notices();
    }
}

impl Deref for StateGuard<'_> {
    type Target = EndpointState;

    fn deref(&self) -> &EndpointState {
        &self.state
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut EndpointState {
        &mut self.state
    }
}

pub(crate) struct Context<'a> {
    shared: &'a Shared,
    connected: bool,
    local_ip: Option<IpAddr>,
    keep_alive_interval: u32,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        StateGuard {
            state: self.state.lock(),
            _notices: NoticeFlush { shared: self },
        }
    }

    /// Deliver queued listener notices in the order they were raised
    ///
    /// A listener calling back into the manager may deliver newer notices
    /// from within its callback.
    pub(crate) fn deliver_notices(&self) {
        let _delivery = self.delivery.lock();
        loop {
            let batch = std::mem::take(&mut *self.notices.lock());
            if batch.is_empty() {
                return;
            }
            for notice in batch {
                trace!(profile = %notice.profile_uri, status = ?notice.status, "notify listener");
                notice.status.replay(notice.listener.as_ref(), &notice.profile_uri);
            }
        }
    }

    pub(crate) fn context(&self, network: &NetworkStatus) -> Context<'_> {
        Context {
            shared: self,
            connected: network.connected,
            local_ip: network.local_ip,
            keep_alive_interval: network
                .keep_alive_interval
                .unwrap_or(self.config.default_keep_alive_interval_secs),
        }
    }
}

impl Context<'_> {
    pub(crate) fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    /// Sink for registration and inbound-call events of `group`
    pub(crate) fn group_sink(&self, group: GroupId) -> Arc<GroupEventSink> {
        Arc::new(GroupEventSink {
            shared: self.shared.this.clone(),
            group,
        })
    }
}

impl RegistrationEnv for Context<'_> {
    fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    fn wake_lock(&self) -> &SipWakeLock {
        &self.shared.wake_lock
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn behind_nat(&self) -> bool {
        is_behind_nat(self.local_ip)
    }

    fn keep_alive_interval(&self) -> u32 {
        self.keep_alive_interval
    }

    /// Arm `token`; when it fires the work is queued on the serial executor
    fn schedule(&self, delay: Duration, token: TimerToken) {
        let target = self.shared.this.clone();
        self.shared.platform.timer.set(
            delay,
            token,
            Box::new(move || {
                if let Some(shared) = target.upgrade() {
                    let inner = shared.this.clone();
                    shared.executor.execute(move || {
                        if let Some(shared) = inner.upgrade() {
                            shared.on_timer(token);
                        }
                    });
                }
            }),
        );
    }

    fn cancel(&self, token: TimerToken) {
        self.shared.platform.timer.cancel(&token);
    }

    fn session_sink(&self, group: GroupId) -> Arc<dyn SessionListener> {
        self.group_sink(group)
    }

    fn keep_alive_sink(&self, group: GroupId) -> Arc<dyn KeepAliveCallback> {
        Arc::new(KeepAliveSink {
            shared: self.shared.this.clone(),
            group,
        })
    }

    fn notify(&self, listener: &Arc<dyn RegistrationListener>, profile_uri: &str, status: RegistrationStatus) {
        self.shared.notices.lock().push(Notice {
            listener: listener.clone(),
            profile_uri: profile_uri.to_string(),
            status,
        });
    }
}

pub(crate) struct GroupEventSink {
    shared: Weak<Shared>,
    group: GroupId,
}

impl GroupEventSink {
    fn deliver(&self, session: &Arc<dyn SipSession>, event: RegistrationEvent<'_>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_registration_event(self.group, session, event);
        }
    }
}

impl SessionListener for GroupEventSink {
    fn on_registering(&self, session: &Arc<dyn SipSession>) {
        self.deliver(session, RegistrationEvent::Registering);
    }

    fn on_registration_done(&self, session: &Arc<dyn SipSession>, duration: u32) {
        self.deliver(session, RegistrationEvent::Done(duration));
    }

    fn on_registration_failed(&self, session: &Arc<dyn SipSession>, code: SipErrorCode, message: &str) {
        self.deliver(session, RegistrationEvent::Failed(code, message));
    }

    fn on_registration_timeout(&self, session: &Arc<dyn SipSession>) {
        self.deliver(session, RegistrationEvent::Timeout);
    }

    fn on_ringing(&self, session: &Arc<dyn SipSession>, caller: &SipProfile, session_description: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_ringing(self.group, session, caller, session_description);
        }
    }

    fn on_error(&self, session: &Arc<dyn SipSession>, code: SipErrorCode, message: &str) {
        debug!(group = %self.group, session = %session.id(), %code, message, "session error");
    }
}

struct KeepAliveSink {
    shared: Weak<Shared>,
    group: GroupId,
}

impl KeepAliveCallback for KeepAliveSink {
    fn on_response(&self, port_changed: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_keep_alive_response(self.group, port_changed);
        }
    }

    fn on_error(&self, code: SipErrorCode, message: &str) {
        warn!(group = %self.group, %code, message, "keep-alive error");
    }
}

/// Routes probe answers to the port-mapping measurement `id`
pub(crate) struct MeasurementSink {
    shared: Weak<Shared>,
    id: u64,
}

impl MeasurementSink {
    pub(crate) fn new(shared: Weak<Shared>, id: u64) -> Self {
        Self { shared, id }
    }
}

impl KeepAliveCallback for MeasurementSink {
    fn on_response(&self, port_changed: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_measurement_response(self.id, port_changed);
        }
    }

    fn on_error(&self, code: SipErrorCode, message: &str) {
        warn!(measurement = self.id, %code, message, "interval measurement error");
    }
}

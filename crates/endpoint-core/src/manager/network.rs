//! Connectivity, WiFi lock and NAT measurement handling of the manager

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::context::{Context, MeasurementSink};
use super::{with_address_fallback, EndpointState, Shared};
use crate::connectivity::{classify, NetworkEvent, NetworkType};
use crate::error::EndpointResult;
use crate::keepalive::{IntervalMeasurement, IntervalSearch, ProbeNext};
use crate::platform::is_behind_nat;
use crate::profile::SipProfile;
use crate::registration::RegistrationEnv;
use crate::registry::GroupEntry;
use crate::timer::TimerToken;
use crate::wake_lock::WakeLockOwner;

impl Shared {
    /// Filter and debounce a platform notification; runs on the executor
    pub(crate) fn handle_network_event(&self, event: NetworkEvent) {
        let Some((network, connected)) = classify(&event, self.config.wifi_only) else {
            return;
        };
        let mut state = self.lock_state();
        if connected {
            let (cancelled, id) = state.debouncer.schedule(network.clone());
            if let Some(previous) = cancelled {
                self.cancel_dispatch(previous);
            }
            // keep the device awake until the deferred dispatch has run
            self.wake_lock.acquire(WakeLockOwner::Connectivity(id));
            let ctx = self.context(&state.network);
            ctx.schedule(self.config.connectivity_debounce(), TimerToken::Connectivity(id));
            debug!(%network, dispatch = id, "connected; dispatch deferred");
        } else {
            if let Some(pending) = state.debouncer.cancel_for(&network) {
                self.cancel_dispatch(pending);
            }
            self.connectivity_changed(&mut state, network, false);
        }
    }

    fn cancel_dispatch(&self, id: u64) {
        trace!(dispatch = id, "cancel deferred connectivity dispatch");
        self.platform.timer.cancel(&TimerToken::Connectivity(id));
        self.wake_lock.release(WakeLockOwner::Connectivity(id));
    }

    pub(crate) fn on_connectivity_timer(&self, id: u64) {
        let _scope = self.wake_lock.adopt(WakeLockOwner::Connectivity(id));
        let mut state = self.lock_state();
        match state.debouncer.take_if_current(id) {
            Some(network) => {
                debug!(%network, dispatch = id, "deliver connectivity change");
                self.connectivity_changed(&mut state, network, true);
            }
            None => warn!(dispatch = id, "unexpected connectivity dispatch"),
        }
    }

    pub(crate) fn connectivity_changed(
        &self,
        state: &mut EndpointState,
        network: NetworkType,
        connected: bool,
    ) {
        let same_type = state.network.network_type.as_ref() == Some(&network);
        if !same_type && !connected {
            debug!(%network, "disconnection of a network not in use");
            return;
        }
        info!(
            from = ?state.network.network_type,
            was_connected = state.network.connected,
            to = %network,
            connected,
            "connectivity changed"
        );
        let is_wifi = network.is_wifi();
        let was_connected = state.network.connected;
        state.network.network_type = Some(network);
        state.network.connected = connected;

        if was_connected {
            state.network.local_ip = None;
            let ctx = self.context(&state.network);
            for entry in state.registry.entries_mut() {
                if let Err(e) = self.group_connectivity_changed(entry, false, &ctx) {
                    warn!(profile = %entry.profile, error = %e, "group disconnect");
                }
            }
        }

        if connected {
            state.network.local_ip = self.platform.local_address.local_ip();
            state.network.keep_alive_interval = None;
            debug!(local_ip = ?state.network.local_ip, "local address");
            let ctx = self.context(&state.network);
            for entry in state.registry.entries_mut() {
                if let Err(e) = self.group_connectivity_changed(entry, true, &ctx) {
                    warn!(profile = %entry.profile, error = %e, "group reconnect");
                }
            }
            if is_wifi && state.wifi_lock_held {
                self.stop_wifi_scanner(state);
            }
        } else {
            let ctx = self.context(&state.network);
            for entry in state.registry.drain_inactive() {
                self.destroy_entry(state, entry, &ctx);
            }
            // in case something leaked
            self.wake_lock.reset();
            self.stop_port_mapping_measurement(state);
            if is_wifi && state.wifi_lock_held {
                self.start_wifi_scanner(state);
            }
        }
    }

    fn group_connectivity_changed(
        &self,
        entry: &mut GroupEntry,
        connected: bool,
        ctx: &Context<'_>,
    ) -> EndpointResult<()> {
        entry.group.on_connectivity_changed();
        if connected {
            let group = entry.group.clone();
            with_address_fallback(ctx.local_ip(), "reset session group", |ip| group.reset(ip))?;
            if entry.opened_to_receive_calls {
                self.open_entry_to_receive_calls(entry, ctx)?;
            }
        } else {
            // keep opened_to_receive_calls so the group reopens on reconnect
            debug!(profile = %entry.profile, "close auto-registration temporarily");
            entry.group.close();
            entry.registration.stop(ctx);
        }
        Ok(())
    }

    pub(crate) fn grab_wifi_lock(&self, state: &mut EndpointState) {
        if state.wifi_lock_held {
            return;
        }
        debug!("acquire wifi lock");
        self.platform.wifi.acquire_wifi_lock();
        state.wifi_lock_held = true;
        if !state.network.connected {
            self.start_wifi_scanner(state);
        }
    }

    pub(crate) fn release_wifi_lock(&self, state: &mut EndpointState) {
        if !state.wifi_lock_held {
            return;
        }
        debug!("release wifi lock");
        self.platform.wifi.release_wifi_lock();
        state.wifi_lock_held = false;
        self.stop_wifi_scanner(state);
    }

    fn start_wifi_scanner(&self, state: &mut EndpointState) {
        let ctx = self.context(&state.network);
        state
            .wifi_scan
            .start(self.config.wifi_scan_interval(), |delay, token| ctx.schedule(delay, token));
    }

    fn stop_wifi_scanner(&self, state: &mut EndpointState) {
        let ctx = self.context(&state.network);
        state.wifi_scan.stop(|token| ctx.cancel(token));
    }

    /// Start learning the NAT mapping lifetime on a dedicated group for
    /// `profile`, unless already measuring, already learned or not behind NAT
    pub(crate) fn start_port_mapping_measurement(&self, state: &mut EndpointState, profile: SipProfile) {
        if state.measurement.is_some()
            || state.network.keep_alive_interval.is_some()
            || !is_behind_nat(state.network.local_ip)
        {
            return;
        }
        let created = with_address_fallback(state.network.local_ip, "create measurement group", |ip| {
            self.platform
                .session_groups
                .create_group(ip, profile.redacted(), profile.password())
        });
        let group = match created {
            Ok(group) => group,
            Err(e) => {
                warn!(profile = %profile, error = %e, "start interval measurement");
                return;
            }
        };
        let Some(session) = group.create_session(None) else {
            warn!(profile = %profile, "no session for interval measurement");
            group.close();
            return;
        };
        state.next_measurement += 1;
        let id = state.next_measurement;
        let sink = Arc::new(MeasurementSink::new(self.this.clone(), id));
        let measurement = IntervalMeasurement::new(
            id,
            group,
            session,
            sink,
            IntervalSearch::from_config(&self.config),
        );
        measurement.start();
        state.measurement = Some(measurement);
    }

    pub(crate) fn stop_port_mapping_measurement(&self, state: &mut EndpointState) {
        if let Some(measurement) = state.measurement.take() {
            debug!(measurement = measurement.id(), "stop interval measurement");
            measurement.stop();
        }
    }

    pub(crate) fn on_measurement_response(&self, id: u64, port_changed: bool) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(measurement) = state.measurement.as_mut().filter(|m| m.id() == id) else {
            trace!(measurement = id, "answer for a finished measurement");
            return;
        };
        let default = self.config.default_keep_alive_interval_secs;
        let before = state.network.keep_alive_interval.unwrap_or(default);

        let outcome = measurement.on_response(port_changed);
        if let Some(interval) = outcome.published {
            state.network.keep_alive_interval = Some(interval);
        }
        if let ProbeNext::Finished(interval) = outcome.next {
            self.stop_port_mapping_measurement(state);
            state.network.keep_alive_interval = Some(interval);
        }

        let after = state.network.keep_alive_interval.unwrap_or(default);
        if after != before {
            let ctx = self.context(&state.network);
            for entry in state.registry.entries() {
                entry.registration.on_keep_alive_interval_changed(&ctx);
            }
        }
    }
}

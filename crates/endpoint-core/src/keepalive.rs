//! NAT keep-alive interval measurement
//!
//! A NAT drops an idle UDP mapping after some unknown lifetime; a keep-alive
//! sent less often than that lets the mapping expire, and the registrar then
//! sees the next packet arrive from a new port. [`IntervalSearch`] binary
//! searches the longest interval that keeps the port stable:
//!
//! - probe at the candidate interval until `pass_threshold` consecutive answers
//!   come back on the same port, then accept it as the new floor and publish it;
//! - a changed port means the candidate is too long and becomes the ceiling;
//! - stop once the bounds are closer than the minimum distinguishable step,
//!   otherwise continue from the midpoint.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::session::{KeepAliveCallback, SipSession, SipSessionGroup};

/// What the search wants done after an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeNext {
    /// Keep probing at the current interval
    Continue,
    /// Restart the probe at a new interval
    Restart(u32),
    /// Search is over; the value is the final interval
    Finished(u32),
}

/// Result of feeding one answer to the search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Interval newly proven safe and to be published
    pub published: Option<u32>,
    pub next: ProbeNext,
}

/// Binary search state over the keep-alive interval, in seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSearch {
    min: u32,
    max: u32,
    interval: u32,
    pass_count: u32,
    pass_threshold: u32,
    step: u32,
}

impl IntervalSearch {
    /// Search `[min, max]` starting at `max / 2`
    pub fn new(min: u32, max: u32, pass_threshold: u32, step: u32) -> Self {
        Self {
            min,
            max,
            interval: max / 2,
            pass_count: 0,
            pass_threshold,
            step,
        }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(
            config.keep_alive_min_interval_secs,
            config.keep_alive_max_interval_secs,
            config.keep_alive_pass_threshold,
            config.short_expiry_secs,
        )
    }

    /// Interval currently being probed
    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.min, self.max)
    }

    pub fn on_response(&mut self, port_changed: bool) -> ProbeOutcome {
        let mut published = None;
        if port_changed {
            self.max = self.interval;
        } else {
            self.pass_count += 1;
            if self.pass_count != self.pass_threshold {
                return ProbeOutcome {
                    published: None,
                    next: ProbeNext::Continue,
                };
            }
            self.min = self.interval;
            published = Some(self.interval);
        }

        let next = if self.max.saturating_sub(self.min) < self.step {
            ProbeNext::Finished(self.min)
        } else {
            self.interval = (self.max + self.min) / 2;
            self.pass_count = 0;
            ProbeNext::Restart(self.interval)
        };
        ProbeOutcome { published, next }
    }
}

/// A running measurement: a dedicated group and session probing one profile
pub(crate) struct IntervalMeasurement {
    id: u64,
    profile_uri: String,
    group: Arc<dyn SipSessionGroup>,
    session: Arc<dyn SipSession>,
    callback: Arc<dyn KeepAliveCallback>,
    search: IntervalSearch,
}

impl IntervalMeasurement {
    pub(crate) fn new(
        id: u64,
        group: Arc<dyn SipSessionGroup>,
        session: Arc<dyn SipSession>,
        callback: Arc<dyn KeepAliveCallback>,
        search: IntervalSearch,
    ) -> Self {
        Self {
            id,
            profile_uri: group.local_profile_uri(),
            group,
            session,
            callback,
            search,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn start(&self) {
        info!(profile = %self.profile_uri, interval = self.search.interval(),
            "start NAT port mapping timeout measurement");
        if let Err(e) = self
            .session
            .start_keep_alive(self.search.interval(), self.callback.clone())
        {
            warn!(profile = %self.profile_uri, error = %e, "cannot start keep-alive probe");
        }
    }

    fn restart(&self) {
        self.session.stop_keep_alive();
        if let Err(e) = self
            .session
            .start_keep_alive(self.search.interval(), self.callback.clone())
        {
            warn!(profile = %self.profile_uri, error = %e, "cannot restart keep-alive probe");
        }
    }

    /// Stop probing and release the measurement group
    pub(crate) fn stop(&self) {
        self.session.stop_keep_alive();
        self.group.close();
    }

    /// Feed an answer; restarts the probe when the search moves on
    pub(crate) fn on_response(&mut self, port_changed: bool) -> ProbeOutcome {
        let outcome = self.search.on_response(port_changed);
        if let Some(interval) = outcome.published {
            debug!(interval, "measured good keep-alive interval");
        }
        match outcome.next {
            ProbeNext::Continue => {}
            ProbeNext::Restart(interval) => {
                debug!(interval, bounds = ?self.search.bounds(), "test new keep-alive interval");
                self.restart();
            }
            ProbeNext::Finished(interval) => {
                info!(interval, "measured keep-alive interval");
            }
        }
        outcome
    }
}

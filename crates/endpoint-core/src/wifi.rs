//! Periodic WiFi scans while disconnected
//!
//! When a call-receiving profile holds the WiFi lock and the device has lost
//! its network, an active scan is triggered every scan interval so the radio
//! re-associates as soon as an access point is back in range.

use std::time::Duration;

use tracing::{debug, trace};

use crate::platform::WifiControl;
use crate::timer::TimerToken;

#[derive(Debug, Default)]
pub(crate) struct WifiScanKeeper {
    running: bool,
}

impl WifiScanKeeper {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Start scanning every `interval`; `schedule` arms the scan timer
    pub(crate) fn start(&mut self, interval: Duration, schedule: impl FnOnce(Duration, TimerToken)) {
        if self.running {
            return;
        }
        self.running = true;
        debug!(?interval, "start wifi scanner");
        schedule(interval, TimerToken::WifiScan);
    }

    pub(crate) fn stop(&mut self, cancel: impl FnOnce(TimerToken)) {
        if !self.running {
            return;
        }
        self.running = false;
        debug!("stop wifi scanner");
        cancel(TimerToken::WifiScan);
    }

    /// Scan timer fired: scan now and re-arm
    pub(crate) fn on_timer(
        &mut self,
        wifi: &dyn WifiControl,
        interval: Duration,
        schedule: impl FnOnce(Duration, TimerToken),
    ) {
        if !self.running {
            return;
        }
        trace!("wake up for wifi scanning");
        wifi.start_scan();
        schedule(interval, TimerToken::WifiScan);
    }
}

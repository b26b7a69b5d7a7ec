//! Platform resources the manager drives but does not own
//!
//! Everything the host environment provides is gathered in [`Platform`] and
//! handed to [`EndpointManager::new`](crate::EndpointManager::new).

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use tracing::debug;

use crate::config::EndpointConfig;
use crate::events::Broadcaster;
use crate::session::SessionGroupFactory;
use crate::timer::WakeupTimer;

/// The OS wake lock
pub trait WakeLockHandle: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// WiFi lock and scanning
pub trait WifiControl: Send + Sync {
    fn acquire_wifi_lock(&self);
    fn release_wifi_lock(&self);
    /// Trigger an active scan so the radio re-associates
    fn start_scan(&self);
}

/// Subscription to connectivity and WiFi-state notifications
pub trait ReceiverControl: Send + Sync {
    fn register_receivers(&self);
    fn unregister_receivers(&self);
}

/// Finds the address of the interface that carries SIP traffic
pub trait LocalAddressResolver: Send + Sync {
    /// `None` while there is no route
    fn local_ip(&self) -> Option<IpAddr>;
}

/// Learns the local address by connecting a UDP socket towards a probe address;
/// connecting a datagram socket sends nothing
pub struct UdpRouteResolver {
    probe: SocketAddr,
}

impl UdpRouteResolver {
    pub fn new(probe: SocketAddr) -> Self {
        Self { probe }
    }

    /// Probe towards the configured `route_probe_addr`
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.route_probe_addr)
    }

    pub fn probe_addr(&self) -> SocketAddr {
        self.probe
    }
}

impl LocalAddressResolver for UdpRouteResolver {
    fn local_ip(&self) -> Option<IpAddr> {
        let bind: SocketAddr = if self.probe.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let resolved = UdpSocket::bind(bind)
            .and_then(|socket| {
                socket.connect(self.probe)?;
                socket.local_addr()
            })
            .map(|addr| addr.ip());
        match resolved {
            Ok(ip) if !ip.is_unspecified() => Some(ip),
            Ok(_) => None,
            Err(e) => {
                // a connectivity change should follow
                debug!(probe = %self.probe, error = %e, "cannot determine local address");
                None
            }
        }
    }
}

/// Whether `address` lies in a private IPv4 range (10/8, 172.16/12, 192.168/16)
pub fn is_behind_nat(address: Option<IpAddr>) -> bool {
    match address {
        Some(IpAddr::V4(v4)) => v4.is_private(),
        _ => false,
    }
}

/// Host-provided collaborators
#[derive(Clone)]
pub struct Platform {
    pub session_groups: Arc<dyn SessionGroupFactory>,
    pub timer: Arc<dyn WakeupTimer>,
    pub wake_lock: Arc<dyn WakeLockHandle>,
    pub wifi: Arc<dyn WifiControl>,
    pub receivers: Arc<dyn ReceiverControl>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub local_address: Arc<dyn LocalAddressResolver>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_behind_nat() {
        for addr in ["10.1.2.3", "172.16.0.9", "172.31.255.1", "192.168.1.20"] {
            assert!(is_behind_nat(Some(addr.parse().unwrap())), "{}", addr);
        }
    }

    #[test]
    fn public_and_unknown_addresses_are_not() {
        for addr in ["8.8.8.8", "172.32.0.1", "192.169.0.1", "::1"] {
            assert!(!is_behind_nat(Some(addr.parse().unwrap())), "{}", addr);
        }
        assert!(!is_behind_nat(None));
    }

    #[test]
    fn resolver_probes_the_configured_address() {
        let config = EndpointConfig::from_toml_str(r#"route_probe_addr = "127.0.0.1:5060""#).unwrap();
        let resolver = UdpRouteResolver::from_config(&config);
        assert_eq!(resolver.probe_addr(), "127.0.0.1:5060".parse().unwrap());
        assert_eq!(resolver.local_ip(), Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn loopback_probe_resolves_loopback() {
        let resolver = UdpRouteResolver::new("127.0.0.1:9".parse().unwrap());
        assert_eq!(resolver.local_ip(), Some("127.0.0.1".parse().unwrap()));
    }
}

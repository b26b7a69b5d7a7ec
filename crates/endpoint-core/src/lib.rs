//! # rvoip-endpoint-core
//!
//! SIP endpoint manager: the long-lived service that keeps a device's local SIP
//! identities registered while its network comes and goes.
//!
//! - **Auto-registration**: one registration process per open profile,
//!   refreshing before expiry and retrying with capped exponential backoff.
//! - **NAT keep-alive**: keep-alive sessions for profiles behind NAT, and a
//!   binary search for the longest interval that keeps the NAT mapping alive.
//! - **Connectivity**: debounced network notifications drive every group down
//!   and up again.
//! - **Registry**: per-caller access control, restart with handoff, and a
//!   table of inbound calls waiting for the application.
//!
//! The SIP stack itself is a collaborator: the manager drives it through the
//! traits in [`session`] and the platform resources in [`platform`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_endpoint_core::{
//!     logging::setup_logging,
//!     CallerId, EndpointConfig, EndpointManager, NetworkEvent, NetworkType, Platform, SipProfile,
//! };
//! # fn platform() -> Platform { unimplemented!() }
//!
//! # fn main() -> Result<(), rvoip_endpoint_core::EndpointError> {
//! let config = EndpointConfig::from_file("endpoint.toml")?;
//! setup_logging(&config.logging)?;
//!
//! let manager = EndpointManager::new(config, platform())?;
//! manager.start();
//! manager.open(CallerId(10_001), SipProfile::new("alice", "example.com"))?;
//! manager.on_network_event(NetworkEvent::connected(NetworkType::Wifi));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod executor;
pub mod keepalive;
pub mod logging;
pub mod manager;
pub mod platform;
pub mod profile;
pub mod registration;
pub mod registry;
pub mod session;
pub mod timer;
pub mod wake_lock;
mod wifi;

pub use config::{EndpointConfig, PHONE_CALLER_ID};
pub use connectivity::{NetworkEvent, NetworkState, NetworkType};
pub use error::{EndpointError, EndpointResult};
pub use events::{
    Broadcaster, EndpointBroadcast, IncomingCall, IncomingCallTarget, RegistrationListener,
    RegistrationStatus,
};
pub use manager::EndpointManager;
pub use platform::{
    LocalAddressResolver, Platform, ReceiverControl, UdpRouteResolver, WakeLockHandle, WifiControl,
};
pub use profile::{CallerId, SipProfile, TransportProtocol};
pub use registration::RegistrationSnapshot;
pub use registry::GroupId;
pub use session::{
    KeepAliveCallback, SessionGroupFactory, SessionId, SessionListener, SessionState, SipErrorCode,
    SipSession, SipSessionGroup,
};
pub use timer::{TimerToken, TokioWakeupTimer, WakeupTimer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Application-facing notifications
//!
//! Registration progress is reported per profile through a
//! [`RegistrationListener`]; inbound calls go to the profile's
//! [`IncomingCallTarget`]; service-wide announcements go out through a
//! [`Broadcaster`].
//!
//! Listener methods run after the manager has released its state lock, on
//! the thread that caused the change. They may query or drive the manager.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EndpointResult;
use crate::session::{SessionState, SipErrorCode};

/// Registration progress of a local profile
pub trait RegistrationListener: Send + Sync {
    fn on_registering(&self, profile_uri: &str);

    /// Registered; the binding lasts another `duration` seconds
    fn on_registration_done(&self, profile_uri: &str, duration: u32);

    fn on_registration_failed(&self, profile_uri: &str, code: SipErrorCode, message: &str);

    fn on_registration_timeout(&self, profile_uri: &str);
}

/// Registration outcome or status as delivered to a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// A REGISTER or un-REGISTER is in flight
    Registering,
    /// Registered with this many seconds left
    Registered { remaining_secs: u32 },
    /// Last attempt timed out
    TimedOut,
    /// Last attempt failed
    Failed { code: SipErrorCode, message: String },
    /// No data connection
    Disconnected,
    /// Auto-registration is not running
    NotRunning,
    /// Running but between attempts
    InProgress { state: SessionState },
}

impl RegistrationStatus {
    /// Deliver this status through the matching listener callback
    pub fn replay(&self, listener: &dyn RegistrationListener, profile_uri: &str) {
        match self {
            RegistrationStatus::Registering => listener.on_registering(profile_uri),
            RegistrationStatus::Registered { remaining_secs } => {
                listener.on_registration_done(profile_uri, *remaining_secs)
            }
            RegistrationStatus::TimedOut => listener.on_registration_timeout(profile_uri),
            RegistrationStatus::Failed { code, message } => {
                listener.on_registration_failed(profile_uri, *code, message)
            }
            RegistrationStatus::Disconnected => listener.on_registration_failed(
                profile_uri,
                SipErrorCode::DataConnectionLost,
                "no data connection",
            ),
            RegistrationStatus::NotRunning => listener.on_registration_failed(
                profile_uri,
                SipErrorCode::ClientError,
                "registration not running",
            ),
            RegistrationStatus::InProgress { state } => listener.on_registration_failed(
                profile_uri,
                SipErrorCode::InProgress,
                &state.to_string(),
            ),
        }
    }
}

/// An inbound call waiting for the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    /// Key to fetch the session with `pending_session`
    pub call_id: String,
    /// Caller's SDP offer
    pub session_description: String,
}

/// Where a profile's inbound calls are delivered
pub trait IncomingCallTarget: Send + Sync {
    /// Fails with [`EndpointError::TargetCanceled`](crate::EndpointError::TargetCanceled)
    /// when the application no longer accepts calls; the call is then ended
    fn send(&self, call: IncomingCall) -> EndpointResult<()>;
}

/// Service-wide announcements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointBroadcast {
    ServiceUp,
    ProfileAdded { profile_uri: String },
    ProfileRemoved { profile_uri: String },
}

impl fmt::Display for EndpointBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointBroadcast::ServiceUp => write!(f, "service up"),
            EndpointBroadcast::ProfileAdded { profile_uri } => {
                write!(f, "profile added: {}", profile_uri)
            }
            EndpointBroadcast::ProfileRemoved { profile_uri } => {
                write!(f, "profile removed: {}", profile_uri)
            }
        }
    }
}

/// Fire-and-forget delivery of [`EndpointBroadcast`]s
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event: EndpointBroadcast);
}

//! Interfaces consumed from the SIP session layer
//!
//! The endpoint manager does not speak SIP itself. A session layer (transaction
//! and dialog engine) supplies [`SipSessionGroup`]s bound to a local profile and
//! the [`SipSession`]s created from them, and reports what happens on the wire
//! through [`SessionListener`] and [`KeepAliveCallback`].
//!
//! Implementations must not invoke listener or callback methods synchronously
//! from inside a method the manager is calling on them; events are expected to
//! arrive from the session layer's own threads.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EndpointResult;
use crate::profile::SipProfile;

/// Identity of a session object, used to detect events from superseded sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a SIP session as reported by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    ReadyToCall,
    Registering,
    Deregistering,
    IncomingCall,
    IncomingCallAnswering,
    OutgoingCall,
    OutgoingCallRingBack,
    OutgoingCallCanceling,
    InCall,
    Pinging,
    EndingCall,
    NotDefined,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::ReadyToCall => "READY_TO_CALL",
            SessionState::Registering => "REGISTERING",
            SessionState::Deregistering => "DEREGISTERING",
            SessionState::IncomingCall => "INCOMING_CALL",
            SessionState::IncomingCallAnswering => "INCOMING_CALL_ANSWERING",
            SessionState::OutgoingCall => "OUTGOING_CALL",
            SessionState::OutgoingCallRingBack => "OUTGOING_CALL_RING_BACK",
            SessionState::OutgoingCallCanceling => "OUTGOING_CALL_CANCELING",
            SessionState::InCall => "IN_CALL",
            SessionState::Pinging => "PINGING",
            SessionState::EndingCall => "ENDING_CALL",
            SessionState::NotDefined => "NOT_DEFINED",
        };
        f.write_str(name)
    }
}

/// Error codes reported by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SipErrorCode {
    NoError,
    SocketError,
    ServerError,
    TransactionTerminated,
    ClientError,
    TimeOut,
    InvalidRemoteUri,
    PeerNotReachable,
    InvalidCredentials,
    InProgress,
    DataConnectionLost,
    CrossDomainAuthentication,
    ServerUnreachable,
}

impl SipErrorCode {
    /// Failures that need the user to fix something before retrying
    pub fn pauses_registration(self) -> bool {
        matches!(
            self,
            SipErrorCode::InvalidCredentials | SipErrorCode::ServerUnreachable
        )
    }
}

impl fmt::Display for SipErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipErrorCode::NoError => "NO_ERROR",
            SipErrorCode::SocketError => "SOCKET_ERROR",
            SipErrorCode::ServerError => "SERVER_ERROR",
            SipErrorCode::TransactionTerminated => "TRANSACTION_TERMINATED",
            SipErrorCode::ClientError => "CLIENT_ERROR",
            SipErrorCode::TimeOut => "TIME_OUT",
            SipErrorCode::InvalidRemoteUri => "INVALID_REMOTE_URI",
            SipErrorCode::PeerNotReachable => "PEER_NOT_REACHABLE",
            SipErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            SipErrorCode::InProgress => "IN_PROGRESS",
            SipErrorCode::DataConnectionLost => "DATA_CONNECTION_LOST",
            SipErrorCode::CrossDomainAuthentication => "CROSS_DOMAIN_AUTHENTICATION",
            SipErrorCode::ServerUnreachable => "SERVER_UNREACHABLE",
        };
        f.write_str(name)
    }
}

/// Events a session reports to whoever is bound to it
///
/// Every method has an empty default so sinks only implement what they consume.
pub trait SessionListener: Send + Sync {
    /// A REGISTER (or un-REGISTER) transaction is in flight
    fn on_registering(&self, _session: &Arc<dyn SipSession>) {}

    /// Registrar accepted the binding for `duration` seconds; 0 asks for an
    /// immediate refresh
    fn on_registration_done(&self, _session: &Arc<dyn SipSession>, _duration: u32) {}

    fn on_registration_failed(
        &self,
        _session: &Arc<dyn SipSession>,
        _code: SipErrorCode,
        _message: &str,
    ) {
    }

    fn on_registration_timeout(&self, _session: &Arc<dyn SipSession>) {}

    /// Inbound INVITE on a group opened to receive calls
    fn on_ringing(
        &self,
        _session: &Arc<dyn SipSession>,
        _caller: &SipProfile,
        _session_description: &str,
    ) {
    }

    fn on_error(&self, _session: &Arc<dyn SipSession>, _code: SipErrorCode, _message: &str) {}
}

/// Results of a session's native keep-alive process
pub trait KeepAliveCallback: Send + Sync {
    /// A keep-alive was answered; `port_changed` is set when the port the
    /// registrar saw differs from the previous answer
    fn on_response(&self, port_changed: bool);

    fn on_error(&self, code: SipErrorCode, message: &str);
}

/// A single SIP session
pub trait SipSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn call_id(&self) -> Option<String>;

    fn state(&self) -> SessionState;

    fn local_profile(&self) -> SipProfile;

    /// Bind or clear the event sink
    fn set_listener(&self, listener: Option<Arc<dyn SessionListener>>);

    fn register(&self, expiry_secs: u32);

    fn unregister(&self);

    fn end_call(&self);

    fn start_keep_alive(
        &self,
        interval_secs: u32,
        callback: Arc<dyn KeepAliveCallback>,
    ) -> EndpointResult<()>;

    fn stop_keep_alive(&self);

    /// New session sharing this session's transport and profile
    fn duplicate(&self) -> Arc<dyn SipSession>;
}

/// Session-handling unit bound to one local profile
pub trait SipSessionGroup: Send + Sync {
    fn local_profile(&self) -> SipProfile;

    fn local_profile_uri(&self) -> String {
        self.local_profile().uri()
    }

    /// `None` when the group has no usable transport
    fn create_session(
        &self,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Option<Arc<dyn SipSession>>;

    /// Start accepting inbound calls, reported through `listener`
    fn open_to_receive_calls(&self, listener: Arc<dyn SessionListener>) -> EndpointResult<()>;

    /// Tear down transport state after a network change
    fn on_connectivity_changed(&self);

    /// Rebind the transport to `local_ip` (or an unspecified address)
    fn reset(&self, local_ip: Option<IpAddr>) -> EndpointResult<()>;

    fn close(&self);

    fn contains_session(&self, call_id: &str) -> bool;
}

/// Creates session groups; errors that satisfy
/// [`EndpointError::is_transport`](crate::EndpointError::is_transport) make the
/// manager retry without a local address
pub trait SessionGroupFactory: Send + Sync {
    fn create_group(
        &self,
        local_ip: Option<IpAddr>,
        profile: SipProfile,
        password: &str,
    ) -> EndpointResult<Arc<dyn SipSessionGroup>>;
}

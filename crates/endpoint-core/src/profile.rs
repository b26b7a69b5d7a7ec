//! Local SIP identities
//!
//! A [`SipProfile`] is what an application submits when it opens an identity
//! with the endpoint manager. The manager never keeps the password beyond group
//! creation; everything it stores or logs is a [`SipProfile::redacted`] copy.
//!
//! ```rust
//! use rvoip_endpoint_core::profile::{SipProfile, TransportProtocol};
//!
//! let profile = SipProfile::new("alice", "example.com")
//!     .with_password("secret")
//!     .with_protocol(TransportProtocol::Tcp)
//!     .with_auto_registration(true);
//!
//! assert_eq!(profile.uri(), "sip:alice@example.com");
//! assert_eq!(profile.redacted().password(), "*");
//! assert!(profile.validate().is_ok());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EndpointError, EndpointResult};

/// Placeholder stored instead of the real password
pub const REDACTED_PASSWORD: &str = "*";

/// Identity of the process calling into the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallerId(pub u32);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport used to reach the registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// A local SIP identity and its registration settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipProfile {
    user_name: String,
    domain: String,
    password: String,
    auth_user_name: Option<String>,
    display_name: Option<String>,
    protocol: TransportProtocol,
    port: u16,
    auto_registration: bool,
    send_keep_alive: bool,
    calling_uid: Option<CallerId>,
}

impl SipProfile {
    /// Create a profile for `user_name@domain` with auto-registration enabled
    pub fn new(user_name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            domain: domain.into(),
            password: String::new(),
            auth_user_name: None,
            display_name: None,
            protocol: TransportProtocol::Udp,
            port: 5060,
            auto_registration: true,
            send_keep_alive: false,
            calling_uid: None,
        }
    }

    /// Parse a `sip:user@domain[:port]` URI into a profile
    pub fn from_uri(uri: &str) -> EndpointResult<Self> {
        let rest = uri
            .strip_prefix("sip:")
            .ok_or_else(|| EndpointError::invalid_profile(format!("not a sip URI: {}", uri)))?;
        let (user, host) = rest
            .split_once('@')
            .ok_or_else(|| EndpointError::invalid_profile(format!("missing user part: {}", uri)))?;
        let (domain, port) = match host.rsplit_once(':') {
            Some((domain, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    EndpointError::invalid_profile(format!("bad port in {}", uri))
                })?;
                (domain, port)
            }
            None => (host, 5060),
        };
        let profile = Self::new(user, domain).with_port(port);
        profile.validate()?;
        Ok(profile)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_auth_user_name(mut self, name: impl Into<String>) -> Self {
        self.auth_user_name = Some(name.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auto_registration(mut self, enabled: bool) -> Self {
        self.auto_registration = enabled;
        self
    }

    pub fn with_send_keep_alive(mut self, enabled: bool) -> Self {
        self.send_keep_alive = enabled;
        self
    }

    /// The identity key: `sip:user@domain`
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.user_name, self.domain)
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn auth_user_name(&self) -> &str {
        self.auth_user_name.as_deref().unwrap_or(&self.user_name)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn auto_registration(&self) -> bool {
        self.auto_registration
    }

    pub fn send_keep_alive(&self) -> bool {
        self.send_keep_alive
    }

    /// Caller that opened this profile, stamped by the manager
    pub fn calling_uid(&self) -> Option<CallerId> {
        self.calling_uid
    }

    pub(crate) fn set_calling_uid(&mut self, caller: CallerId) {
        self.calling_uid = Some(caller);
    }

    /// Copy with the password replaced by [`REDACTED_PASSWORD`]
    pub fn redacted(&self) -> Self {
        Self {
            password: REDACTED_PASSWORD.to_string(),
            ..self.clone()
        }
    }

    /// Reject profiles that cannot name a registrable identity
    pub fn validate(&self) -> EndpointResult<()> {
        if self.user_name.is_empty() {
            return Err(EndpointError::invalid_profile("user name is empty"));
        }
        if self.domain.is_empty() {
            return Err(EndpointError::invalid_profile("domain is empty"));
        }
        let illegal = |c: char| c.is_whitespace() || c == '@' || c == ':' || c == ';';
        if self.user_name.contains(illegal) {
            return Err(EndpointError::invalid_profile(format!(
                "illegal character in user name {:?}",
                self.user_name
            )));
        }
        if self.domain.contains(illegal) {
            return Err(EndpointError::invalid_profile(format!(
                "illegal character in domain {:?}",
                self.domain
            )));
        }
        if self.port == 0 {
            return Err(EndpointError::invalid_profile("port must be non-zero"));
        }
        Ok(())
    }
}

// Never print the password.
impl fmt::Debug for SipProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipProfile")
            .field("uri", &self.uri())
            .field("auth_user_name", &self.auth_user_name)
            .field("display_name", &self.display_name)
            .field("protocol", &self.protocol)
            .field("port", &self.port)
            .field("auto_registration", &self.auto_registration)
            .field("send_keep_alive", &self.send_keep_alive)
            .field("calling_uid", &self.calling_uid)
            .finish()
    }
}

impl fmt::Display for SipProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

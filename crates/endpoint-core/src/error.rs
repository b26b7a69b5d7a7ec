//! Error types for the endpoint manager

use thiserror::Error;

/// Result type for endpoint manager operations
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Errors that can occur in the endpoint manager
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    /// Caller is neither the profile creator nor a privileged caller
    #[error("Caller {caller} is not allowed to access profile {profile_uri}")]
    Unauthorized { profile_uri: String, caller: u32 },

    /// Profile failed validation when it was submitted
    #[error("Invalid profile: {reason}")]
    InvalidProfile { reason: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Socket or address failure reported by the session layer
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Incoming-call target no longer accepts deliveries
    #[error("Incoming call target canceled: {message}")]
    TargetCanceled { message: String },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EndpointError {
    /// Create an authorization error
    pub fn unauthorized(profile_uri: impl Into<String>, caller: u32) -> Self {
        Self::Unauthorized {
            profile_uri: profile_uri.into(),
            caller,
        }
    }

    /// Create an invalid profile error
    pub fn invalid_profile(reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failure came from the network and may go away with a
    /// different local address
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether the caller was refused
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

impl From<std::io::Error> for EndpointError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

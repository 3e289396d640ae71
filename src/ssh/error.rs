//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {message} (code {code})")]
    Handshake { code: i32, message: String },

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Channel error: {message} (code {code})")]
    Channel { code: i32, message: String },

    /// The remote side closed the channel; normal termination.
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Resource ordering violation: {0}")]
    ResourceOrdering(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether the caller may simply try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, SshError::Timeout(_) | SshError::ConnectionFailed(_))
    }

    /// Native engine code, when the error came from the engine
    pub fn native_code(&self) -> Option<i32> {
        match self {
            SshError::Handshake { code, .. } | SshError::Channel { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ssh_key::Error> for SshError {
    fn from(err: ssh_key::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

// Serialized as its display string for callers that forward errors as JSON
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

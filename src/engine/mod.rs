//! Protocol Engine Binding
//!
//! The SSH wire protocol is delegated to an external, non-blocking protocol
//! engine. This module defines the narrow surface the rest of the crate needs
//! from it, as safe typed operations.
//!
//! # Architecture
//!
//! ```text
//! ProtocolEngine ──open_session(fd)──▶ EngineSession ──open_channel()──▶ EngineChannel
//!                                          │                                │
//!                                   handshake / userauth            read / write / pty
//! ```
//!
//! Every call that can stall returns [`EngineError::WouldBlock`] carrying the
//! socket direction the engine is waiting on. Nothing in this module waits;
//! the multiplexer turns would-block results into readiness waits.
//!
//! Engine objects are `Send` but not `Sync`: a session and its channels are
//! moved onto one thread and only ever touched from there.

mod libssh2;

#[cfg(test)]
pub(crate) mod fake;

use std::os::fd::BorrowedFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ssh::{KeyboardInteractiveHandler, SshKey};

pub use self::libssh2::Libssh2Engine;

/// Native error codes reported by the engine.
pub mod codes {
    use libssh2_sys as raw;

    pub const KEX_FAILURE: i32 = raw::LIBSSH2_ERROR_KEX_FAILURE;
    pub const TIMEOUT: i32 = raw::LIBSSH2_ERROR_TIMEOUT;
    pub const SOCKET_DISCONNECT: i32 = raw::LIBSSH2_ERROR_SOCKET_DISCONNECT;
    pub const AUTHENTICATION_FAILED: i32 = raw::LIBSSH2_ERROR_AUTHENTICATION_FAILED;
    pub const PUBLICKEY_UNVERIFIED: i32 = raw::LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED;
    pub const CHANNEL_FAILURE: i32 = raw::LIBSSH2_ERROR_CHANNEL_FAILURE;
    pub const CHANNEL_REQUEST_DENIED: i32 = raw::LIBSSH2_ERROR_CHANNEL_REQUEST_DENIED;
    pub const CHANNEL_CLOSED: i32 = raw::LIBSSH2_ERROR_CHANNEL_CLOSED;
    pub const CHANNEL_EOF_SENT: i32 = raw::LIBSSH2_ERROR_CHANNEL_EOF_SENT;
    pub const SOCKET_TIMEOUT: i32 = raw::LIBSSH2_ERROR_SOCKET_TIMEOUT;
    pub const REQUEST_DENIED: i32 = raw::LIBSSH2_ERROR_REQUEST_DENIED;
    pub const INVAL: i32 = raw::LIBSSH2_ERROR_INVAL;
    pub const EAGAIN: i32 = raw::LIBSSH2_ERROR_EAGAIN;
    pub const BAD_USE: i32 = raw::LIBSSH2_ERROR_BAD_USE;
    pub const SOCKET_RECV: i32 = raw::LIBSSH2_ERROR_SOCKET_RECV;
}

/// Socket direction an engine call is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockDirection {
    Inbound,
    Outbound,
    Both,
}

impl BlockDirection {
    pub fn wants_read(self) -> bool {
        matches!(self, BlockDirection::Inbound | BlockDirection::Both)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, BlockDirection::Outbound | BlockDirection::Both)
    }
}

/// Status of a failed engine call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Not ready yet; retry once the socket is ready in the given direction.
    #[error("Operation would block ({0:?})")]
    WouldBlock(BlockDirection),

    /// Hard failure, with the engine's native code and message.
    #[error("[{code}] {message}")]
    Native { code: i32, message: String },
}

impl EngineError {
    pub fn native(code: i32, message: impl Into<String>) -> Self {
        EngineError::Native {
            code,
            message: message.into(),
        }
    }

    /// Native error code, `None` for would-block
    pub fn code(&self) -> Option<i32> {
        match self {
            EngineError::WouldBlock(_) => None,
            EngineError::Native { code, .. } => Some(*code),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Algorithm classes negotiated during key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodType {
    Kex,
    HostKey,
    CryptCs,
    CryptSc,
    MacCs,
    MacSc,
    CompCs,
    CompSc,
    LangCs,
    LangSc,
    SignAlgo,
}

impl MethodType {
    /// Classes agreed on by key exchange (everything but signature preferences).
    pub const NEGOTIATED: [MethodType; 10] = [
        MethodType::Kex,
        MethodType::HostKey,
        MethodType::CryptCs,
        MethodType::CryptSc,
        MethodType::MacCs,
        MethodType::MacSc,
        MethodType::CompCs,
        MethodType::CompSc,
        MethodType::LangCs,
        MethodType::LangSc,
    ];
}

/// Type of the server's host key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyType {
    Unknown,
    Rsa,
    Dss,
    Ecdsa256,
    Ecdsa384,
    Ecdsa521,
    Ed25519,
}

impl HostKeyType {
    /// Key type name as written in `known_hosts`
    pub fn name(self) -> &'static str {
        match self {
            HostKeyType::Unknown => "unknown",
            HostKeyType::Rsa => "ssh-rsa",
            HostKeyType::Dss => "ssh-dss",
            HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
            HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
            HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
            HostKeyType::Ed25519 => "ssh-ed25519",
        }
    }
}

/// What to do with a channel's extended data (stderr)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedDataPolicy {
    /// Merged into the primary stream in arrival order
    #[default]
    Merge,
    /// Discarded
    Ignore,
    /// Kept on its own stream (id 1)
    Separate,
}

/// SSH_MSG_DISCONNECT reason codes (RFC 4253 §11.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DisconnectReason {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MacError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// Pseudo-terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
    #[serde(default)]
    pub pixel_width: u32,
    #[serde(default)]
    pub pixel_height: u32,
}

impl TerminalSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Signal that terminated the remote process, if any
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitSignal {
    pub signal: Option<String>,
    pub error_message: Option<String>,
    pub lang_tag: Option<String>,
}

/// Entry point into a protocol engine
pub trait ProtocolEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Create a non-blocking session bound to an already connected socket.
    ///
    /// The socket stays owned by the caller and must outlive the session.
    fn open_session(&self, socket: BorrowedFd<'_>) -> EngineResult<Box<dyn EngineSession>>;
}

/// Native session operations
pub trait EngineSession: Send {
    fn set_timeout(&mut self, timeout: Duration);

    /// Set algorithm preferences (comma-separated); only effective before the handshake.
    fn set_method_preference(&mut self, method: MethodType, preferences: &str) -> EngineResult<()>;

    /// Algorithms the engine can offer for `method`
    fn supported_algorithms(&self, method: MethodType) -> EngineResult<Vec<String>>;

    /// Identification string sent to the server; only effective before the handshake.
    fn set_banner(&mut self, banner: &str) -> EngineResult<()>;

    /// Forward the engine's internal protocol trace to `tracing`.
    fn set_trace(&mut self, enabled: bool);

    fn handshake(&mut self) -> EngineResult<()>;

    fn host_key(&self) -> Option<(HostKeyType, Vec<u8>)>;

    fn negotiated_method(&self, method: MethodType) -> Option<String>;

    fn banner(&self) -> Option<String>;

    /// Authentication methods the server still accepts for `username`
    fn auth_methods(&mut self, username: &str) -> EngineResult<Vec<String>>;

    fn is_authenticated(&self) -> bool;

    /// Public key authentication; the engine asks `key` to sign its challenge
    /// synchronously from inside this call.
    fn userauth_publickey(&mut self, username: &str, key: &dyn SshKey) -> EngineResult<()>;

    /// Keyboard-interactive authentication; every prompt round is answered by
    /// `handler` synchronously from inside this call.
    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        handler: &mut dyn KeyboardInteractiveHandler,
    ) -> EngineResult<()>;

    fn open_channel(
        &mut self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
    ) -> EngineResult<Box<dyn EngineChannel>>;

    fn configure_keepalive(&mut self, want_reply: bool, interval_secs: u32);

    /// Send a keepalive if one is due; returns seconds until the next one.
    fn send_keepalive(&mut self) -> EngineResult<u32>;

    fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> EngineResult<()>;

    /// Last error recorded by the engine
    fn last_error(&self) -> Option<EngineError>;
}

/// Native channel operations
pub trait EngineChannel: Send {
    fn request_pty(&mut self, term: &str, size: TerminalSize) -> EngineResult<()>;

    fn resize_pty(&mut self, size: TerminalSize) -> EngineResult<()>;

    fn set_env(&mut self, name: &str, value: &str) -> EngineResult<()>;

    /// Start a process: `shell`, `exec` (with the command as message) or `subsystem`
    fn process_startup(&mut self, request: &str, message: Option<&str>) -> EngineResult<()>;

    fn set_extended_data(&mut self, policy: ExtendedDataPolicy) -> EngineResult<()>;

    /// Returns 0 once the remote side has sent EOF
    fn read(&mut self, stream_id: i32, buf: &mut [u8]) -> EngineResult<usize>;

    /// May accept fewer bytes than offered
    fn write(&mut self, stream_id: i32, buf: &[u8]) -> EngineResult<usize>;

    /// Bytes already received for this channel but not yet read, on any stream
    fn pending_bytes(&self) -> usize;

    fn is_eof(&self) -> bool;

    fn send_eof(&mut self) -> EngineResult<()>;

    fn wait_eof(&mut self) -> EngineResult<()>;

    fn close(&mut self) -> EngineResult<()>;

    fn wait_closed(&mut self) -> EngineResult<()>;

    fn exit_status(&self) -> EngineResult<i32>;

    fn exit_signal(&self) -> EngineResult<ExitSignal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_direction_masks() {
        assert!(BlockDirection::Inbound.wants_read());
        assert!(!BlockDirection::Inbound.wants_write());
        assert!(BlockDirection::Outbound.wants_write());
        assert!(BlockDirection::Both.wants_read() && BlockDirection::Both.wants_write());
    }

    #[test]
    fn test_engine_error_code() {
        assert_eq!(EngineError::WouldBlock(BlockDirection::Inbound).code(), None);
        let err = EngineError::native(codes::AUTHENTICATION_FAILED, "denied");
        assert_eq!(err.code(), Some(-18));
        assert_eq!(err.to_string(), "[-18] denied");
    }

    #[test]
    fn test_host_key_type_names() {
        assert_eq!(HostKeyType::Ed25519.name(), "ssh-ed25519");
        assert_eq!(HostKeyType::Ecdsa384.name(), "ecdsa-sha2-nistp384");
    }

    #[test]
    fn test_extended_data_policy_serde() {
        let policy: ExtendedDataPolicy = serde_json::from_str("\"separate\"").unwrap();
        assert_eq!(policy, ExtendedDataPolicy::Separate);
        assert_eq!(ExtendedDataPolicy::default(), ExtendedDataPolicy::Merge);
    }
}

//! SSH module - sessions, channels and interactive shells
//!
//! The protocol itself runs inside the engine (see [`crate::engine`]); this
//! module drives it over a non-blocking socket and exposes typed operations.
//!
//! # Layers
//! - [`SocketEventMultiplexer`]: waits for socket readiness, a wake signal or
//!   a deadline, and retries would-block engine calls
//! - [`SshSession`]: handshake, host key, authentication, channels, keepalive
//! - [`SshChannel`]: pty, environment, process start, stream I/O, exit status
//! - [`ShellConnection`]: the whole lifecycle of one interactive shell on a
//!   dedicated worker thread, with a [`ShellListener`] for output

mod channel;
mod config;
mod error;
mod key;
pub mod keyboard_interactive;
pub mod known_hosts;
mod multiplexer;
mod session;
mod shell;
pub mod transport;
mod worker;

pub use channel::{ReadStatus, SshChannel, STDERR_STREAM, STDOUT_STREAM};
pub use config::{HostKeyPolicy, ShellConfig, TerminalConfig};
pub use error::SshError;
pub use key::{KeyKind, OpenSshKey, SshKey};
pub use keyboard_interactive::{KbiPrompt, KeyboardInteractiveHandler, StaticResponse};
pub use known_hosts::{
    AcceptAnyHostKey, HostKey, HostKeyVerification, HostKeyVerifier, KnownHostsStore,
};
pub use multiplexer::{Deadline, DriveError, SocketEventMultiplexer, WaitOutcome, WakeSignal};
pub use session::{AuthOutcome, SessionState, SshSession};
pub use shell::{ConnectionState, ShellConnection, ShellListener};
pub use transport::{ConnectContext, SocketConnector, TcpConnector, Transport};

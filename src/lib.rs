//! oxide-ssh - SSH transport core
//!
//! Drives a native, non-blocking SSH protocol engine (libssh2) from Rust:
//! socket readiness multiplexing, typed session and channel handles with
//! enforced release order, and a ready-made interactive shell connection.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oxide_ssh::{OpenSshKey, ShellConfig, ShellConnection, ShellListener, SshError};
//!
//! struct Print;
//!
//! impl ShellListener for Print {
//!     fn on_receive(&self, data: &[u8]) {
//!         print!("{}", String::from_utf8_lossy(data));
//!     }
//!
//!     fn on_error(&self, error: SshError) {
//!         eprintln!("connection failed: {}", error);
//!     }
//! }
//!
//! # async fn demo() -> Result<(), SshError> {
//! let key = OpenSshKey::load("/home/alice/.ssh/id_ed25519", None)?;
//! let config = ShellConfig::new("example.com", 22, "alice");
//! let shell = ShellConnection::new(config, Arc::new(key), Arc::new(Print));
//! shell.connect().await?;
//! shell.send("uname -a\n").await?;
//! shell.close();
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("oxide-ssh requires a Unix platform (poll(2) based socket multiplexing)");

pub mod engine;
pub mod handles;
pub mod ssh;

pub use engine::{ExtendedDataPolicy, Libssh2Engine, ProtocolEngine, TerminalSize};
pub use handles::{HandleRegistry, OrderingPolicy};
pub use ssh::{
    ConnectionState, HostKeyPolicy, KeyKind, OpenSshKey, ShellConfig, ShellConnection,
    ShellListener, SshChannel, SshError, SshKey, SshSession,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

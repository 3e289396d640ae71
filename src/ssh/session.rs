//! SSH Session
//!
//! Drives one native session through its lifecycle on top of the
//! multiplexer:
//!
//! ```text
//! Created ─▶ Handshaking ─▶ Authenticating ─▶ Ready ─▶ Disconnecting ─▶ Disconnected
//!    └───────────┴──────────────┴──────────────┴─────────▶ Faulted
//! ```
//!
//! Every blocking step takes a timeout and fails with [`SshError::Timeout`]
//! once it runs out. A failed handshake or authentication leaves the session
//! `Faulted`; it cannot be used for anything but release afterwards.

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::channel::SshChannel;
use super::error::SshError;
use super::key::SshKey;
use super::keyboard_interactive::KeyboardInteractiveHandler;
use super::known_hosts::HostKey;
use super::multiplexer::{Deadline, DriveError, SocketEventMultiplexer, WakeSignal};
use crate::engine::{codes, DisconnectReason, MethodType, ProtocolEngine};
use crate::handles::{HandleId, HandleRegistry, SessionHandle};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Handshaking,
    Authenticating,
    Ready,
    Disconnecting,
    Disconnected,
    Faulted,
}

/// Result of a public key attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    /// The key was accepted but the server wants another factor
    PartialSuccess { methods: Vec<String> },
}

/// An SSH session over a caller-owned socket
pub struct SshSession<'s> {
    handle: Option<SessionHandle>,
    socket: BorrowedFd<'s>,
    wake: Option<&'s WakeSignal>,
    registry: Arc<HandleRegistry>,
    state: SessionState,
    host_key: Option<HostKey>,
}

impl<'s> SshSession<'s> {
    /// Create a session bound to `socket`, which must already be connected
    /// and non-blocking.
    pub fn new(
        engine: &dyn ProtocolEngine,
        socket: BorrowedFd<'s>,
        registry: Arc<HandleRegistry>,
    ) -> Result<Self, SshError> {
        let native = engine.open_session(socket).map_err(|e| {
            SshError::ConnectionFailed(format!("Failed to create {} session: {}", engine.name(), e))
        })?;
        let handle = SessionHandle::new(native, registry.clone(), engine.name());
        debug!("Session handle {} created", handle.id());

        Ok(Self {
            handle: Some(handle),
            socket,
            wake: None,
            registry,
            state: SessionState::Created,
            host_key: None,
        })
    }

    /// Let `wake` interrupt this session's waits (and those of its channels).
    pub fn with_wake_signal(mut self, wake: &'s WakeSignal) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(SessionHandle::id)
    }

    /// Host key presented during the handshake
    pub fn host_key(&self) -> Option<&HostKey> {
        self.host_key.as_ref()
    }

    fn handle(&mut self) -> Result<&mut SessionHandle, SshError> {
        self.handle.as_mut().ok_or(SshError::Disconnected)
    }

    fn fault(&mut self, err: SshError) -> SshError {
        debug!("Session faulted: {}", err);
        self.state = SessionState::Faulted;
        err
    }

    /// Timeout for the engine's own blocking calls (release, mostly)
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), SshError> {
        self.handle()?.engine().set_timeout(timeout);
        Ok(())
    }

    /// Algorithm preference list for one method class; only before the handshake.
    pub fn set_method_preference(
        &mut self,
        method: MethodType,
        preferences: &str,
    ) -> Result<(), SshError> {
        if self.state != SessionState::Created {
            return Err(SshError::InvalidOperation(format!(
                "Algorithm preferences must be set before the handshake (state {:?})",
                self.state
            )));
        }
        self.handle()?
            .engine()
            .set_method_preference(method, preferences)
            .map_err(|e| SshError::InvalidOperation(format!("{:?} preference rejected: {}", method, e)))
    }

    /// Algorithms the engine can offer for one method class
    pub fn supported_algorithms(&self, method: MethodType) -> Result<Vec<String>, SshError> {
        let handle = self.handle.as_ref().ok_or(SshError::Disconnected)?;
        handle
            .engine_ref()
            .supported_algorithms(method)
            .map_err(|e| SshError::InvalidOperation(format!("No {:?} algorithm list: {}", method, e)))
    }

    /// Replace the identification string sent to the server; only before the handshake.
    pub fn set_banner(&mut self, banner: &str) -> Result<(), SshError> {
        if self.state != SessionState::Created {
            return Err(SshError::InvalidOperation(format!(
                "Banner must be set before the handshake (state {:?})",
                self.state
            )));
        }
        self.handle()?
            .engine()
            .set_banner(banner)
            .map_err(|e| match e.code() {
                Some(code) => SshError::Handshake {
                    code,
                    message: format!("Banner rejected: {}", e),
                },
                None => SshError::InvalidOperation(format!("Banner rejected: {}", e)),
            })
    }

    /// Route the engine's protocol trace into `tracing`
    pub fn set_engine_trace(&mut self, enabled: bool) -> Result<(), SshError> {
        self.handle()?.engine().set_trace(enabled);
        Ok(())
    }

    /// Exchange keys with the server and return its host key for verification.
    pub fn handshake(&mut self, timeout: Duration) -> Result<&HostKey, SshError> {
        if self.state != SessionState::Created {
            return Err(SshError::InvalidOperation(format!(
                "Handshake in state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Handshaking;

        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        let result = mux.drive(Deadline::after(timeout), || handle.engine().handshake());
        if let Err(e) = result {
            let err = e.into_ssh_error("Handshake", |code, message| SshError::Handshake {
                code,
                message,
            });
            return Err(self.fault(err));
        }

        let Some((key_type, key)) = self.handle()?.engine_ref().host_key() else {
            let err = SshError::Handshake {
                code: codes::KEX_FAILURE,
                message: "Server did not present a host key".to_string(),
            };
            return Err(self.fault(err));
        };

        let host_key = HostKey::new(key_type, key);
        info!(
            "Handshake complete: kex {}, host key {} {}",
            self.negotiated_method(MethodType::Kex).unwrap_or_default(),
            host_key.key_type.name(),
            host_key.fingerprint
        );
        self.state = SessionState::Authenticating;
        Ok(self.host_key.insert(host_key))
    }

    fn negotiated_method(&self, method: MethodType) -> Option<String> {
        self.handle
            .as_ref()
            .and_then(|h| h.engine_ref().negotiated_method(method))
    }

    /// Algorithms agreed on for every negotiated method class
    pub fn negotiated_algorithms(&self) -> Vec<(MethodType, String)> {
        MethodType::NEGOTIATED
            .iter()
            .filter_map(|&m| self.negotiated_method(m).map(|alg| (m, alg)))
            .collect()
    }

    /// Banner sent by the server
    pub fn banner(&self) -> Option<String> {
        self.handle.as_ref().and_then(|h| h.engine_ref().banner())
    }

    fn require_authenticating(&self) -> Result<(), SshError> {
        match self.state {
            SessionState::Authenticating => Ok(()),
            SessionState::Ready => Err(SshError::InvalidOperation(
                "Session is already authenticated".to_string(),
            )),
            state => Err(SshError::InvalidOperation(format!(
                "Authentication in state {:?}",
                state
            ))),
        }
    }

    /// Authentication methods the server still accepts for `username`
    pub fn auth_methods(&mut self, username: &str, timeout: Duration) -> Result<Vec<String>, SshError> {
        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        mux.drive(Deadline::after(timeout), || handle.engine().auth_methods(username))
            .map_err(|e| {
                e.into_ssh_error("Authentication method query", |_, message| {
                    SshError::AuthenticationFailed(message)
                })
            })
    }

    /// Offer `key`; the server's challenge is signed by the key itself.
    pub fn authenticate_with_key(
        &mut self,
        username: &str,
        key: &dyn SshKey,
        timeout: Duration,
    ) -> Result<AuthOutcome, SshError> {
        self.require_authenticating()?;
        let deadline = Deadline::after(timeout);

        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        let result = mux.drive(deadline, || handle.engine().userauth_publickey(username, key));

        match result {
            Ok(()) => {
                info!("Authenticated as {} with {} key", username, key.algorithm());
                self.state = SessionState::Ready;
                Ok(AuthOutcome::Authenticated)
            }
            Err(DriveError::Engine { code, message })
                if code == codes::PUBLICKEY_UNVERIFIED =>
            {
                let methods = match deadline.remaining() {
                    Some(left) => self.auth_methods(username, left),
                    None => self.auth_methods(username, timeout),
                };
                match methods {
                    Ok(methods) if methods.iter().any(|m| m == "keyboard-interactive") => {
                        info!(
                            "Key accepted for {}, server requires further authentication: {:?}",
                            username, methods
                        );
                        Ok(AuthOutcome::PartialSuccess { methods })
                    }
                    Ok(_) => Err(self.fault(SshError::AuthenticationFailed(message))),
                    Err(e) => Err(self.fault(e)),
                }
            }
            Err(e) => {
                let err = e.into_ssh_error("Authentication", |_, message| {
                    SshError::AuthenticationFailed(message)
                });
                warn!("Public key authentication for {} failed: {}", username, err);
                Err(self.fault(err))
            }
        }
    }

    /// Keyboard-interactive authentication; every prompt round is answered
    /// by `handler` before this returns.
    pub fn authenticate_interactive(
        &mut self,
        username: &str,
        handler: &mut dyn KeyboardInteractiveHandler,
        timeout: Duration,
    ) -> Result<(), SshError> {
        self.require_authenticating()?;

        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        let result = mux.drive(Deadline::after(timeout), || {
            handle
                .engine()
                .userauth_keyboard_interactive(username, &mut *handler)
        });

        match result {
            Ok(()) => {
                info!("Authenticated as {} (keyboard-interactive)", username);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                let err = e.into_ssh_error("Authentication", |_, message| {
                    SshError::AuthenticationFailed(message)
                });
                warn!("Keyboard-interactive authentication for {} failed: {}", username, err);
                Err(self.fault(err))
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Open a channel of `kind` (normally `session`).
    pub fn open_channel(
        &mut self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
        timeout: Duration,
    ) -> Result<SshChannel<'s>, SshError> {
        if self.state != SessionState::Ready {
            return Err(SshError::NotAuthenticated);
        }

        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        let native = mux
            .drive(Deadline::after(timeout), || {
                handle.engine().open_channel(kind, window_size, packet_size)
            })
            .map_err(|e| {
                e.into_ssh_error("Channel open", |code, message| SshError::Channel {
                    code,
                    message,
                })
            })?;

        let channel = handle.adopt_channel(native, kind);
        debug!("Channel {} opened on session {}", channel.id(), handle.id());
        Ok(SshChannel::new(
            channel,
            self.socket,
            self.wake,
            self.registry.clone(),
        ))
    }

    /// Ask the engine to send keepalives every `interval_secs` when polled.
    pub fn configure_keepalive(&mut self, want_reply: bool, interval_secs: u32) -> Result<(), SshError> {
        self.handle()?
            .engine()
            .configure_keepalive(want_reply, interval_secs);
        Ok(())
    }

    /// Send a keepalive if one is due; returns seconds until the next.
    pub fn send_keepalive(&mut self, timeout: Duration) -> Result<u32, SshError> {
        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        mux.drive(Deadline::after(timeout), || handle.engine().send_keepalive())
            .map_err(|e| {
                e.into_ssh_error("Keepalive", |code, message| SshError::Channel {
                    code,
                    message,
                })
            })
    }

    /// Notify the server and release the native session.
    ///
    /// The notification is best effort: the session is released even when it
    /// fails, and the failure is returned afterwards. Fails without releasing
    /// anything while channels of this session are still open.
    pub fn disconnect(
        &mut self,
        reason: DisconnectReason,
        description: &str,
        timeout: Duration,
    ) -> Result<(), SshError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };

        let children = self.registry.children_of(handle.id());
        if !children.is_empty() {
            return Err(SshError::ResourceOrdering(format!(
                "Session {} still has open channels {:?}",
                handle.id(),
                children
            )));
        }

        let notify = if matches!(self.state, SessionState::Faulted | SessionState::Created) {
            Ok(())
        } else {
            self.state = SessionState::Disconnecting;
            let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
            mux.drive(Deadline::after(timeout), || {
                handle.engine().disconnect(reason, description)
            })
            .map_err(|e| {
                e.into_ssh_error("Disconnect", |code, message| SshError::Channel {
                    code,
                    message,
                })
            })
        };

        if let Some(handle) = self.handle.take() {
            debug!("Releasing session handle {}", handle.id());
            drop(handle);
        }
        if self.state != SessionState::Faulted {
            self.state = SessionState::Disconnected;
        }
        notify
    }
}

impl std::fmt::Debug for SshSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("handle", &self.handle_id())
            .field("state", &self.state)
            .finish()
    }
}

//! Connection worker
//!
//! One OS thread per [`ShellConnection`](super::ShellConnection). It creates
//! the socket, session and channel, so every native call on them happens on
//! this thread, and it is the only place they are ever touched. Callers talk
//! to it through a command queue plus the wake signal:
//!
//! ```text
//! caller ── WorkerCommand ──▶ mpsc ──┐
//!        ── wake() ─────────▶ pipe ──┤
//!                                    ▼
//!                    ┌─────────── worker loop ───────────┐
//!                    │ commands → write_all / resize     │
//!                    │ poll_read → on_receive            │
//!                    │ wait(socket | wake | keepalive)   │
//!                    └───────────────────────────────────┘
//! ```

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::channel::{ReadStatus, SshChannel, STDERR_STREAM, STDOUT_STREAM};
use super::config::{HostKeyPolicy, ShellConfig};
use super::error::SshError;
use super::key::SshKey;
use super::known_hosts::{HostKey, HostKeyVerification, HostKeyVerifier};
use super::multiplexer::{Deadline, WaitOutcome, WakeSignal};
use super::session::{AuthOutcome, SshSession};
use super::shell::{ConnectionState, ListenerPrompts, ShellListener};
use super::transport::{ConnectContext, SocketConnector};
use crate::engine::{
    BlockDirection, DisconnectReason, ExtendedDataPolicy, MethodType, ProtocolEngine, TerminalSize,
};
use crate::handles::HandleRegistry;

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Chunks delivered per stream before commands and stop requests are checked again
const MAX_CHUNKS_PER_TURN: usize = 16;

/// Upper bound for the disconnect notification on shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests from the connection to its worker
pub(crate) enum WorkerCommand {
    Send {
        data: Vec<u8>,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },
    Resize {
        size: TerminalSize,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },
}

impl WorkerCommand {
    fn reject(self, err: SshError) {
        let reply_tx = match self {
            WorkerCommand::Send { reply_tx, .. } | WorkerCommand::Resize { reply_tx, .. } => {
                reply_tx
            }
        };
        let _ = reply_tx.send(Err(err));
    }
}

/// Session and channel of an established shell; the channel is declared
/// first so it is always dropped first.
struct Shell<'s> {
    channel: SshChannel<'s>,
    session: SshSession<'s>,
}

enum Exit {
    /// Setup failed or was cancelled; nothing was ever reported as connected
    ConnectFailed(SshError),
    /// The remote side ended the shell
    Closed,
    /// `close()` asked the worker to stop
    Stopped,
    /// I/O failed after the connection was established
    Faulted(SshError),
}

enum Drained {
    /// Nothing more right now; `delivered` tells whether this turn handed out data
    Pending {
        direction: BlockDirection,
        delivered: bool,
    },
    More,
    Eof,
}

pub(crate) struct Worker {
    pub id: String,
    pub config: ShellConfig,
    pub key: Arc<dyn SshKey>,
    pub listener: Arc<dyn ShellListener>,
    pub engine: Arc<dyn ProtocolEngine>,
    pub connector: Arc<dyn SocketConnector>,
    pub registry: Arc<HandleRegistry>,
    pub verifier: Arc<dyn HostKeyVerifier>,
    pub state: Arc<Mutex<ConnectionState>>,
    pub locale: Arc<Mutex<Option<String>>>,
    pub wake: Arc<WakeSignal>,
    pub commands: mpsc::UnboundedReceiver<WorkerCommand>,
}

impl Worker {
    pub fn run(mut self, ready_tx: oneshot::Sender<Result<(), SshError>>) {
        info!("Shell worker started for connection {}", self.id);
        let mut ready_tx = Some(ready_tx);
        let wake = self.wake.clone();
        let exit = self.lifecycle(&wake, &mut ready_tx);
        // Socket, session and channel are all released by now
        self.finish(exit, ready_tx);
    }

    fn lifecycle(
        &mut self,
        wake: &WakeSignal,
        ready_tx: &mut Option<oneshot::Sender<Result<(), SshError>>>,
    ) -> Exit {
        // Socket, handshake, authentication and shell startup share one timeout
        let deadline = Deadline::after(self.config.timeout());
        let ctx = ConnectContext {
            deadline,
            wake: Some(wake),
            registry: &self.registry,
        };
        let transport = match self.connector.connect(&self.config.host, self.config.port, ctx) {
            Ok(transport) => transport,
            Err(e) => return Exit::ConnectFailed(e),
        };

        let mut shell = match self.establish(transport.as_fd(), wake, deadline) {
            Ok(shell) => shell,
            Err(e) => return Exit::ConnectFailed(e),
        };

        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                drop(state);
                self.shutdown(shell);
                return Exit::ConnectFailed(SshError::Cancelled);
            }
            *state = ConnectionState::Connected;
        }
        info!(
            "Connection {} established to {}@{}:{}",
            self.id, self.config.username, self.config.host, self.config.port
        );
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }

        let exit = self.pump(&mut shell);
        self.shutdown(shell);
        exit
    }

    fn establish<'s>(
        &self,
        socket: BorrowedFd<'s>,
        wake: &'s WakeSignal,
        deadline: Deadline,
    ) -> Result<Shell<'s>, SshError> {
        let left = || deadline.remaining().unwrap_or(Duration::MAX);

        let mut session = SshSession::new(self.engine.as_ref(), socket, self.registry.clone())?
            .with_wake_signal(wake);
        session.set_engine_trace(self.config.engine_trace)?;
        if let Some(banner) = &self.config.client_banner {
            session.set_banner(banner)?;
        }
        if self.key.algorithm() == "ssh-rsa" {
            // The signer produces SHA-512 RSA signatures
            session.set_method_preference(MethodType::SignAlgo, "rsa-sha2-512")?;
        }

        let host_key = session.handshake(left())?.clone();
        self.check_host_key(&host_key)?;
        self.authenticate(&mut session, deadline)?;

        let mut channel = session.open_channel(
            "session",
            self.config.window_size,
            self.config.packet_size,
            left(),
        )?;
        channel.set_timeout(Some(left()));
        channel.set_extended_data_policy(self.config.extended_data)?;
        channel.request_pty(&self.config.terminal.term, self.config.terminal.size)?;

        if let Some(value) = self.config.locale_variable() {
            match channel.set_environment_variable("LC_ALL", &value) {
                Ok(()) => {
                    debug!("LC_ALL={} accepted on connection {}", value, self.id);
                    *self.locale.lock() = Some(value);
                }
                Err(e @ SshError::Channel { .. }) => {
                    warn!(
                        "Server rejected LC_ALL={} on connection {}, keeping its default locale: {}",
                        value, self.id, e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        channel.start_shell()?;

        if let Some(interval) = self.config.keepalive_interval() {
            let secs = u32::try_from(interval.as_secs()).unwrap_or(u32::MAX);
            session.configure_keepalive(false, secs)?;
        }
        channel.set_timeout(Some(self.config.timeout()));

        Ok(Shell { channel, session })
    }

    fn check_host_key(&self, key: &HostKey) -> Result<(), SshError> {
        let (host, port) = (self.config.host.as_str(), self.config.port);
        let policy = self.config.host_key_policy;
        if policy == HostKeyPolicy::AcceptAny {
            return Ok(());
        }

        match self.verifier.verify(host, port, key) {
            HostKeyVerification::Verified => Ok(()),
            HostKeyVerification::Unknown { fingerprint } if policy == HostKeyPolicy::AcceptNew => {
                info!(
                    "Trusting new {} host key {} for {}:{}",
                    key.key_type.name(),
                    fingerprint,
                    host,
                    port
                );
                if let Err(e) = self.verifier.accept(host, port, key) {
                    warn!("Failed to remember host key for {}:{}: {}", host, port, e);
                }
                Ok(())
            }
            HostKeyVerification::Unknown { fingerprint } => Err(SshError::HostKeyRejected(
                format!("Unknown host key {} for {}:{}", fingerprint, host, port),
            )),
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyRejected(format!(
                "Host key for {}:{} changed: expected {}, got {}",
                host, port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }

    fn authenticate(&self, session: &mut SshSession<'_>, deadline: Deadline) -> Result<(), SshError> {
        let left = || deadline.remaining().unwrap_or(Duration::MAX);
        let username = self.config.username.as_str();

        let methods = session.auth_methods(username, left())?;
        debug!("Server offers {:?} for {}", methods, username);
        let interactive_only = !methods.iter().any(|m| m == "publickey")
            && methods.iter().any(|m| m == "keyboard-interactive");

        if !interactive_only {
            match session.authenticate_with_key(username, self.key.as_ref(), left())? {
                AuthOutcome::Authenticated => return Ok(()),
                AuthOutcome::PartialSuccess { methods } => {
                    debug!("Continuing with keyboard-interactive, remaining {:?}", methods);
                }
            }
        }

        let mut prompts = ListenerPrompts::new(self.listener.as_ref());
        session.authenticate_interactive(username, &mut prompts, left())
    }

    fn pump(&mut self, shell: &mut Shell<'_>) -> Exit {
        let separate = self.config.extended_data == ExtendedDataPolicy::Separate;
        let keepalive = self.config.keepalive_interval();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut closed_waits = 0;
        let mut idle_redrain = false;

        loop {
            if self.wake.is_stopped() {
                return Exit::Stopped;
            }

            while let Ok(command) = self.commands.try_recv() {
                self.execute(shell, command);
            }

            let (direction, mut delivered) =
                match self.drain(&mut shell.channel, STDOUT_STREAM, &mut buf) {
                    Ok(Drained::Pending {
                        direction,
                        delivered,
                    }) => (direction, delivered),
                    Ok(Drained::More) => continue,
                    Ok(Drained::Eof) | Err(SshError::ChannelClosed) => return Exit::Closed,
                    Err(e) => return Exit::Faulted(e),
                };
            if separate {
                match self.drain(&mut shell.channel, STDERR_STREAM, &mut buf) {
                    Ok(Drained::More) => continue,
                    Ok(Drained::Pending { delivered: d, .. }) => delivered |= d,
                    Ok(Drained::Eof) => {}
                    Err(SshError::ChannelClosed) => return Exit::Closed,
                    Err(e) => return Exit::Faulted(e),
                }
                // Reading stderr can pull stdout packets off the socket into
                // the engine's queue, where poll(2) no longer sees them
                if shell.channel.pending_bytes() > 0 && (delivered || !idle_redrain) {
                    idle_redrain = !delivered;
                    continue;
                }
            }
            idle_redrain = false;

            match shell.channel.multiplexer().wait(direction, keepalive) {
                Ok(WaitOutcome::Ready) => closed_waits = 0,
                Ok(WaitOutcome::Woken) => self.wake.drain(),
                Ok(WaitOutcome::Closed) => {
                    // One more read lets the engine report how the socket ended
                    closed_waits += 1;
                    if closed_waits > 1 {
                        return Exit::Faulted(SshError::Disconnected);
                    }
                }
                Ok(WaitOutcome::TimedOut) => {
                    if let Err(e) = shell.session.send_keepalive(self.config.timeout()) {
                        return Exit::Faulted(e);
                    }
                }
                Err(e) => return Exit::Faulted(SshError::IoError(e)),
            }
        }
    }

    /// Deliver what is buffered on `stream_id` without waiting.
    fn drain(
        &self,
        channel: &mut SshChannel<'_>,
        stream_id: i32,
        buf: &mut [u8],
    ) -> Result<Drained, SshError> {
        let mut delivered = false;
        for _ in 0..MAX_CHUNKS_PER_TURN {
            match channel.poll_read(stream_id, buf)? {
                ReadStatus::Data(n) if stream_id == STDERR_STREAM => {
                    delivered = true;
                    self.listener.on_extended_data(&buf[..n]);
                }
                ReadStatus::Data(n) => {
                    delivered = true;
                    self.listener.on_receive(&buf[..n]);
                }
                ReadStatus::Eof => return Ok(Drained::Eof),
                ReadStatus::Pending(direction) => {
                    return Ok(Drained::Pending {
                        direction,
                        delivered,
                    })
                }
            }
        }
        Ok(Drained::More)
    }

    fn execute(&self, shell: &mut Shell<'_>, command: WorkerCommand) {
        match command {
            WorkerCommand::Send { data, reply_tx } => {
                let result = shell.channel.write_all(STDOUT_STREAM, &data);
                if let Err(e) = &result {
                    warn!(
                        "Write of {} bytes on connection {} failed: {}",
                        data.len(),
                        self.id,
                        e
                    );
                }
                let _ = reply_tx.send(result);
            }
            WorkerCommand::Resize { size, reply_tx } => {
                debug!(
                    "Resizing connection {} to {}x{}",
                    self.id, size.cols, size.rows
                );
                let _ = reply_tx.send(shell.channel.resize_pty(size));
            }
        }
    }

    /// Release the channel, then notify the server and release the session.
    fn shutdown(&self, shell: Shell<'_>) {
        let Shell {
            channel,
            mut session,
        } = shell;
        drop(channel);
        if let Err(e) = session.disconnect(
            DisconnectReason::ByApplication,
            "Connection closed",
            DISCONNECT_TIMEOUT,
        ) {
            debug!(
                "Disconnect notification for connection {} failed: {}",
                self.id, e
            );
        }
        drop(session);
    }

    fn finish(mut self, exit: Exit, ready_tx: Option<oneshot::Sender<Result<(), SshError>>>) {
        let failure = match exit {
            Exit::ConnectFailed(err) => {
                {
                    let mut state = self.state.lock();
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Faulted;
                    }
                }
                warn!("Connection {} failed: {}", self.id, err);
                if let Some(tx) = ready_tx {
                    let _ = tx.send(Err(err));
                }
                None
            }
            Exit::Stopped => {
                debug!("Connection {} stopped on request", self.id);
                None
            }
            Exit::Closed => {
                let mut state = self.state.lock();
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Closed;
                }
                info!("Connection {} closed by the remote side", self.id);
                None
            }
            Exit::Faulted(err) => {
                let mut state = self.state.lock();
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Faulted;
                    Some(err)
                } else {
                    debug!("Ignoring error on closing connection {}: {}", self.id, err);
                    None
                }
            }
        };

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(SshError::Disconnected);
        }

        if let Some(err) = failure {
            error!("Connection {} faulted: {}", self.id, err);
            self.listener.on_error(err);
        }
        info!("Shell worker for connection {} exited", self.id);
    }
}

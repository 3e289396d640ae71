//! Interactive shell connections
//!
//! [`ShellConnection`] is the high-level entry point: it connects, verifies
//! the host, authenticates with a key, opens a pty shell and then delivers
//! remote output to a [`ShellListener`] until it is closed.
//!
//! All native work runs on a dedicated worker thread (see `worker.rs`); the
//! async methods here only enqueue commands and await the replies.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::config::{HostKeyPolicy, ShellConfig};
use super::error::SshError;
use super::key::SshKey;
use super::keyboard_interactive::{KbiPrompt, KeyboardInteractiveHandler};
use super::known_hosts::{AcceptAnyHostKey, HostKeyVerifier, KnownHostsStore};
use super::multiplexer::WakeSignal;
use super::transport::{SocketConnector, TcpConnector};
use super::worker::{Worker, WorkerCommand};
use crate::engine::{Libssh2Engine, ProtocolEngine, TerminalSize};
use crate::handles::HandleRegistry;

/// Receives everything a connection produces.
///
/// Callbacks run on the connection's worker thread and must not block for
/// long; calling [`ShellConnection::close`] from inside one is allowed but
/// does not wait for the worker.
pub trait ShellListener: Send + Sync {
    /// Output from the remote shell, in arrival order
    fn on_receive(&self, data: &[u8]);

    /// The established connection failed. Called at most once.
    fn on_error(&self, error: SshError);

    /// Answer one keyboard-interactive prompt
    fn on_authentication_prompt(&self, name: &str, instructions: &str, prompt: &KbiPrompt) -> String {
        let _ = (name, instructions, prompt);
        String::new()
    }

    /// Extended data (stderr), only with [`ExtendedDataPolicy::Separate`](crate::engine::ExtendedDataPolicy::Separate)
    fn on_extended_data(&self, data: &[u8]) {
        let _ = data;
    }
}

/// Lifecycle of a [`ShellConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Faulted,
}

/// Answers keyboard-interactive rounds through a [`ShellListener`]
pub(crate) struct ListenerPrompts<'a> {
    listener: &'a dyn ShellListener,
}

impl<'a> ListenerPrompts<'a> {
    pub(crate) fn new(listener: &'a dyn ShellListener) -> Self {
        Self { listener }
    }
}

impl KeyboardInteractiveHandler for ListenerPrompts<'_> {
    fn respond(&mut self, name: &str, instructions: &str, prompts: &[KbiPrompt]) -> Vec<String> {
        prompts
            .iter()
            .map(|prompt| self.listener.on_authentication_prompt(name, instructions, prompt))
            .collect()
    }
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    wake: Arc<WakeSignal>,
}

/// An interactive shell over SSH
pub struct ShellConnection {
    id: String,
    config: ShellConfig,
    key: Arc<dyn SshKey>,
    listener: Arc<dyn ShellListener>,
    engine: Arc<dyn ProtocolEngine>,
    connector: Arc<dyn SocketConnector>,
    registry: Arc<HandleRegistry>,
    verifier: Arc<dyn HostKeyVerifier>,
    state: Arc<Mutex<ConnectionState>>,
    locale: Arc<Mutex<Option<String>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl ShellConnection {
    pub fn new(config: ShellConfig, key: Arc<dyn SshKey>, listener: Arc<dyn ShellListener>) -> Self {
        let verifier: Arc<dyn HostKeyVerifier> = match config.host_key_policy {
            HostKeyPolicy::AcceptAny => Arc::new(AcceptAnyHostKey),
            _ => Arc::new(KnownHostsStore::new()),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            key,
            listener,
            engine: Arc::new(Libssh2Engine::new()),
            connector: Arc::new(TcpConnector),
            registry: HandleRegistry::global(),
            verifier,
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            locale: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn ProtocolEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_registry(mut self, registry: Arc<HandleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_host_key_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// `LC_ALL` as accepted by the server; empty when none was set or the
    /// server refused it.
    pub fn negotiated_locale(&self) -> String {
        self.locale.lock().clone().unwrap_or_default()
    }

    /// Connect, authenticate and start the shell.
    ///
    /// Only valid once, from `Idle`; any other call fails with
    /// `InvalidOperation` and leaves the connection alone. On failure every
    /// native resource is released before the error is returned.
    pub async fn connect(&self) -> Result<(), SshError> {
        let ready_rx = {
            let mut worker = self.worker.lock();
            {
                let mut state = self.state.lock();
                if *state != ConnectionState::Idle {
                    return Err(SshError::InvalidOperation(format!(
                        "connect() in state {:?}",
                        *state
                    )));
                }
                *state = ConnectionState::Connecting;
            }

            info!(
                "Connecting {} to {}@{}:{}",
                self.id, self.config.username, self.config.host, self.config.port
            );
            match self.spawn_worker() {
                Ok((handle, ready_rx)) => {
                    *worker = Some(handle);
                    ready_rx
                }
                Err(e) => {
                    *self.state.lock() = ConnectionState::Faulted;
                    return Err(e);
                }
            }
        };

        ready_rx.await.map_err(|_| SshError::Cancelled)?
    }

    fn spawn_worker(
        &self,
    ) -> Result<(WorkerHandle, oneshot::Receiver<Result<(), SshError>>), SshError> {
        let wake = Arc::new(WakeSignal::new()?);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = Worker {
            id: self.id.clone(),
            config: self.config.clone(),
            key: self.key.clone(),
            listener: self.listener.clone(),
            engine: self.engine.clone(),
            connector: self.connector.clone(),
            registry: self.registry.clone(),
            verifier: self.verifier.clone(),
            state: self.state.clone(),
            locale: self.locale.clone(),
            wake: wake.clone(),
            commands: commands_rx,
        };

        let short_id: String = self.id.chars().take(8).collect();
        let thread = thread::Builder::new()
            .name(format!("ssh-worker-{}", short_id))
            .spawn(move || worker.run(ready_tx))?;

        Ok((
            WorkerHandle {
                thread,
                commands: commands_tx,
                wake,
            },
            ready_rx,
        ))
    }

    /// Send text to the shell.
    pub async fn send(&self, text: &str) -> Result<(), SshError> {
        self.send_bytes(text.as_bytes().to_vec()).await
    }

    /// Send raw bytes to the shell; completes once every byte was accepted.
    pub async fn send_bytes(&self, data: impl Into<Vec<u8>>) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(WorkerCommand::Send {
            data: data.into(),
            reply_tx,
        })?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Change the pty size.
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(WorkerCommand::Resize {
            size: TerminalSize::new(cols, rows),
            reply_tx,
        })?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    fn submit(&self, command: WorkerCommand) -> Result<(), SshError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SshError::InvalidOperation(format!(
                "Connection is {:?}, not connected",
                state
            )));
        }
        let worker = self.worker.lock();
        let worker = worker.as_ref().ok_or(SshError::Disconnected)?;
        worker
            .commands
            .send(command)
            .map_err(|_| SshError::Disconnected)?;
        worker.wake.wake();
        Ok(())
    }

    /// Stop the worker and release everything.
    ///
    /// Idempotent. Interrupts any pending wait, including a connect still in
    /// progress, and returns once the worker has exited.
    pub fn close(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            let mut state = self.state.lock();
            if *state == ConnectionState::Idle {
                *state = ConnectionState::Closed;
            }
            return;
        };

        {
            let mut state = self.state.lock();
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                *state = ConnectionState::Closing;
            }
        }
        info!("Closing connection {}", self.id);

        worker.wake.request_stop();
        if thread::current().id() == worker.thread.thread().id() {
            warn!(
                "Connection {} closed from its own worker; not waiting for it",
                self.id
            );
        } else if worker.thread.join().is_err() {
            error!("Worker for connection {} panicked", self.id);
        }

        let mut state = self.state.lock();
        if *state != ConnectionState::Faulted {
            *state = ConnectionState::Closed;
        }
    }
}

impl Drop for ShellConnection {
    fn drop(&mut self) {
        self.close();
    }
}

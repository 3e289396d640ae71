//! Scripted in-process engine for tests
//!
//! Sessions and channels run over a real socket pair: channel reads come
//! from whatever the test writes to the peer end, so waits, EOF and wakeups
//! go through `poll` exactly as they would against a server. Everything
//! else (authentication verdicts, rejected requests, short writes) is
//! scripted through [`FakeScript`] and recorded there for assertions.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    codes, BlockDirection, DisconnectReason, EngineChannel, EngineError, EngineResult,
    EngineSession, ExitSignal, ExtendedDataPolicy, HostKeyType, MethodType, ProtocolEngine,
    TerminalSize,
};
use crate::ssh::transport::{ConnectContext, SocketConnector, Transport};
use crate::ssh::{KbiPrompt, KeyboardInteractiveHandler, SshError, SshKey};

pub(crate) const FAKE_HOST_KEY: [u8; 51] = [7; 51];
pub(crate) const KBI_PROMPT: &str = "Verification code: ";

/// Behaviour and recorded effects shared by every object of one engine
#[derive(Default)]
pub(crate) struct FakeScript {
    pub handshake_stalls: AtomicBool,
    pub handshake_error: Mutex<Option<i32>>,
    pub reject_key: AtomicBool,
    pub require_second_factor: AtomicBool,
    pub expected_kbi_response: Mutex<String>,
    pub reject_env: AtomicBool,
    pub fail_pty: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Per-call caps on accepted write sizes, consumed in order
    pub write_limits: Mutex<VecDeque<usize>>,
    /// Number of upcoming writes that report would-block first
    pub write_stalls: AtomicUsize,
    pub stderr: Mutex<VecDeque<u8>>,
    /// Primary-stream bytes a stream-1 read pulls into the channel's
    /// internal queue, as libssh2 does with packets it reads ahead
    pub stdout_behind_stderr: Mutex<VecDeque<u8>>,
    pub exit_status: AtomicI32,

    pub written: Mutex<Vec<u8>>,
    pub write_calls: AtomicUsize,
    pub signatures: AtomicUsize,
    pub env: Mutex<Vec<(String, String)>>,
    pub pty: Mutex<Option<(String, TerminalSize)>>,
    pub started: Mutex<Option<(String, Option<String>)>>,
    pub extended_data: Mutex<Option<ExtendedDataPolicy>>,
    pub method_prefs: Mutex<Vec<(MethodType, String)>>,
    pub disconnected: Mutex<Option<DisconnectReason>>,
    pub keepalives: AtomicUsize,
    pub prompts_seen: Mutex<Vec<KbiPrompt>>,
    pub client_banner: Mutex<Option<String>>,
    pub trace_enabled: AtomicBool,
    channels_freed: AtomicUsize,
    sessions_freed: AtomicUsize,
}

impl FakeScript {
    pub fn channels_freed(&self) -> usize {
        self.channels_freed.load(Ordering::SeqCst)
    }

    pub fn sessions_freed(&self) -> usize {
        self.sessions_freed.load(Ordering::SeqCst)
    }

    pub fn env_value(&self, name: &str) -> Option<String> {
        self.env
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }
}

#[derive(Default, Clone)]
pub(crate) struct FakeEngine {
    pub script: Arc<FakeScript>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProtocolEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn open_session(&self, socket: BorrowedFd<'_>) -> EngineResult<Box<dyn EngineSession>> {
        let stream = socket
            .try_clone_to_owned()
            .map(UnixStream::from)
            .map_err(|e| EngineError::native(codes::INVAL, e.to_string()))?;
        Ok(Box::new(FakeSession {
            stream,
            script: self.script.clone(),
            handshake_polls: 0,
            handshaken: false,
            partial: false,
            authenticated: false,
            keepalive_interval: 0,
        }))
    }
}

struct FakeSession {
    stream: UnixStream,
    script: Arc<FakeScript>,
    handshake_polls: usize,
    handshaken: bool,
    partial: bool,
    authenticated: bool,
    keepalive_interval: u32,
}

impl EngineSession for FakeSession {
    fn set_timeout(&mut self, _timeout: Duration) {}

    fn set_method_preference(&mut self, method: MethodType, preferences: &str) -> EngineResult<()> {
        self.script
            .method_prefs
            .lock()
            .push((method, preferences.to_string()));
        Ok(())
    }

    fn handshake(&mut self) -> EngineResult<()> {
        if self.script.handshake_stalls.load(Ordering::SeqCst) {
            return Err(EngineError::WouldBlock(BlockDirection::Inbound));
        }
        if let Some(code) = *self.script.handshake_error.lock() {
            return Err(EngineError::native(code, "Unable to exchange encryption keys"));
        }
        self.handshake_polls += 1;
        if self.handshake_polls == 1 {
            return Err(EngineError::WouldBlock(BlockDirection::Outbound));
        }
        self.handshaken = true;
        Ok(())
    }

    fn host_key(&self) -> Option<(HostKeyType, Vec<u8>)> {
        self.handshaken
            .then(|| (HostKeyType::Ed25519, FAKE_HOST_KEY.to_vec()))
    }

    fn negotiated_method(&self, method: MethodType) -> Option<String> {
        if !self.handshaken {
            return None;
        }
        let name = match method {
            MethodType::Kex => "curve25519-sha256",
            MethodType::HostKey => "ssh-ed25519",
            MethodType::CryptCs | MethodType::CryptSc => "aes256-gcm@openssh.com",
            MethodType::MacCs | MethodType::MacSc => "hmac-sha2-256",
            MethodType::CompCs | MethodType::CompSc => "none",
            _ => return None,
        };
        Some(name.to_string())
    }

    fn banner(&self) -> Option<String> {
        self.handshaken.then(|| "SSH-2.0-FakeServer".to_string())
    }

    fn auth_methods(&mut self, _username: &str) -> EngineResult<Vec<String>> {
        let methods: &[&str] = if self.authenticated {
            &[]
        } else if self.partial {
            &["keyboard-interactive"]
        } else {
            &["publickey", "keyboard-interactive"]
        };
        Ok(methods.iter().map(|m| m.to_string()).collect())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn userauth_publickey(&mut self, _username: &str, key: &dyn SshKey) -> EngineResult<()> {
        if self.script.reject_key.load(Ordering::SeqCst) {
            return Err(EngineError::native(
                codes::AUTHENTICATION_FAILED,
                "Username/PublicKey combination invalid",
            ));
        }
        key.public_key_blob()
            .and_then(|_| key.sign(b"fake session identifier"))
            .map_err(|e| {
                EngineError::native(
                    codes::AUTHENTICATION_FAILED,
                    format!("Signing callback failed: {}", e),
                )
            })?;
        self.script.signatures.fetch_add(1, Ordering::SeqCst);

        if self.script.require_second_factor.load(Ordering::SeqCst) {
            self.partial = true;
            return Err(EngineError::native(
                codes::PUBLICKEY_UNVERIFIED,
                "Username/PublicKey combination invalid",
            ));
        }
        self.authenticated = true;
        Ok(())
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        handler: &mut dyn KeyboardInteractiveHandler,
    ) -> EngineResult<()> {
        let prompts = vec![KbiPrompt {
            prompt: KBI_PROMPT.to_string(),
            echo: false,
        }];
        self.script.prompts_seen.lock().extend(prompts.clone());

        let responses = handler.respond(username, "Second factor required", &prompts);
        let expected = self.script.expected_kbi_response.lock().clone();
        if responses.len() == 1 && responses[0] == expected {
            self.authenticated = true;
            Ok(())
        } else {
            Err(EngineError::native(
                codes::AUTHENTICATION_FAILED,
                "Authentication failed (keyboard-interactive)",
            ))
        }
    }

    fn open_channel(
        &mut self,
        _kind: &str,
        _window_size: u32,
        _packet_size: u32,
    ) -> EngineResult<Box<dyn EngineChannel>> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| EngineError::native(codes::CHANNEL_FAILURE, e.to_string()))?;
        Ok(Box::new(FakeChannel {
            stream,
            script: self.script.clone(),
            queued: VecDeque::new(),
            eof: false,
            closed: false,
        }))
    }

    fn supported_algorithms(&self, method: MethodType) -> EngineResult<Vec<String>> {
        let algorithms: &[&str] = match method {
            MethodType::Kex => &["curve25519-sha256", "diffie-hellman-group14-sha256"],
            MethodType::HostKey => &["ssh-ed25519", "rsa-sha2-512"],
            MethodType::CryptCs | MethodType::CryptSc => &["aes256-ctr", "aes128-ctr"],
            MethodType::MacCs | MethodType::MacSc => &["hmac-sha2-256"],
            MethodType::CompCs | MethodType::CompSc => &["none"],
            MethodType::SignAlgo => &["rsa-sha2-512", "rsa-sha2-256"],
            MethodType::LangCs | MethodType::LangSc => {
                return Err(EngineError::native(codes::INVAL, "Unknown method type"))
            }
        };
        Ok(algorithms.iter().map(|a| a.to_string()).collect())
    }

    fn set_banner(&mut self, banner: &str) -> EngineResult<()> {
        *self.script.client_banner.lock() = Some(banner.to_string());
        Ok(())
    }

    fn set_trace(&mut self, enabled: bool) {
        self.script.trace_enabled.store(enabled, Ordering::SeqCst);
    }

    fn configure_keepalive(&mut self, _want_reply: bool, interval_secs: u32) {
        self.keepalive_interval = interval_secs;
    }

    fn send_keepalive(&mut self) -> EngineResult<u32> {
        self.script.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(self.keepalive_interval)
    }

    fn disconnect(&mut self, reason: DisconnectReason, _description: &str) -> EngineResult<()> {
        *self.script.disconnected.lock() = Some(reason);
        Ok(())
    }

    fn last_error(&self) -> Option<EngineError> {
        None
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.script.sessions_freed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeChannel {
    stream: UnixStream,
    script: Arc<FakeScript>,
    /// Primary-stream data already read off the wire
    queued: VecDeque<u8>,
    eof: bool,
    closed: bool,
}

impl FakeChannel {
    fn check_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::native(codes::CHANNEL_CLOSED, "Channel has been closed"))
        } else {
            Ok(())
        }
    }
}

impl EngineChannel for FakeChannel {
    fn request_pty(&mut self, term: &str, size: TerminalSize) -> EngineResult<()> {
        self.check_open()?;
        if self.script.fail_pty.load(Ordering::SeqCst) {
            return Err(EngineError::native(
                codes::CHANNEL_REQUEST_DENIED,
                "PTY request denied",
            ));
        }
        *self.script.pty.lock() = Some((term.to_string(), size));
        Ok(())
    }

    fn resize_pty(&mut self, size: TerminalSize) -> EngineResult<()> {
        self.check_open()?;
        if let Some((_, current)) = self.script.pty.lock().as_mut() {
            *current = size;
        }
        Ok(())
    }

    fn set_env(&mut self, name: &str, value: &str) -> EngineResult<()> {
        self.check_open()?;
        if self.script.reject_env.load(Ordering::SeqCst) {
            return Err(EngineError::native(
                codes::CHANNEL_REQUEST_DENIED,
                "Channel request denied",
            ));
        }
        self.script
            .env
            .lock()
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn process_startup(&mut self, request: &str, message: Option<&str>) -> EngineResult<()> {
        self.check_open()?;
        *self.script.started.lock() = Some((request.to_string(), message.map(str::to_string)));
        Ok(())
    }

    fn set_extended_data(&mut self, policy: ExtendedDataPolicy) -> EngineResult<()> {
        *self.script.extended_data.lock() = Some(policy);
        Ok(())
    }

    fn read(&mut self, stream_id: i32, buf: &mut [u8]) -> EngineResult<usize> {
        self.check_open()?;
        if self.script.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::native(codes::SOCKET_RECV, "Connection reset by peer"));
        }
        if stream_id != 0 {
            self.queued
                .extend(self.script.stdout_behind_stderr.lock().drain(..));
            let mut stderr = self.script.stderr.lock();
            if stderr.is_empty() {
                return Err(EngineError::WouldBlock(BlockDirection::Inbound));
            }
            let n = buf.len().min(stderr.len());
            for (slot, byte) in buf.iter_mut().zip(stderr.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        if !self.queued.is_empty() {
            let n = buf.len().min(self.queued.len());
            for (slot, byte) in buf.iter_mut().zip(self.queued.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        if self.eof {
            return Ok(0);
        }
        match (&self.stream).read(buf) {
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(EngineError::WouldBlock(BlockDirection::Inbound))
            }
            Err(e) => Err(EngineError::native(codes::SOCKET_RECV, e.to_string())),
        }
    }

    fn write(&mut self, _stream_id: i32, buf: &[u8]) -> EngineResult<usize> {
        self.check_open()?;
        if self
            .script
            .write_stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::WouldBlock(BlockDirection::Outbound));
        }
        let limit = self.script.write_limits.lock().pop_front().unwrap_or(usize::MAX);
        let n = buf.len().min(limit);
        self.script.written.lock().extend_from_slice(&buf[..n]);
        self.script.write_calls.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    fn pending_bytes(&self) -> usize {
        self.queued.len() + self.script.stderr.lock().len()
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn send_eof(&mut self) -> EngineResult<()> {
        self.check_open()
    }

    fn wait_eof(&mut self) -> EngineResult<()> {
        if self.eof {
            Ok(())
        } else {
            Err(EngineError::WouldBlock(BlockDirection::Inbound))
        }
    }

    fn close(&mut self) -> EngineResult<()> {
        self.closed = true;
        Ok(())
    }

    fn wait_closed(&mut self) -> EngineResult<()> {
        if self.closed {
            Ok(())
        } else {
            Err(EngineError::WouldBlock(BlockDirection::Inbound))
        }
    }

    fn exit_status(&self) -> EngineResult<i32> {
        Ok(self.script.exit_status.load(Ordering::SeqCst))
    }

    fn exit_signal(&self) -> EngineResult<ExitSignal> {
        Ok(ExitSignal::default())
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.script.channels_freed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Key that signs by reversing the challenge, or refuses to sign
pub(crate) struct FakeKey {
    fail: bool,
}

impl FakeKey {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl SshKey for FakeKey {
    fn algorithm(&self) -> String {
        "ssh-ed25519".to_string()
    }

    fn public_key_blob(&self) -> Result<Vec<u8>, SshError> {
        Ok(vec![1; 51])
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SshError> {
        if self.fail {
            return Err(SshError::KeyError("Security key not present".to_string()));
        }
        Ok(data.iter().rev().copied().collect())
    }
}

/// Connects to one end of a socket pair and keeps the other for the test
#[derive(Default)]
pub(crate) struct FakeConnector {
    peer: Mutex<Option<UnixStream>>,
    pub refuse: AtomicBool,
    pub connections: AtomicUsize,
    /// Time a connect takes before the socket is handed out
    pub delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote end of the last connection
    pub fn take_peer(&self) -> Option<UnixStream> {
        self.peer.lock().take()
    }
}

impl SocketConnector for FakeConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        ctx: ConnectContext<'_>,
    ) -> Result<Box<dyn Transport>, SshError> {
        if let Some(delay) = *self.delay.lock() {
            std::thread::sleep(delay);
        }
        if ctx.deadline.is_expired() {
            return Err(SshError::Timeout(format!(
                "Connection to {}:{} timed out",
                host, port
            )));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed(format!(
                "Connection to {}:{} refused",
                host, port
            )));
        }
        let (local, peer) = UnixStream::pair()?;
        local.set_nonblocking(true)?;
        *self.peer.lock() = Some(peer);
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(local))
    }
}

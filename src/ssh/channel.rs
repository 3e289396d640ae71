//! SSH Channel
//!
//! A byte stream over an authenticated session. Blocking operations go
//! through the same would-block discipline as the session and are bounded by
//! the channel's timeout (unbounded by default, since an interactive read
//! may legitimately wait forever).

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::error::SshError;
use super::multiplexer::{Deadline, DriveError, SocketEventMultiplexer, WakeSignal};
use crate::engine::{
    codes, BlockDirection, EngineChannel, EngineError, EngineResult, ExitSignal,
    ExtendedDataPolicy, TerminalSize,
};
use crate::handles::{ChannelHandle, HandleId, HandleRegistry};

/// Primary data stream
pub const STDOUT_STREAM: i32 = 0;
/// Extended data (stderr) stream
pub const STDERR_STREAM: i32 = 1;

/// Result of a non-waiting read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Data(usize),
    Eof,
    /// Nothing buffered; ready again once the socket is in this direction
    Pending(BlockDirection),
}

fn channel_error(err: DriveError, operation: &str) -> SshError {
    err.into_ssh_error(operation, |code, message| match code {
        codes::CHANNEL_CLOSED => SshError::ChannelClosed,
        _ => SshError::Channel { code, message },
    })
}

/// A channel of an [`SshSession`](super::SshSession)
pub struct SshChannel<'s> {
    handle: ChannelHandle,
    socket: BorrowedFd<'s>,
    wake: Option<&'s WakeSignal>,
    registry: Arc<HandleRegistry>,
    timeout: Option<Duration>,
}

impl<'s> SshChannel<'s> {
    pub(crate) fn new(
        handle: ChannelHandle,
        socket: BorrowedFd<'s>,
        wake: Option<&'s WakeSignal>,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            handle,
            socket,
            wake,
            registry,
            timeout: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    pub fn session_id(&self) -> HandleId {
        self.handle.session_id()
    }

    /// Bound every blocking operation; `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Multiplexer over this channel's socket, for callers that wait themselves
    pub fn multiplexer(&self) -> SocketEventMultiplexer<'_> {
        SocketEventMultiplexer::new(self.socket, self.wake, &self.registry)
    }

    fn drive<T>(
        &mut self,
        operation: &str,
        mut op: impl FnMut(&mut dyn EngineChannel) -> EngineResult<T>,
    ) -> Result<T, SshError> {
        let mux = SocketEventMultiplexer::new(self.socket, self.wake, &self.registry);
        let handle = &mut self.handle;
        mux.drive(Deadline::from(self.timeout), || op(handle.engine()?))
            .map_err(|e| channel_error(e, operation))
    }

    pub fn set_extended_data_policy(&mut self, policy: ExtendedDataPolicy) -> Result<(), SshError> {
        self.drive("Extended data mode", |c| c.set_extended_data(policy))
    }

    pub fn request_pty(&mut self, term: &str, size: TerminalSize) -> Result<(), SshError> {
        debug!(
            "Requesting {} pty {}x{} on channel {}",
            term,
            size.cols,
            size.rows,
            self.id()
        );
        self.drive("PTY request", |c| c.request_pty(term, size))
    }

    pub fn resize_pty(&mut self, size: TerminalSize) -> Result<(), SshError> {
        self.drive("PTY resize", |c| c.resize_pty(size))
    }

    pub fn set_environment_variable(&mut self, name: &str, value: &str) -> Result<(), SshError> {
        self.drive("Environment request", |c| c.set_env(name, value))
    }

    pub fn execute(&mut self, command: &str) -> Result<(), SshError> {
        self.drive("Exec request", |c| c.process_startup("exec", Some(command)))
    }

    pub fn start_shell(&mut self) -> Result<(), SshError> {
        self.drive("Shell request", |c| c.process_startup("shell", None))
    }

    pub fn start_subsystem(&mut self, name: &str) -> Result<(), SshError> {
        self.drive("Subsystem request", |c| c.process_startup("subsystem", Some(name)))
    }

    /// Read from `stream_id`, waiting for data; 0 means EOF.
    pub fn read(&mut self, stream_id: i32, buf: &mut [u8]) -> Result<usize, SshError> {
        self.drive("Read", |c| c.read(stream_id, buf))
    }

    /// Read whatever is buffered without waiting.
    pub fn poll_read(&mut self, stream_id: i32, buf: &mut [u8]) -> Result<ReadStatus, SshError> {
        let result = self
            .handle
            .engine()
            .and_then(|c| c.read(stream_id, buf));
        match result {
            Ok(0) => Ok(ReadStatus::Eof),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(EngineError::WouldBlock(direction)) => Ok(ReadStatus::Pending(direction)),
            Err(EngineError::Native { code, message }) => {
                Err(channel_error(DriveError::Engine { code, message }, "Read"))
            }
        }
    }

    /// Write some of `buf` to `stream_id`; the count may be short.
    pub fn write(&mut self, stream_id: i32, buf: &[u8]) -> Result<usize, SshError> {
        self.drive("Write", |c| c.write(stream_id, buf))
    }

    /// Write all of `buf`, looping over short writes.
    pub fn write_all(&mut self, stream_id: i32, buf: &[u8]) -> Result<(), SshError> {
        let mut offset = 0;
        while offset < buf.len() {
            let written = self.write(stream_id, &buf[offset..])?;
            if written == 0 {
                return Err(SshError::ChannelClosed);
            }
            offset += written;
            trace!("Wrote {}/{} bytes to channel {}", offset, buf.len(), self.id());
        }
        Ok(())
    }

    /// Data the engine has already received but not handed out, on any stream
    pub fn pending_bytes(&self) -> usize {
        self.handle.engine_ref().map_or(0, |c| c.pending_bytes())
    }

    pub fn is_eof(&self) -> bool {
        self.handle.engine_ref().map_or(true, |c| c.is_eof())
    }

    pub fn send_eof(&mut self) -> Result<(), SshError> {
        self.drive("Send EOF", |c| c.send_eof())
    }

    pub fn wait_for_eof(&mut self) -> Result<(), SshError> {
        self.drive("Wait for EOF", |c| c.wait_eof())
    }

    pub fn close(&mut self) -> Result<(), SshError> {
        self.drive("Close", |c| c.close())
    }

    pub fn wait_for_closed(&mut self) -> Result<(), SshError> {
        self.drive("Wait for close", |c| c.wait_closed())
    }

    /// Exit status of the remote process, once the channel is closed
    pub fn exit_status(&self) -> Result<i32, SshError> {
        self.handle
            .engine_ref()
            .and_then(|c| c.exit_status())
            .map_err(|e| native_error(e, "Exit status"))
    }

    pub fn exit_signal(&self) -> Result<ExitSignal, SshError> {
        self.handle
            .engine_ref()
            .and_then(|c| c.exit_signal())
            .map_err(|e| native_error(e, "Exit signal"))
    }
}

fn native_error(err: EngineError, operation: &str) -> SshError {
    match err {
        EngineError::Native { code, message } => {
            channel_error(DriveError::Engine { code, message }, operation)
        }
        EngineError::WouldBlock(_) => SshError::Channel {
            code: codes::EAGAIN,
            message: format!("{} not available yet", operation),
        },
    }
}

impl std::fmt::Debug for SshChannel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("id", &self.id())
            .field("session", &self.session_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngine, FakeKey};
    use crate::ssh::session::SshSession;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::Ordering;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn ready_session<'s>(
        engine: &FakeEngine,
        socket: &'s UnixStream,
        registry: &Arc<HandleRegistry>,
    ) -> SshSession<'s> {
        let mut session = SshSession::new(engine, socket.as_fd(), registry.clone()).unwrap();
        session.handshake(TIMEOUT).unwrap();
        session
            .authenticate_with_key("deploy", &FakeKey::new(), TIMEOUT)
            .unwrap();
        session
    }

    fn socket() -> (UnixStream, UnixStream) {
        let (local, peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        (local, peer)
    }

    #[test]
    fn test_exec_and_exit_status() {
        let engine = FakeEngine::new();
        engine.script.exit_status.store(3, Ordering::SeqCst);
        let registry = Arc::new(HandleRegistry::new());
        let (local, _peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);

        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();
        channel.execute("uptime").unwrap();
        assert_eq!(
            *engine.script.started.lock(),
            Some(("exec".to_string(), Some("uptime".to_string())))
        );
        channel.close().unwrap();
        channel.wait_for_closed().unwrap();
        assert_eq!(channel.exit_status().unwrap(), 3);
        assert_eq!(channel.exit_signal().unwrap(), ExitSignal::default());
    }

    #[test]
    fn test_read_waits_for_data_then_eof() {
        let engine = FakeEngine::new();
        let registry = Arc::new(HandleRegistry::new());
        let (local, mut peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);
        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();
        channel.set_timeout(Some(TIMEOUT));

        let mut buf = [0u8; 16];
        assert_eq!(
            channel.poll_read(STDOUT_STREAM, &mut buf).unwrap(),
            ReadStatus::Pending(BlockDirection::Inbound)
        );

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            peer.write_all(b"hello").unwrap();
            peer
        });
        let n = channel.read(STDOUT_STREAM, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        drop(writer.join().unwrap());
        assert_eq!(channel.read(STDOUT_STREAM, &mut buf).unwrap(), 0);
        assert!(channel.is_eof());
    }

    #[test]
    fn test_read_timeout() {
        let engine = FakeEngine::new();
        let registry = Arc::new(HandleRegistry::new());
        let (local, _peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);
        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();
        channel.set_timeout(Some(Duration::from_millis(30)));

        let mut buf = [0u8; 16];
        assert!(matches!(
            channel.read(STDOUT_STREAM, &mut buf),
            Err(SshError::Timeout(_))
        ));
    }

    #[test]
    fn test_write_all_loops_partial_writes() {
        let engine = FakeEngine::new();
        engine.script.write_limits.lock().extend([3, 4]);
        engine.script.write_stalls.store(2, Ordering::SeqCst);
        let registry = Arc::new(HandleRegistry::new());
        let (local, _peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);
        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();

        channel.write_all(STDOUT_STREAM, b"0123456789").unwrap();
        assert_eq!(engine.script.written.lock().as_slice(), b"0123456789");
        assert_eq!(engine.script.write_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rejected_environment_is_channel_error() {
        let engine = FakeEngine::new();
        engine.script.reject_env.store(true, Ordering::SeqCst);
        let registry = Arc::new(HandleRegistry::new());
        let (local, _peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);
        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();

        let err = channel
            .set_environment_variable("LC_ALL", "en_AU.UTF-8")
            .unwrap_err();
        assert_eq!(err.native_code(), Some(codes::CHANNEL_REQUEST_DENIED));
        assert!(engine.script.env.lock().is_empty());
    }

    #[test]
    fn test_pty_and_resize() {
        let engine = FakeEngine::new();
        let registry = Arc::new(HandleRegistry::new());
        let (local, _peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);
        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();

        channel
            .request_pty("xterm-256color", TerminalSize::new(120, 40))
            .unwrap();
        channel.resize_pty(TerminalSize::new(100, 30)).unwrap();
        assert_eq!(
            *engine.script.pty.lock(),
            Some(("xterm-256color".to_string(), TerminalSize::new(100, 30)))
        );
    }

    #[test]
    fn test_closed_channel_maps_to_channel_closed() {
        let engine = FakeEngine::new();
        let registry = Arc::new(HandleRegistry::new());
        let (local, _peer) = socket();
        let mut session = ready_session(&engine, &local, &registry);
        let mut channel = session.open_channel("session", 1024, 1024, TIMEOUT).unwrap();

        channel.close().unwrap();
        assert!(matches!(
            channel.write(STDOUT_STREAM, b"x"),
            Err(SshError::ChannelClosed)
        ));
    }
}

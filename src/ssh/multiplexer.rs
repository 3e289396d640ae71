//! Socket Event Multiplexer
//!
//! The only place in the crate that blocks. Engine calls never wait on their
//! own; they report which socket direction they are stuck on and the caller
//! comes here to wait for it:
//!
//! ```text
//!        ┌──────────── Ready / Closed (one retry) ───────────┐
//!        ▼                                                    │
//!   ┌─────────┐   WouldBlock(dir)   ┌──────────────┐          │
//!   │ Invoke  │ ──────────────────▶ │  Wait(dir)   │ ─────────┘
//!   └─────────┘                     └──────────────┘
//!     │ Ok / Native                   │ TimedOut / stop requested
//!     ▼                               ▼
//!   result                          DriveError
//! ```
//!
//! A [`WakeSignal`] can be attached so another thread can interrupt a wait,
//! either to hand the worker new work or to stop it altogether.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::trace;

use super::error::SshError;
use crate::engine::{BlockDirection, EngineError, EngineResult};
use crate::handles::{HandleId, HandleKind, HandleRegistry};

/// Self-pipe used to interrupt a blocked wait from another thread
#[derive(Debug)]
pub struct WakeSignal {
    reader: UnixStream,
    writer: UnixStream,
    stopped: AtomicBool,
}

impl WakeSignal {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            writer,
            stopped: AtomicBool::new(false),
        })
    }

    /// Interrupt the current (or next) wait.
    pub fn wake(&self) {
        // A full buffer already guarantees a pending wakeup
        let _ = (&self.writer).write(&[1]);
    }

    /// Ask the waiting side to stop and wake it.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Consume pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.reader).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Result of a single wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The socket is ready in the requested direction
    Ready,
    /// The timeout elapsed first
    TimedOut,
    /// The socket reported hang-up or an error
    Closed,
    /// The attached wake signal fired
    Woken,
}

/// Absolute deadline for a whole operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn never() -> Self {
        Self(None)
    }

    /// Time left, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Deadline::never, Deadline::after)
    }
}

/// Why a driven operation did not complete
#[derive(Debug)]
pub enum DriveError {
    /// The engine failed the operation
    Engine { code: i32, message: String },
    /// The deadline passed
    TimedOut,
    /// The socket closed and the engine still could not make progress
    Closed,
    /// A stop was requested through the wake signal
    Interrupted,
    /// `poll` itself failed
    Io(io::Error),
}

impl DriveError {
    /// Map to the public error type; `engine` decides what a native failure
    /// means for the operation at hand.
    pub(crate) fn into_ssh_error(
        self,
        operation: &str,
        engine: impl FnOnce(i32, String) -> SshError,
    ) -> SshError {
        match self {
            DriveError::Engine { code, message } => engine(code, message),
            DriveError::TimedOut => SshError::Timeout(format!("{} timed out", operation)),
            DriveError::Closed => SshError::Disconnected,
            DriveError::Interrupted => SshError::Cancelled,
            DriveError::Io(e) => SshError::IoError(e),
        }
    }
}

/// Socket wait registration, released on every exit path
struct SocketEvent<'r> {
    id: HandleId,
    registry: &'r HandleRegistry,
}

impl<'r> SocketEvent<'r> {
    fn acquire(registry: &'r HandleRegistry, socket: BorrowedFd<'_>) -> Self {
        use std::os::fd::AsRawFd;
        let id = registry.register(
            HandleKind::SocketEvent,
            None,
            format!("fd {}", socket.as_raw_fd()),
        );
        Self { id, registry }
    }
}

impl Drop for SocketEvent<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Invoke,
    Wait(BlockDirection),
}

/// Whole milliseconds to wait, rounded up so a sub-millisecond remainder
/// does not spin.
fn timeout_millis(remaining: Duration) -> u128 {
    let millis = remaining.as_millis();
    if Duration::from_millis(millis as u64) < remaining {
        millis + 1
    } else {
        millis
    }
}

fn poll_timeout(remaining: Option<Duration>) -> PollTimeout {
    match remaining {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::try_from(timeout_millis(d)).unwrap_or(PollTimeout::MAX),
    }
}

/// Waits on one socket on behalf of engine calls
#[derive(Clone, Copy)]
pub struct SocketEventMultiplexer<'a> {
    socket: BorrowedFd<'a>,
    wake: Option<&'a WakeSignal>,
    registry: &'a HandleRegistry,
}

impl<'a> SocketEventMultiplexer<'a> {
    pub fn new(
        socket: BorrowedFd<'a>,
        wake: Option<&'a WakeSignal>,
        registry: &'a HandleRegistry,
    ) -> Self {
        Self {
            socket,
            wake,
            registry,
        }
    }

    fn stop_requested(&self) -> bool {
        self.wake.is_some_and(WakeSignal::is_stopped)
    }

    /// Block until the socket is ready in `direction`, it closes, the wake
    /// signal fires, or `timeout` elapses (`None` waits indefinitely).
    pub fn wait(
        &self,
        direction: BlockDirection,
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome> {
        let _event = SocketEvent::acquire(self.registry, self.socket);

        let mut wanted = PollFlags::empty();
        if direction.wants_read() {
            wanted |= PollFlags::POLLIN;
        }
        if direction.wants_write() {
            wanted |= PollFlags::POLLOUT;
        }

        let deadline = Deadline::from(timeout);
        loop {
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(self.socket, wanted));
            if let Some(wake) = self.wake {
                fds.push(PollFd::new(wake.fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, poll_timeout(deadline.remaining())) {
                Ok(0) => return Ok(WaitOutcome::TimedOut),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }

            let woken = fds
                .get(1)
                .and_then(|fd| fd.revents())
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if woken {
                return Ok(WaitOutcome::Woken);
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                return Ok(WaitOutcome::Closed);
            }
            let hangup = revents.contains(PollFlags::POLLHUP);
            if hangup && !direction.wants_read() {
                return Ok(WaitOutcome::Closed);
            }
            if revents.intersects(wanted) {
                return Ok(WaitOutcome::Ready);
            }
            if hangup {
                return Ok(WaitOutcome::Closed);
            }
            if deadline.is_expired() {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    /// Run `op` until it completes, retrying after each would-block once the
    /// socket is ready, bounded by `deadline`.
    pub fn drive<T>(
        &self,
        deadline: Deadline,
        mut op: impl FnMut() -> EngineResult<T>,
    ) -> Result<T, DriveError> {
        let mut step = Step::Invoke;
        let mut after_close = false;

        loop {
            step = match step {
                Step::Invoke => match op() {
                    Ok(value) => return Ok(value),
                    Err(EngineError::Native { code, message }) => {
                        return Err(DriveError::Engine { code, message })
                    }
                    Err(EngineError::WouldBlock(_)) if after_close => {
                        return Err(DriveError::Closed)
                    }
                    Err(EngineError::WouldBlock(direction)) => Step::Wait(direction),
                },
                Step::Wait(direction) => {
                    if self.stop_requested() {
                        return Err(DriveError::Interrupted);
                    }
                    if deadline.is_expired() {
                        return Err(DriveError::TimedOut);
                    }
                    match self
                        .wait(direction, deadline.remaining())
                        .map_err(DriveError::Io)?
                    {
                        WaitOutcome::Ready => Step::Invoke,
                        WaitOutcome::TimedOut => return Err(DriveError::TimedOut),
                        WaitOutcome::Closed => {
                            // Let the engine observe the hang-up itself
                            trace!("Socket closed while waiting for {:?}", direction);
                            after_close = true;
                            Step::Invoke
                        }
                        WaitOutcome::Woken => {
                            if let Some(wake) = self.wake {
                                wake.drain();
                            }
                            if self.stop_requested() {
                                return Err(DriveError::Interrupted);
                            }
                            Step::Wait(direction)
                        }
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::codes;
    use std::sync::Arc;
    use std::thread;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_overflowing_deadline_is_unbounded() {
        let deadline = Deadline::after(Duration::MAX);
        assert_eq!(deadline.remaining(), None);
        assert!(!deadline.is_expired());
        assert_eq!(
            Deadline::after(Duration::from_secs(u64::MAX)).remaining(),
            None
        );
    }

    #[test]
    fn test_wait_ready_for_write() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);
        let outcome = mux
            .wait(BlockDirection::Outbound, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_wait_times_out_without_data() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);
        let started = Instant::now();
        let outcome = mux
            .wait(BlockDirection::Inbound, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_wait_sees_peer_hangup_as_readable() {
        let registry = HandleRegistry::new();
        let (local, peer) = pair();
        drop(peer);
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);
        // EOF is readable; the engine sees it as a zero-length read
        let outcome = mux
            .wait(BlockDirection::Inbound, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);

        let outcome = mux
            .wait(BlockDirection::Outbound, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Closed);
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let wake = Arc::new(WakeSignal::new().unwrap());

        let waker = wake.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let mux = SocketEventMultiplexer::new(local.as_fd(), Some(&wake), &registry);
        let outcome = mux.wait(BlockDirection::Inbound, None).unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
        handle.join().unwrap();
        wake.drain();
        assert!(!wake.is_stopped());
    }

    #[test]
    fn test_drive_retries_until_ready() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);

        let mut calls = 0;
        let value = mux
            .drive(Deadline::after(Duration::from_secs(1)), || {
                calls += 1;
                if calls < 3 {
                    Err(EngineError::WouldBlock(BlockDirection::Outbound))
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_drive_times_out() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);

        let result: Result<(), _> = mux.drive(Deadline::after(Duration::from_millis(30)), || {
            Err(EngineError::WouldBlock(BlockDirection::Inbound))
        });
        assert!(matches!(result, Err(DriveError::TimedOut)));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_drive_passes_native_errors_through() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);

        let result: Result<(), _> = mux.drive(Deadline::never(), || {
            Err(EngineError::native(codes::KEX_FAILURE, "no common kex"))
        });
        match result {
            Err(DriveError::Engine { code, message }) => {
                assert_eq!(code, codes::KEX_FAILURE);
                assert_eq!(message, "no common kex");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_drive_interrupted_by_stop() {
        let registry = HandleRegistry::new();
        let (local, _peer) = pair();
        let wake = Arc::new(WakeSignal::new().unwrap());

        let stopper = wake.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.request_stop();
        });

        let mux = SocketEventMultiplexer::new(local.as_fd(), Some(&wake), &registry);
        let started = Instant::now();
        let result: Result<(), _> = mux.drive(Deadline::after(Duration::from_secs(10)), || {
            Err(EngineError::WouldBlock(BlockDirection::Inbound))
        });
        assert!(matches!(result, Err(DriveError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_drive_gives_up_after_close() {
        let registry = HandleRegistry::new();
        let (local, peer) = pair();
        drop(peer);
        let mux = SocketEventMultiplexer::new(local.as_fd(), None, &registry);

        let result: Result<(), _> = mux.drive(Deadline::after(Duration::from_secs(1)), || {
            Err(EngineError::WouldBlock(BlockDirection::Outbound))
        });
        assert!(matches!(result, Err(DriveError::Closed)));
    }

    #[test]
    fn test_timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(Duration::from_micros(1500)), 2);
        assert_eq!(timeout_millis(Duration::from_millis(7)), 7);
        assert_eq!(timeout_millis(Duration::ZERO), 0);
    }

    #[test]
    fn test_into_ssh_error() {
        let err = DriveError::TimedOut.into_ssh_error("Handshake", |code, message| {
            SshError::Handshake { code, message }
        });
        assert!(matches!(err, SshError::Timeout(ref m) if m == "Handshake timed out"));

        let err = DriveError::Engine {
            code: -18,
            message: "denied".into(),
        }
        .into_ssh_error("Authentication", |_, message| {
            SshError::AuthenticationFailed(message)
        });
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
    }
}

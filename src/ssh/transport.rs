//! Socket establishment
//!
//! The session only needs a connected, non-blocking file descriptor; how it
//! was obtained is the connector's business. Connectors share the deadline
//! and wake signal of the connect that uses them, so socket setup counts
//! against the same timeout as the handshake and can be cancelled by
//! `close()`.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrStorage};
use tracing::{debug, warn};

use super::error::SshError;
use super::multiplexer::{Deadline, DriveError, SocketEventMultiplexer, WakeSignal};
use crate::engine::{BlockDirection, EngineError, EngineResult};
use crate::handles::HandleRegistry;

/// A connected, non-blocking byte stream
pub trait Transport: AsFd + Send {}

impl<T: AsFd + Send> Transport for T {}

/// Limits a connector has to respect
#[derive(Debug, Clone, Copy)]
pub struct ConnectContext<'a> {
    /// Shared with the rest of the connect
    pub deadline: Deadline,
    /// Interrupts the attempt when stopped
    pub wake: Option<&'a WakeSignal>,
    pub registry: &'a HandleRegistry,
}

/// Opens the socket a session runs over
pub trait SocketConnector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        ctx: ConnectContext<'_>,
    ) -> Result<Box<dyn Transport>, SshError>;
}

/// Plain TCP with a non-blocking connect
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, SshError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                SshError::ConnectionFailed(format!("Failed to resolve {}:{}: {}", host, port, e))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(SshError::ConnectionFailed(format!(
                "No addresses found for {}:{}",
                host, port
            )));
        }
        Ok(addrs)
    }

    fn connect_addr(addr: SocketAddr, ctx: &ConnectContext<'_>) -> Result<TcpStream, DriveError> {
        let family = if addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)
            .map_err(|e| DriveError::Io(e.into()))?;
        let stream = TcpStream::from(fd);
        stream.set_nonblocking(true).map_err(DriveError::Io)?;

        match socket::connect(stream.as_raw_fd(), &SockaddrStorage::from(addr)) {
            Ok(()) => return Ok(stream),
            Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => {}
            Err(e) => return Err(DriveError::Io(e.into())),
        }

        let mux = SocketEventMultiplexer::new(stream.as_fd(), ctx.wake, ctx.registry);
        mux.drive(ctx.deadline, || connect_status(&stream))?;
        Ok(stream)
    }
}

/// Outcome of a connect in progress: done, still pending, or the socket error.
fn connect_status(stream: &TcpStream) -> EngineResult<()> {
    match socket::getsockopt(stream, sockopt::SocketError) {
        Ok(0) => {}
        Ok(errno) => {
            let err = io::Error::from_raw_os_error(errno);
            return Err(EngineError::native(errno, err.to_string()));
        }
        Err(e) => return Err(EngineError::native(e as i32, e.desc())),
    }
    match stream.peer_addr() {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
            Err(EngineError::WouldBlock(BlockDirection::Outbound))
        }
        Err(e) => Err(EngineError::native(e.raw_os_error().unwrap_or(0), e.to_string())),
    }
}

impl SocketConnector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        ctx: ConnectContext<'_>,
    ) -> Result<Box<dyn Transport>, SshError> {
        let addrs = Self::resolve(host, port)?;

        let mut last_error = None;
        for addr in addrs {
            debug!("Connecting to {}", addr);
            match Self::connect_addr(addr, &ctx) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                    }
                    return Ok(Box::new(stream));
                }
                Err(DriveError::TimedOut) => {
                    return Err(SshError::Timeout(format!(
                        "Connection to {}:{} timed out",
                        host, port
                    )))
                }
                Err(DriveError::Interrupted) => return Err(SshError::Cancelled),
                Err(DriveError::Engine { message, .. }) => {
                    debug!("Connection to {} failed: {}", addr, message);
                    last_error = Some(message);
                }
                Err(e) => {
                    debug!("Connection to {} failed: {:?}", addr, e);
                    last_error = Some(format!("{:?}", e));
                }
            }
        }

        Err(SshError::ConnectionFailed(match last_error {
            Some(e) => format!("Failed to connect to {}:{}: {}", host, port, e),
            None => format!("Failed to connect to {}:{}", host, port),
        }))
    }
}

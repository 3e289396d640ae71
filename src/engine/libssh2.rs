//! libssh2 engine
//!
//! Binds [`ProtocolEngine`] to libssh2 through the `ssh2` crate. The session is
//! switched to non-blocking mode right after creation, so every call either
//! completes, fails with a native code, or reports `LIBSSH2_ERROR_EAGAIN`,
//! which is translated into [`EngineError::WouldBlock`] using the session's
//! block directions.
//!
//! Public key authentication goes through `libssh2_userauth_publickey` with a
//! signing callback, so the private key never has to be handed to libssh2.

use std::ffi::{c_void, CString};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use libc::{c_char, c_int, c_uchar, size_t};
use libssh2_sys as raw;
use ssh2::{BlockDirections, Channel, ErrorCode, Session, TraceFlags};
use tracing::{debug, trace};

use super::{
    codes, BlockDirection, DisconnectReason, EngineChannel, EngineError, EngineResult,
    EngineSession, ExitSignal, ExtendedDataPolicy, HostKeyType, MethodType, ProtocolEngine,
    TerminalSize,
};
use crate::ssh::{KbiPrompt, KeyboardInteractiveHandler, SshKey};

/// Upper bound for the blocking release of native channels and sessions.
const RELEASE_TIMEOUT_MS: u32 = 1000;

type SignCallback = extern "C" fn(
    session: *mut raw::LIBSSH2_SESSION,
    sig: *mut *mut c_uchar,
    sig_len: *mut size_t,
    data: *const c_uchar,
    data_len: size_t,
    abstract_: *mut *mut c_void,
) -> c_int;

type TraceCallback = extern "C" fn(
    session: *mut raw::LIBSSH2_SESSION,
    context: *mut c_void,
    message: *const c_char,
    len: size_t,
);

extern "C" {
    // Not declared by libssh2-sys; exported by the libssh2 it links.
    fn libssh2_userauth_publickey(
        session: *mut raw::LIBSSH2_SESSION,
        username: *const c_char,
        pubkeydata: *const c_uchar,
        pubkeydata_len: size_t,
        sign_callback: Option<SignCallback>,
        abstract_: *mut *mut c_void,
    ) -> c_int;

    // Declared next to libssh2_trace in libssh2.h; missing from libssh2-sys.
    fn libssh2_trace_sethandler(
        session: *mut raw::LIBSSH2_SESSION,
        context: *mut c_void,
        callback: Option<TraceCallback>,
    ) -> c_int;
}

/// Non-owning view of the caller's socket, handed to libssh2.
struct SocketRef(RawFd);

impl AsRawFd for SocketRef {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Protocol engine backed by libssh2
#[derive(Debug, Default, Clone, Copy)]
pub struct Libssh2Engine;

impl Libssh2Engine {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolEngine for Libssh2Engine {
    fn name(&self) -> &str {
        "libssh2"
    }

    fn open_session(&self, socket: BorrowedFd<'_>) -> EngineResult<Box<dyn EngineSession>> {
        let mut session = Session::new().map_err(|e| native_error(&e))?;
        session.set_tcp_stream(SocketRef(socket.as_raw_fd()));
        session.set_blocking(false);
        debug!("libssh2 session created on fd {}", socket.as_raw_fd());
        Ok(Box::new(Libssh2Session { session }))
    }
}

fn error_code(err: &ssh2::Error) -> i32 {
    match err.code() {
        ErrorCode::Session(code) | ErrorCode::SFTP(code) => code,
    }
}

fn native_error(err: &ssh2::Error) -> EngineError {
    EngineError::native(error_code(err), err.message())
}

fn block_direction(session: &Session) -> BlockDirection {
    match session.block_directions() {
        BlockDirections::Inbound => BlockDirection::Inbound,
        BlockDirections::Outbound => BlockDirection::Outbound,
        BlockDirections::Both | BlockDirections::None => BlockDirection::Both,
    }
}

fn map_error(session: &Session, err: ssh2::Error) -> EngineError {
    match err.code() {
        ErrorCode::Session(raw::LIBSSH2_ERROR_EAGAIN) => {
            EngineError::WouldBlock(block_direction(session))
        }
        _ => native_error(&err),
    }
}

fn method_type(method: MethodType) -> ssh2::MethodType {
    match method {
        MethodType::Kex => ssh2::MethodType::Kex,
        MethodType::HostKey => ssh2::MethodType::HostKey,
        MethodType::CryptCs => ssh2::MethodType::CryptCs,
        MethodType::CryptSc => ssh2::MethodType::CryptSc,
        MethodType::MacCs => ssh2::MethodType::MacCs,
        MethodType::MacSc => ssh2::MethodType::MacSc,
        MethodType::CompCs => ssh2::MethodType::CompCs,
        MethodType::CompSc => ssh2::MethodType::CompSc,
        MethodType::LangCs => ssh2::MethodType::LangCs,
        MethodType::LangSc => ssh2::MethodType::LangSc,
        MethodType::SignAlgo => ssh2::MethodType::SignAlgo,
    }
}

fn disconnect_code(reason: DisconnectReason) -> ssh2::DisconnectCode {
    use ssh2::DisconnectCode as Code;
    match reason {
        DisconnectReason::HostNotAllowedToConnect => Code::HostNotAllowedToConnect,
        DisconnectReason::ProtocolError => Code::ProtocolError,
        DisconnectReason::KeyExchangeFailed => Code::KeyExchangeFailed,
        DisconnectReason::Reserved => Code::Reserved,
        DisconnectReason::MacError => Code::MacError,
        DisconnectReason::CompressionError => Code::CompressionError,
        DisconnectReason::ServiceNotAvailable => Code::ServiceNotAvailable,
        DisconnectReason::ProtocolVersionNotSupported => Code::ProtocolVersionNotSupported,
        DisconnectReason::HostKeyNotVerifiable => Code::HostKeyNotVerifiable,
        DisconnectReason::ConnectionLost => Code::ConnectionLost,
        DisconnectReason::ByApplication => Code::ByApplication,
        DisconnectReason::TooManyConnections => Code::TooManyConnections,
        DisconnectReason::AuthCancelledByUser => Code::AuthCancelledByUser,
        DisconnectReason::NoMoreAuthMethodsAvailable => Code::NoMoreAuthMethodsAvailable,
        DisconnectReason::IllegalUserName => Code::IllegalUserName,
    }
}

/// Target of the engine's protocol trace
const TRACE_TARGET: &str = "oxide_ssh::libssh2";

/// Hands one libssh2 trace line to `tracing`.
///
/// libssh2 only emits trace output when it was built with debugging enabled;
/// otherwise the handler is registered but never called.
extern "C" fn forward_trace(
    _session: *mut raw::LIBSSH2_SESSION,
    _context: *mut c_void,
    message: *const c_char,
    len: size_t,
) {
    if message.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let bytes = unsafe { std::slice::from_raw_parts(message as *const u8, len) };
        emit_trace(bytes);
    }));
}

fn emit_trace(bytes: &[u8]) {
    let line = String::from_utf8_lossy(bytes);
    trace!(target: TRACE_TARGET, "{}", line.trim_end());
}

/// State shared with the signing callback for the duration of one call.
struct SignContext<'a> {
    key: &'a dyn SshKey,
    failure: Option<String>,
}

extern "C" fn sign_challenge(
    _session: *mut raw::LIBSSH2_SESSION,
    sig: *mut *mut c_uchar,
    sig_len: *mut size_t,
    data: *const c_uchar,
    data_len: size_t,
    abstract_: *mut *mut c_void,
) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
        let ctx = &mut *((*abstract_) as *mut SignContext<'_>);
        let challenge = std::slice::from_raw_parts(data, data_len);

        let signature = match ctx.key.sign(challenge) {
            Ok(signature) => signature,
            Err(e) => {
                ctx.failure = Some(e.to_string());
                return -1;
            }
        };

        // libssh2 releases the buffer with its default allocator (free).
        let buf = libc::malloc(signature.len()) as *mut c_uchar;
        if buf.is_null() {
            ctx.failure = Some("Out of memory".to_string());
            return -1;
        }
        ptr::copy_nonoverlapping(signature.as_ptr(), buf, signature.len());
        *sig = buf;
        *sig_len = signature.len();
        0
    }));
    outcome.unwrap_or(-1)
}

/// Adapts a [`KeyboardInteractiveHandler`] to the `ssh2` prompt callback.
struct PromptBridge<'a> {
    handler: &'a mut dyn KeyboardInteractiveHandler,
}

impl ssh2::KeyboardInteractivePrompt for PromptBridge<'_> {
    fn prompt<'b>(
        &mut self,
        username: &str,
        instructions: &str,
        prompts: &[ssh2::Prompt<'b>],
    ) -> Vec<String> {
        let prompts: Vec<KbiPrompt> = prompts
            .iter()
            .map(|p| KbiPrompt {
                prompt: p.text.to_string(),
                echo: p.echo,
            })
            .collect();
        self.handler.respond(username, instructions, &prompts)
    }
}

struct Libssh2Session {
    session: Session,
}

impl EngineSession for Libssh2Session {
    fn set_timeout(&mut self, timeout: Duration) {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.session.set_timeout(millis);
    }

    fn set_method_preference(&mut self, method: MethodType, preferences: &str) -> EngineResult<()> {
        self.session
            .method_pref(method_type(method), preferences)
            .map_err(|e| map_error(&self.session, e))
    }

    fn supported_algorithms(&self, method: MethodType) -> EngineResult<Vec<String>> {
        let algorithms = self
            .session
            .supported_algs(method_type(method))
            .map_err(|e| native_error(&e))?;
        Ok(algorithms.into_iter().map(str::to_string).collect())
    }

    fn set_banner(&mut self, banner: &str) -> EngineResult<()> {
        self.session
            .set_banner(banner)
            .map_err(|e| map_error(&self.session, e))
    }

    fn set_trace(&mut self, enabled: bool) {
        let handler: Option<TraceCallback> = if enabled { Some(forward_trace) } else { None };
        let rc = {
            let mut raw_session = self.session.raw();
            let raw_ptr: *mut raw::LIBSSH2_SESSION = &mut *raw_session;
            unsafe { libssh2_trace_sethandler(raw_ptr, ptr::null_mut(), handler) }
        };
        if rc != 0 {
            debug!("libssh2 rejected the trace handler ({})", rc);
        }
        self.session.trace(if enabled {
            TraceFlags::all()
        } else {
            TraceFlags::empty()
        });
    }

    fn handshake(&mut self) -> EngineResult<()> {
        self.session
            .handshake()
            .map_err(|e| map_error(&self.session, e))
    }

    fn host_key(&self) -> Option<(HostKeyType, Vec<u8>)> {
        let (key, key_type) = self.session.host_key()?;
        let key_type = match key_type {
            ssh2::HostKeyType::Rsa => HostKeyType::Rsa,
            ssh2::HostKeyType::Dss => HostKeyType::Dss,
            ssh2::HostKeyType::Ecdsa256 => HostKeyType::Ecdsa256,
            ssh2::HostKeyType::Ecdsa384 => HostKeyType::Ecdsa384,
            ssh2::HostKeyType::Ecdsa521 => HostKeyType::Ecdsa521,
            ssh2::HostKeyType::Ed25519 => HostKeyType::Ed25519,
            _ => HostKeyType::Unknown,
        };
        Some((key_type, key.to_vec()))
    }

    fn negotiated_method(&self, method: MethodType) -> Option<String> {
        self.session.methods(method_type(method)).map(str::to_string)
    }

    fn banner(&self) -> Option<String> {
        self.session.banner().map(str::to_string)
    }

    fn auth_methods(&mut self, username: &str) -> EngineResult<Vec<String>> {
        let methods = self
            .session
            .auth_methods(username)
            .map_err(|e| map_error(&self.session, e))?;
        Ok(methods
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn is_authenticated(&self) -> bool {
        self.session.authenticated()
    }

    fn userauth_publickey(&mut self, username: &str, key: &dyn SshKey) -> EngineResult<()> {
        let username_c = CString::new(username)
            .map_err(|_| EngineError::native(codes::INVAL, "Username contains a NUL byte"))?;
        let blob = key
            .public_key_blob()
            .map_err(|e| EngineError::native(codes::AUTHENTICATION_FAILED, e.to_string()))?;

        let mut ctx = SignContext { key, failure: None };
        let mut abstract_ptr = &mut ctx as *mut SignContext<'_> as *mut c_void;

        let rc = {
            let mut raw_session = self.session.raw();
            let raw_ptr: *mut raw::LIBSSH2_SESSION = &mut *raw_session;
            unsafe {
                libssh2_userauth_publickey(
                    raw_ptr,
                    username_c.as_ptr(),
                    blob.as_ptr(),
                    blob.len(),
                    Some(sign_challenge),
                    &mut abstract_ptr,
                )
            }
        };

        if rc == 0 {
            return Ok(());
        }
        if let Some(reason) = ctx.failure.take() {
            return Err(EngineError::native(
                codes::AUTHENTICATION_FAILED,
                format!("Signing callback failed: {}", reason),
            ));
        }
        if rc == raw::LIBSSH2_ERROR_EAGAIN {
            return Err(EngineError::WouldBlock(block_direction(&self.session)));
        }
        let err = ssh2::Error::from_session_error(&self.session, rc);
        Err(EngineError::native(rc, err.message()))
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        handler: &mut dyn KeyboardInteractiveHandler,
    ) -> EngineResult<()> {
        let mut bridge = PromptBridge { handler };
        self.session
            .userauth_keyboard_interactive(username, &mut bridge)
            .map_err(|e| map_error(&self.session, e))
    }

    fn open_channel(
        &mut self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
    ) -> EngineResult<Box<dyn EngineChannel>> {
        let channel = self
            .session
            .channel_open(kind, window_size, packet_size, None)
            .map_err(|e| map_error(&self.session, e))?;
        Ok(Box::new(Libssh2Channel {
            channel: Some(channel),
            session: self.session.clone(),
        }))
    }

    fn configure_keepalive(&mut self, want_reply: bool, interval_secs: u32) {
        self.session.set_keepalive(want_reply, interval_secs);
    }

    fn send_keepalive(&mut self) -> EngineResult<u32> {
        self.session
            .keepalive_send()
            .map_err(|e| map_error(&self.session, e))
    }

    fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> EngineResult<()> {
        self.session
            .disconnect(Some(disconnect_code(reason)), description, None)
            .map_err(|e| map_error(&self.session, e))
    }

    fn last_error(&self) -> Option<EngineError> {
        ssh2::Error::last_session_error(&self.session).map(|e| native_error(&e))
    }
}

impl Drop for Libssh2Session {
    fn drop(&mut self) {
        // Freeing may need to flush; let libssh2 wait for the socket itself.
        self.session.set_timeout(RELEASE_TIMEOUT_MS);
        self.session.set_blocking(true);
    }
}

struct Libssh2Channel {
    channel: Option<Channel>,
    session: Session,
}

impl Libssh2Channel {
    fn channel(&mut self) -> EngineResult<&mut Channel> {
        self.channel
            .as_mut()
            .ok_or_else(|| EngineError::native(codes::BAD_USE, "Channel already released"))
    }

    fn channel_ref(&self) -> EngineResult<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| EngineError::native(codes::BAD_USE, "Channel already released"))
    }

    fn io_error(&self, err: io::Error) -> EngineError {
        if err.kind() == io::ErrorKind::WouldBlock {
            return EngineError::WouldBlock(block_direction(&self.session));
        }
        ssh2::Error::last_session_error(&self.session)
            .map(|e| native_error(&e))
            .unwrap_or_else(|| EngineError::native(codes::SOCKET_RECV, err.to_string()))
    }
}

impl EngineChannel for Libssh2Channel {
    fn request_pty(&mut self, term: &str, size: TerminalSize) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .request_pty(
                term,
                None,
                Some((size.cols, size.rows, size.pixel_width, size.pixel_height)),
            )
            .map_err(|e| map_error(&session, e))
    }

    fn resize_pty(&mut self, size: TerminalSize) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .request_pty_size(
                size.cols,
                size.rows,
                Some(size.pixel_width),
                Some(size.pixel_height),
            )
            .map_err(|e| map_error(&session, e))
    }

    fn set_env(&mut self, name: &str, value: &str) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .setenv(name, value)
            .map_err(|e| map_error(&session, e))
    }

    fn process_startup(&mut self, request: &str, message: Option<&str>) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .process_startup(request, message)
            .map_err(|e| map_error(&session, e))
    }

    fn set_extended_data(&mut self, policy: ExtendedDataPolicy) -> EngineResult<()> {
        let mode = match policy {
            ExtendedDataPolicy::Merge => ssh2::ExtendedData::Merge,
            ExtendedDataPolicy::Ignore => ssh2::ExtendedData::Ignore,
            ExtendedDataPolicy::Separate => ssh2::ExtendedData::Normal,
        };
        let session = self.session.clone();
        self.channel()?
            .handle_extended_data(mode)
            .map_err(|e| map_error(&session, e))
    }

    fn read(&mut self, stream_id: i32, buf: &mut [u8]) -> EngineResult<usize> {
        let result = self.channel_ref()?.stream(stream_id).read(buf);
        result.map_err(|e| self.io_error(e))
    }

    fn write(&mut self, stream_id: i32, buf: &[u8]) -> EngineResult<usize> {
        let result = self.channel_ref()?.stream(stream_id).write(buf);
        result.map_err(|e| self.io_error(e))
    }

    fn pending_bytes(&self) -> usize {
        self.channel
            .as_ref()
            .map_or(0, |channel| channel.read_window().available as usize)
    }

    fn is_eof(&self) -> bool {
        self.channel.as_ref().map_or(true, Channel::eof)
    }

    fn send_eof(&mut self) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .send_eof()
            .map_err(|e| map_error(&session, e))
    }

    fn wait_eof(&mut self) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .wait_eof()
            .map_err(|e| map_error(&session, e))
    }

    fn close(&mut self) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?.close().map_err(|e| map_error(&session, e))
    }

    fn wait_closed(&mut self) -> EngineResult<()> {
        let session = self.session.clone();
        self.channel()?
            .wait_close()
            .map_err(|e| map_error(&session, e))
    }

    fn exit_status(&self) -> EngineResult<i32> {
        self.channel_ref()?
            .exit_status()
            .map_err(|e| map_error(&self.session, e))
    }

    fn exit_signal(&self) -> EngineResult<ExitSignal> {
        let signal = self
            .channel_ref()?
            .exit_signal()
            .map_err(|e| map_error(&self.session, e))?;
        Ok(ExitSignal {
            signal: signal.exit_signal,
            error_message: signal.error_message,
            lang_tag: signal.lang_tag,
        })
    }
}

impl Drop for Libssh2Channel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.session.set_timeout(RELEASE_TIMEOUT_MS);
            self.session.set_blocking(true);
            drop(channel);
            self.session.set_blocking(false);
            trace!("libssh2 channel released");
        }
    }
}

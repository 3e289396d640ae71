//! Shell connection configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{ExtendedDataPolicy, TerminalSize};

/// What to do with the server's host key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any key without consulting known_hosts
    AcceptAny,
    /// Trust unknown hosts on first use and remember them; reject changed keys
    #[default]
    AcceptNew,
    /// Only accept keys already in known_hosts
    Strict,
}

/// Pseudo-terminal request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Terminal type, e.g. `xterm`
    #[serde(default = "default_term")]
    pub term: String,

    #[serde(default)]
    pub size: TerminalSize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            term: default_term(),
            size: TerminalSize::default(),
        }
    }
}

/// Interactive shell connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Connection timeout in seconds, covering socket, handshake,
    /// authentication and shell startup
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Preferred locale as a language tag (e.g. `en-AU`); sent as `LC_ALL`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,

    /// Channel receive window in bytes
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Maximum channel packet size in bytes
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,

    /// Handling of the shell's stderr stream
    #[serde(default)]
    pub extended_data: ExtendedDataPolicy,

    /// Seconds between keepalives while idle (0 disables)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u32,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Identification string sent instead of the engine's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_banner: Option<String>,

    /// Forward the engine's protocol trace to `tracing` (target `oxide_ssh::libssh2`)
    #[serde(default)]
    pub engine_trace: bool,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_term() -> String {
    "xterm".to_string()
}

fn default_window_size() -> u32 {
    2 * 1024 * 1024
}

fn default_packet_size() -> u32 {
    32768
}

fn default_keepalive_interval() -> u32 {
    30
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            timeout_secs: default_timeout(),
            terminal: TerminalConfig::default(),
            locale: None,
            window_size: default_window_size(),
            packet_size: default_packet_size(),
            extended_data: ExtendedDataPolicy::default(),
            keepalive_interval_secs: default_keepalive_interval(),
            host_key_policy: HostKeyPolicy::default(),
            client_banner: None,
            engine_trace: false,
        }
    }
}

impl ShellConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Keepalive interval, `None` when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.keepalive_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// `LC_ALL` value for the configured locale.
    ///
    /// `en-AU` and `en_AU` become `en_AU.UTF-8`; a tag that already names a
    /// codeset is passed through unchanged.
    pub fn locale_variable(&self) -> Option<String> {
        let tag = self.locale.as_deref()?.trim();
        if tag.is_empty() {
            return None;
        }
        if tag.contains('.') {
            return Some(tag.to_string());
        }

        let mut parts = tag.split(['-', '_']);
        let language = parts.next()?.to_lowercase();
        Some(match parts.next() {
            Some(region) if !region.is_empty() => {
                format!("{}_{}.UTF-8", language, region.to_uppercase())
            }
            _ => format!("{}.UTF-8", language),
        })
    }
}

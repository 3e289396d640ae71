//! Known hosts management for SSH host key verification
//!
//! Reads and appends OpenSSH `known_hosts` files. Hashed host names are not
//! matched.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::engine::HostKeyType;

/// Server host key as presented during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostKey {
    pub key_type: HostKeyType,
    /// Public key in SSH wire encoding
    #[serde(skip)]
    pub key: Vec<u8>,
    /// `SHA256:<base64>`
    pub fingerprint: String,
}

impl HostKey {
    pub fn new(key_type: HostKeyType, key: Vec<u8>) -> Self {
        let fingerprint = fingerprint(&key);
        Self {
            key_type,
            key,
            fingerprint,
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.key)
    }
}

/// SHA256 fingerprint of a wire-encoded public key
pub fn fingerprint(key: &[u8]) -> String {
    let hash = Sha256::digest(key);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Decides whether a server may be trusted
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &HostKey) -> HostKeyVerification;

    /// Remember `key` for later connections.
    fn accept(&self, host: &str, port: u16, key: &HostKey) -> Result<(), SshError>;
}

/// Trusts every host key
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, key: &HostKey) -> HostKeyVerification {
        debug!(
            "Accepting {} host key for {}:{} without verification",
            key.key_type.name(),
            host,
            port
        );
        HostKeyVerification::Verified
    }

    fn accept(&self, _host: &str, _port: u16, _key: &HostKey) -> Result<(), SshError> {
        Ok(())
    }
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Host keys backed by a known_hosts file
pub struct KnownHostsStore {
    /// host (or `[host]:port`) -> keys, one per key type
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownHostsStore {
    /// Load `~/.ssh/known_hosts`
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"));

        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts: {}", e);
        }

        store
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            debug!("Known hosts file not found or empty: {}", e);
        }

        store
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 || parts[0].starts_with('@') {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Lowercase; `[host]:22` collapses to `host`, other ports are kept.
    fn normalize_hostname(host: &str) -> String {
        let host = host.to_lowercase();
        if let Some(rest) = host.strip_prefix('[') {
            if let Some((name, port)) = rest.split_once("]:") {
                return match port.parse::<u16>() {
                    Ok(port) => Self::make_key(name, port),
                    Err(_) => name.to_string(),
                };
            }
            return rest.trim_end_matches(']').to_string();
        }
        host
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    fn fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => fingerprint(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{} {} {}", host, key_type, key_b64)?;
        Ok(())
    }
}

impl HostKeyVerifier for KnownHostsStore {
    fn verify(&self, host: &str, port: u16, key: &HostKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = key.to_base64();
        let actual_key_type = key.key_type.name();

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown {
                fingerprint: key.fingerprint.clone(),
            };
        };

        match entries.iter().find(|e| e.key_type == actual_key_type) {
            Some(entry) if entry.key_data == actual_key_b64 => {
                debug!(
                    "Host key verified for {} (type: {})",
                    lookup_key, actual_key_type
                );
                HostKeyVerification::Verified
            }
            Some(entry) => {
                let expected_fingerprint = Self::fingerprint_from_b64(&entry.key_data);
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    lookup_key, actual_key_type, expected_fingerprint, key.fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: key.fingerprint.clone(),
                }
            }
            None => {
                debug!(
                    "Host {} known but no {} key stored, treating as new",
                    lookup_key, actual_key_type
                );
                HostKeyVerification::Unknown {
                    fingerprint: key.fingerprint.clone(),
                }
            }
        }
    }

    fn accept(&self, host: &str, port: u16, key: &HostKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_type = key.key_type.name();
        let key_b64 = key.to_base64();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_b64.clone(),
            });

        self.append_to_file(&lookup_key, key_type, &key_b64)?;

        info!(
            "Added host key for {} (type: {}) to known_hosts",
            lookup_key, key_type
        );
        Ok(())
    }
}

//! Key material for public key authentication
//!
//! Authentication only ever needs two things from a key: its public half in
//! SSH wire encoding and the ability to sign a challenge. [`SshKey`] is that
//! capability, so a signer may just as well sit in a hardware token as in
//! memory. [`OpenSshKey`] is the in-memory implementation for OpenSSH private
//! key files.

use std::path::Path;

use signature::Signer;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};
use tracing::debug;
use zeroize::Zeroizing;

use super::error::SshError;

/// Signing capability offered to the server during authentication
pub trait SshKey: Send + Sync {
    /// Public key algorithm name, e.g. `ssh-ed25519`
    fn algorithm(&self) -> String;

    /// Public key in SSH wire encoding
    fn public_key_blob(&self) -> Result<Vec<u8>, SshError>;

    /// Sign `data`, returning the raw signature blob (without algorithm name).
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SshError>;
}

/// Key algorithms that can be generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Ed25519,
    EcdsaP256,
}

/// In-memory OpenSSH private key
pub struct OpenSshKey {
    private: PrivateKey,
}

impl OpenSshKey {
    /// Parse an OpenSSH private key, decrypting it if needed.
    pub fn from_openssh(pem: &str, passphrase: Option<&str>) -> Result<Self, SshError> {
        let private = PrivateKey::from_openssh(pem)?;
        let private = if private.is_encrypted() {
            let passphrase = passphrase.ok_or_else(|| {
                SshError::KeyError("Key is encrypted and no passphrase was given".to_string())
            })?;
            private.decrypt(passphrase)?
        } else {
            private
        };
        debug!(
            "Loaded {} key {}",
            private.algorithm(),
            private.fingerprint(HashAlg::Sha256)
        );
        Ok(Self { private })
    }

    /// Load a private key file.
    pub fn load(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self, SshError> {
        let pem = Zeroizing::new(std::fs::read_to_string(path.as_ref())?);
        Self::from_openssh(&pem, passphrase)
    }

    /// Generate a fresh key pair.
    pub fn generate(kind: KeyKind) -> Result<Self, SshError> {
        let algorithm = match kind {
            KeyKind::Ed25519 => Algorithm::Ed25519,
            KeyKind::EcdsaP256 => Algorithm::Ecdsa {
                curve: ssh_key::EcdsaCurve::NistP256,
            },
        };
        let private = PrivateKey::random(&mut ssh_key::rand_core::OsRng, algorithm)?;
        Ok(Self { private })
    }

    /// SHA-256 fingerprint, `SHA256:...`
    pub fn fingerprint(&self) -> String {
        self.private.fingerprint(HashAlg::Sha256).to_string()
    }

    /// Public key as an `authorized_keys` line
    pub fn public_key_openssh(&self) -> Result<String, SshError> {
        Ok(self.private.public_key().to_openssh()?)
    }

    /// Private key in OpenSSH format
    pub fn to_openssh(&self) -> Result<Zeroizing<String>, SshError> {
        Ok(self.private.to_openssh(LineEnding::LF)?)
    }
}

impl SshKey for OpenSshKey {
    fn algorithm(&self) -> String {
        self.private.algorithm().as_str().to_string()
    }

    fn public_key_blob(&self) -> Result<Vec<u8>, SshError> {
        Ok(self.private.public_key().to_bytes()?)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SshError> {
        let signature = self
            .private
            .try_sign(data)
            .map_err(|e| SshError::KeyError(format!("Signing failed: {}", e)))?;
        Ok(signature.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for OpenSshKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSshKey")
            .field("algorithm", &self.private.algorithm().as_str())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signature::Verifier;
    use ssh_key::{PublicKey, Signature};

    #[test]
    fn test_generate_and_sign_ed25519() {
        let key = OpenSshKey::generate(KeyKind::Ed25519).unwrap();
        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert!(key.fingerprint().starts_with("SHA256:"));

        let data = b"session-id and userauth request";
        let raw = key.sign(data).unwrap();
        assert_eq!(raw.len(), 64);

        let public = PublicKey::from_bytes(&key.public_key_blob().unwrap()).unwrap();
        let signature = Signature::new(Algorithm::Ed25519, raw).unwrap();
        assert!(Verifier::verify(&public, data, &signature).is_ok());
    }

    #[test]
    fn test_openssh_round_trip_through_file() {
        let key = OpenSshKey::generate(KeyKind::Ed25519).unwrap();
        let pem = key.to_openssh().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let loaded = OpenSshKey::load(&path, None).unwrap();
        assert_eq!(loaded.fingerprint(), key.fingerprint());
        assert!(loaded
            .public_key_openssh()
            .unwrap()
            .starts_with("ssh-ed25519 "));
    }

    #[test]
    fn test_invalid_key_is_key_error() {
        let err = OpenSshKey::from_openssh("not a key", None).unwrap_err();
        assert!(matches!(err, SshError::KeyError(_)));
    }

    #[test]
    fn test_ecdsa_algorithm_name() {
        let key = OpenSshKey::generate(KeyKind::EcdsaP256).unwrap();
        assert_eq!(key.algorithm(), "ecdsa-sha2-nistp256");
        assert!(!key.sign(b"data").unwrap().is_empty());
    }
}

use super::KeyPair;
use crate::service::{ServiceAddress, ServiceInfo};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};

/// Long-term key material of a local hidden service
///
/// The signing key authenticates introduction sets and frames, the static
/// X25519 key receives handshakes. Both are published through `ServiceInfo`.
#[derive(Clone)]
pub struct Identity {
    signing: KeyPair,
    encryption: StaticSecret,
    info: ServiceInfo,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_parts(KeyPair::generate(), StaticSecret::random_from_rng(OsRng))
    }

    fn from_parts(signing: KeyPair, encryption: StaticSecret) -> Self {
        let enc_public = X25519PublicKey::from(&encryption);
        let info = ServiceInfo::new(signing.public_key(), *enc_public.as_bytes());
        Self {
            signing,
            encryption,
            info,
        }
    }

    /// Public descriptor of this identity
    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn address(&self) -> ServiceAddress {
        self.info.address()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message)
    }

    /// X25519 agreement between our static key and a peer's ephemeral key
    pub fn key_exchange(&self, their_public: &[u8; 32]) -> SharedSecret {
        self.encryption
            .diffie_hellman(&X25519PublicKey::from(*their_public))
    }

    pub fn to_exportable(&self) -> ExportableIdentity {
        ExportableIdentity {
            signing_key: self.signing.secret_bytes(),
            encryption_key: self.encryption.to_bytes(),
        }
    }

    pub fn from_exportable(exportable: &ExportableIdentity) -> Self {
        Self::from_parts(
            KeyPair::from_secret_bytes(&exportable.signing_key),
            StaticSecret::from(exportable.encryption_key),
        )
    }

    /// Load the identity stored at `path`, creating and saving a new one if
    /// the file does not exist yet
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let json = std::fs::read_to_string(path)?;
            let exportable = ExportableIdentity::from_json(&json)?;
            let identity = Self::from_exportable(&exportable);
            info!("Loaded identity {} from {:?}", identity.address(), path);
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!("Generated identity {} at {:?}", identity.address(), path);
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let json = self.to_exportable().to_json()?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address())
            .field("signing_key", &self.info.signing_key)
            .finish()
    }
}

/// Keyfile format
#[derive(Serialize, Deserialize)]
pub struct ExportableIdentity {
    signing_key: [u8; 32],
    encryption_key: [u8; 32],
}

impl ExportableIdentity {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Keyfile I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed keyfile: {0}")]
    Format(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_matches_info() {
        let identity = Identity::generate();
        assert_eq!(identity.address(), identity.info().address());
        assert!(identity.info().verify_address(&identity.address()));
    }

    #[test]
    fn test_export_import_preserves_keys() {
        let identity = Identity::generate();
        let restored = Identity::from_exportable(&identity.to_exportable());

        assert_eq!(identity.address(), restored.address());
        assert_eq!(identity.info(), restored.info());
    }

    #[test]
    fn test_key_exchange_agrees_with_ephemeral_side() {
        let identity = Identity::generate();
        let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);

        let ours = identity.key_exchange(ephemeral_public.as_bytes());
        let theirs =
            ephemeral.diffie_hellman(&X25519PublicKey::from(identity.info().encryption_key));

        assert_eq!(ours.as_bytes(), theirs.as_bytes());
    }

    #[test]
    fn test_load_or_create_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.key");

        let created = Identity::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Identity::load_or_create(&path).unwrap();
        assert_eq!(created.address(), loaded.address());
    }

    #[test]
    fn test_corrupt_keyfile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.key");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            Identity::load_or_create(&path),
            Err(IdentityError::Format(_))
        ));
    }
}

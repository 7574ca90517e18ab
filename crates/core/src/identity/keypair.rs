use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 signing half of a service identity
#[derive(Clone)]
pub struct KeyPair(SigningKey);

impl KeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret_bytes(&secret)
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({}, <secret>)", self.public_key())
    }
}

/// Ed25519 verifying key, serialized as its 32 raw bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyPairError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| KeyPairError::InvalidPublicKey)
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Malformed signatures simply fail verification
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.0.verify(message, &Signature::from_bytes(signature)).is_ok()
    }
}

impl TryFrom<[u8; 32]> for PublicKey {
    type Error = KeyPairError;

    fn try_from(bytes: [u8; 32]) -> Result<Self, Self::Error> {
        Self::from_bytes(&bytes)
    }
}

impl From<PublicKey> for [u8; 32] {
    fn from(key: PublicKey) -> Self {
        key.as_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyPairError {
    #[error("Invalid public key")]
    InvalidPublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_secret_is_deterministic() {
        let first = KeyPair::generate();
        let second = KeyPair::from_secret_bytes(&first.secret_bytes());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"introduce me");

        assert!(keypair.public_key().verify(b"introduce me", &signature));
        assert!(!keypair.public_key().verify(b"introduce you", &signature));
        assert!(!KeyPair::generate().public_key().verify(b"introduce me", &signature));
    }

    #[test]
    fn test_public_key_bincode() {
        let public_key = KeyPair::generate().public_key();
        let encoded = bincode::serialize(&public_key).unwrap();
        assert_eq!(encoded.len(), 32);
        let decoded: PublicKey = bincode::deserialize(&encoded).unwrap();
        assert_eq!(public_key, decoded);
    }

    #[test]
    fn test_debug_hides_secret() {
        let keypair = KeyPair::generate();
        let debug = format!("{:?}", keypair);
        assert!(!debug.contains(&hex::encode(keypair.secret_bytes())));
    }
}

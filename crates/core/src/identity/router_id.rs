use super::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a relay in the path substrate
///
/// Derived from the relay's public key with BLAKE3. Also used as a DHT key,
/// which is why it carries an XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouterId([u8; 32]);

impl RouterId {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(*blake3::hash(&public_key.as_bytes()).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, RouterIdError> {
        let bytes = hex::decode(s).map_err(|_| RouterIdError::InvalidHex)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RouterIdError::InvalidLength)?;
        Ok(Self(array))
    }

    /// XOR distance to another key
    pub fn distance(&self, other: &RouterId) -> Distance {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterId({}...)", self.short_hex())
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// XOR distance between two keys, ordered big-endian
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; 32]);

impl Distance {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({}...)", hex::encode(&self.0[..4]))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterIdError {
    #[error("Invalid hexadecimal string")]
    InvalidHex,

    #[error("Invalid length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_router_id_hex_roundtrip() {
        let id = RouterId::from_public_key(&KeyPair::generate().public_key());
        assert_eq!(RouterId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(matches!(
            RouterId::from_hex("abcd"),
            Err(RouterIdError::InvalidLength)
        ));
        assert!(matches!(
            RouterId::from_hex("zz"),
            Err(RouterIdError::InvalidHex)
        ));
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_to_self() {
        let a = RouterId::from_bytes([7u8; 32]);
        let b = RouterId::from_bytes([9u8; 32]);

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a).as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn test_distance_ordering() {
        let origin = RouterId::from_bytes([0u8; 32]);
        let near = RouterId::from_bytes([1u8; 32]);
        let far = RouterId::from_bytes([255u8; 32]);

        assert!(origin.distance(&near) < origin.distance(&far));
    }
}

/// Hidden service addresses
///
/// An address is the BLAKE3 hash of the service's public descriptor, so a
/// descriptor can always be checked against the address it claims.

use crate::identity::{PublicKey, RouterId};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

const HOSTNAME_SUFFIX: &str = ".hs";

/// Stable identifier of a hidden service identity (e.g. "abc...xyz.hs")
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress([u8; 32]);

impl ServiceAddress {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hostname(&self) -> String {
        format!("{}{}", self.to_base32(), HOSTNAME_SUFFIX)
    }

    pub fn to_base32(&self) -> String {
        data_encoding::BASE32_NOPAD.encode(&self.0).to_lowercase()
    }

    /// Parse from hostname, with or without the `.hs` suffix
    pub fn from_hostname(hostname: &str) -> Result<Self, ServiceAddressError> {
        let hostname = hostname.trim().to_lowercase();
        let base32_part = hostname
            .strip_suffix(HOSTNAME_SUFFIX)
            .unwrap_or(&hostname);

        let bytes = data_encoding::BASE32_NOPAD
            .decode(base32_part.to_uppercase().as_bytes())
            .map_err(|_| ServiceAddressError::InvalidEncoding)?;

        let len = bytes.len();
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ServiceAddressError::InvalidLength(len))?;
        Ok(Self(array))
    }

    /// DHT key under which this service's introduction set is stored
    pub fn dht_key(&self) -> RouterId {
        RouterId::from_bytes(self.0)
    }
}

impl fmt::Debug for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceAddress({}...)", &self.to_base32()[..12])
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hostname())
    }
}

impl std::str::FromStr for ServiceAddress {
    type Err = ServiceAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hostname(s)
    }
}

/// Public descriptor of a hidden service
///
/// Carries the signing key that authenticates the service's introduction
/// sets and frames, and the X25519 key handshakes are addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub version: u8,
    pub signing_key: PublicKey,
    pub encryption_key: [u8; 32],
}

impl ServiceInfo {
    pub fn new(signing_key: PublicKey, encryption_key: [u8; 32]) -> Self {
        Self {
            version: 1,
            signing_key,
            encryption_key,
        }
    }

    pub fn address(&self) -> ServiceAddress {
        let mut hasher = Hasher::new();
        hasher.update(b"HSNET-SERVICE-V1");
        hasher.update(&[self.version]);
        hasher.update(&self.signing_key.as_bytes());
        hasher.update(&self.encryption_key);
        ServiceAddress(*hasher.finalize().as_bytes())
    }

    pub fn verify_address(&self, address: &ServiceAddress) -> bool {
        &self.address() == address
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.signing_key.verify(message, signature)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceAddressError {
    #[error("Invalid base32 encoding")]
    InvalidEncoding,

    #[error("Invalid address length: {0} (expected 32)")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_hostname_roundtrip() {
        let address = Identity::generate().address();
        let hostname = address.to_hostname();

        assert!(hostname.ends_with(".hs"));
        assert_eq!(ServiceAddress::from_hostname(&hostname).unwrap(), address);
        assert_eq!(
            ServiceAddress::from_hostname(&address.to_base32()).unwrap(),
            address
        );
        assert_eq!(
            ServiceAddress::from_hostname(&hostname.to_uppercase()).unwrap(),
            address
        );
    }

    #[test]
    fn test_invalid_hostnames() {
        assert!(matches!(
            ServiceAddress::from_hostname("not base32!.hs"),
            Err(ServiceAddressError::InvalidEncoding)
        ));
        assert!(matches!(
            ServiceAddress::from_hostname("mfrgg.hs"),
            Err(ServiceAddressError::InvalidLength(3))
        ));
    }

    #[test]
    fn test_address_binds_both_keys() {
        let a = Identity::generate();
        let b = Identity::generate();

        let mut forged = *a.info();
        forged.encryption_key = b.info().encryption_key;

        assert!(a.info().verify_address(&a.address()));
        assert!(!forged.verify_address(&a.address()));
    }
}

/// Introductions and introduction sets
///
/// An introduction advertises one rendezvous point of a hidden service: the
/// terminal relay of one of the service's inbound paths. The signed set of
/// all current introductions is what gets published to the DHT.

use crate::identity::{Identity, RouterId};
use crate::path::PathId;
use crate::service::{ServiceAddress, ServiceInfo};
use hsnet_common::{service, Tag};
use serde::{Deserialize, Serialize};

/// Ed25519 signature wrapper (64 bytes) with serde support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; 64]);

/// A single advertised rendezvous point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Introduction {
    /// Relay terminating the service's inbound path
    pub router: RouterId,

    /// Path on that relay leading back to the service
    pub path_id: PathId,

    /// Milliseconds since epoch after which the path is gone
    pub expires_at: u64,

    /// Measured path latency, lower is preferred
    pub latency: u64,
}

impl Introduction {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    fn signing_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.router.as_bytes());
        out.extend_from_slice(&self.path_id.as_u64().to_le_bytes());
        out.extend_from_slice(&self.expires_at.to_le_bytes());
        out.extend_from_slice(&self.latency.to_le_bytes());
    }
}

/// All currently valid rendezvous options for one service
///
/// Immutable once signed; a fresher set replaces an older one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroSet {
    pub service: ServiceInfo,
    pub intros: Vec<Introduction>,
    pub topic: Option<Tag>,
    pub created_at: u64,
    pub signature: Signature,
}

impl IntroSet {
    /// Build and sign an introduction set for `identity`
    pub fn signed(
        identity: &Identity,
        intros: Vec<Introduction>,
        topic: Option<Tag>,
        now: u64,
    ) -> Self {
        let mut set = Self {
            service: *identity.info(),
            intros,
            topic,
            created_at: now,
            signature: Signature([0u8; 64]),
        };
        set.signature = Signature(identity.sign(&set.signing_data()));
        set
    }

    pub fn address(&self) -> ServiceAddress {
        self.service.address()
    }

    pub fn verify(&self) -> bool {
        self.service.verify(&self.signing_data(), &self.signature.0)
    }

    /// True if any introduction has passed its expiry
    pub fn has_expired_intros(&self, now: u64) -> bool {
        self.intros.iter().any(|intro| intro.is_expired(now))
    }

    /// True if no introduction is usable any more
    pub fn is_expired(&self, now: u64) -> bool {
        self.intros.iter().all(|intro| intro.is_expired(now))
    }

    pub fn live_intros(&self, now: u64) -> impl Iterator<Item = &Introduction> {
        self.intros.iter().filter(move |intro| !intro.is_expired(now))
    }

    pub fn validate(&self, now: u64) -> Result<(), IntroSetError> {
        if !self.verify() {
            return Err(IntroSetError::InvalidSignature);
        }

        if self.intros.is_empty() {
            return Err(IntroSetError::NoIntroductions);
        }

        if self.intros.len() > service::MAX_INTROS {
            return Err(IntroSetError::TooManyIntroductions(self.intros.len()));
        }

        if self.is_expired(now) {
            return Err(IntroSetError::Expired);
        }

        Ok(())
    }

    fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(self.service.version);
        data.extend_from_slice(&self.service.signing_key.as_bytes());
        data.extend_from_slice(&self.service.encryption_key);
        for intro in &self.intros {
            intro.signing_bytes(&mut data);
        }
        match &self.topic {
            Some(tag) => {
                data.push(1);
                data.extend_from_slice(tag.as_bytes());
            }
            None => data.push(0),
        }
        data.extend_from_slice(&self.created_at.to_le_bytes());
        data
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntroSetError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("No introductions")]
    NoIntroductions,

    #[error("Too many introductions: {0}")]
    TooManyIntroductions(usize),

    #[error("All introductions expired")]
    Expired,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn intro(router: u8, expires_at: u64) -> Introduction {
        Introduction {
            router: RouterId::from_bytes([router; 32]),
            path_id: PathId(router as u64),
            expires_at,
            latency: 100,
        }
    }

    #[test]
    fn test_signed_set_verifies() {
        let identity = Identity::generate();
        let set = IntroSet::signed(&identity, vec![intro(1, 10_000)], None, 1_000);

        assert!(set.verify());
        assert_eq!(set.address(), identity.address());
        assert_eq!(set.validate(2_000), Ok(()));
    }

    #[test]
    fn test_tampering_breaks_signature() {
        let identity = Identity::generate();
        let mut set = IntroSet::signed(&identity, vec![intro(1, 10_000)], None, 1_000);
        set.intros[0].expires_at = 99_999;

        assert_eq!(set.validate(2_000), Err(IntroSetError::InvalidSignature));
    }

    #[test]
    fn test_validation_rejects_empty_and_expired() {
        let identity = Identity::generate();

        let empty = IntroSet::signed(&identity, vec![], None, 0);
        assert_eq!(empty.validate(0), Err(IntroSetError::NoIntroductions));

        let stale = IntroSet::signed(&identity, vec![intro(1, 500)], None, 0);
        assert_eq!(stale.validate(500), Err(IntroSetError::Expired));
    }

    #[test]
    fn test_too_many_intros() {
        let identity = Identity::generate();
        let intros = (0..=service::MAX_INTROS as u8)
            .map(|i| intro(i, 10_000))
            .collect();
        let set = IntroSet::signed(&identity, intros, None, 0);

        assert!(matches!(
            set.validate(0),
            Err(IntroSetError::TooManyIntroductions(_))
        ));
    }

    #[test]
    fn test_partial_expiry() {
        let identity = Identity::generate();
        let set = IntroSet::signed(
            &identity,
            vec![intro(1, 1_000), intro(2, 5_000)],
            Some(Tag::new("chat")),
            0,
        );

        assert!(set.has_expired_intros(2_000));
        assert!(!set.is_expired(2_000));
        assert_eq!(set.live_intros(2_000).count(), 1);
    }
}

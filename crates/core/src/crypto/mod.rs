/// Session cryptography
///
/// Key agreement is X25519 between an initiator's ephemeral key and the
/// responder's static identity key. The session key is derived with BLAKE3
/// in keyed mode, bound to the conversation tag. Frames are sealed with
/// ChaCha20-Poly1305 under a random nonce and signed by the sender.

mod worker;

pub use worker::{
    AcceptedIntro, CompletionSender, CryptoCompletion, CryptoJob, CryptoWorker, GeneratedIntro,
    InlineWorker, WorkerPool,
};

use crate::identity::Identity;
use crate::service::intro::Signature;
use crate::service::{ConvoTag, ProtocolFrame, ProtocolMessage, ServiceInfo};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};

/// Symmetric key of one conversation
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the conversation key from an X25519 agreement
    pub fn derive(shared_secret: &SharedSecret, tag: &ConvoTag) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(shared_secret.as_bytes());
        hasher.update(b"HSNET-SESSION-KEY-V1");
        hasher.update(tag.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Ephemeral X25519 key pair, consumed by the agreement
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn diffie_hellman(self, their_public: &[u8; 32]) -> SharedSecret {
        self.secret
            .diffie_hellman(&X25519PublicKey::from(*their_public))
    }
}

fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt and sign `message` under `key`
pub fn seal_frame(
    key: &SharedKey,
    identity: &Identity,
    message: &ProtocolMessage,
    ephemeral: Option<[u8; 32]>,
) -> Result<ProtocolFrame, CryptoError> {
    let plaintext =
        bincode::serialize(message).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    let nonce = random_nonce();
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut frame = ProtocolFrame {
        tag: message.tag,
        seqno: message.seqno,
        nonce,
        ephemeral,
        ciphertext,
        signature: Signature([0u8; 64]),
    };
    frame.signature = Signature(identity.sign(&frame.signing_data()));
    Ok(frame)
}

/// Decrypt `frame` and check it against the sender named inside
///
/// The caller still has to check that sender against whoever it expects on
/// this conversation.
pub fn open_frame(key: &SharedKey, frame: &ProtocolFrame) -> Result<ProtocolMessage, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&frame.nonce), frame.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let message: ProtocolMessage =
        bincode::deserialize(&plaintext).map_err(|e| CryptoError::Serialization(e.to_string()))?;

    if message.tag != frame.tag || message.seqno != frame.seqno {
        return Err(CryptoError::HeaderMismatch);
    }
    if !message
        .sender
        .verify(&frame.signing_data(), &frame.signature.0)
    {
        return Err(CryptoError::InvalidSignature);
    }
    Ok(message)
}

/// Initiator side of the handshake: fresh tag, fresh ephemeral key, first
/// message sealed under the derived key
pub fn generate_intro(
    identity: &Identity,
    remote: &ServiceInfo,
    mut message: ProtocolMessage,
) -> Result<GeneratedIntro, CryptoError> {
    let tag = ConvoTag::generate();
    let ephemeral = EphemeralKeyPair::generate();
    let ephemeral_public = ephemeral.public_key_bytes();
    let key = SharedKey::derive(&ephemeral.diffie_hellman(&remote.encryption_key), &tag);

    message.tag = tag;
    let frame = seal_frame(&key, identity, &message, Some(ephemeral_public))?;
    Ok(GeneratedIntro { tag, key, frame })
}

/// Responder side of the handshake
pub fn accept_intro(identity: &Identity, frame: &ProtocolFrame) -> Result<AcceptedIntro, CryptoError> {
    let ephemeral = frame.ephemeral.ok_or(CryptoError::NotHandshake)?;
    let key = SharedKey::derive(&identity.key_exchange(&ephemeral), &frame.tag);
    let message = open_frame(&key, frame)?;
    Ok(AcceptedIntro { key, message })
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Frame header does not match sealed message")]
    HeaderMismatch,

    #[error("Frame carries no handshake key")]
    NotHandshake,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ProtocolType;

    fn message(sender: &Identity, protocol: ProtocolType, payload: &[u8]) -> ProtocolMessage {
        ProtocolMessage {
            protocol,
            tag: ConvoTag::from_bytes([0; 16]),
            seqno: 0,
            sender: *sender.info(),
            reply_intro: None,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_handshake_both_sides_agree() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let generated =
            generate_intro(&alice, bob.info(), message(&alice, ProtocolType::Text, b"hi bob"))
                .unwrap();
        assert!(generated.frame.is_handshake());
        assert_eq!(generated.frame.tag, generated.tag);

        let accepted = accept_intro(&bob, &generated.frame).unwrap();
        assert_eq!(accepted.key, generated.key);
        assert_eq!(accepted.message.payload, b"hi bob");
        assert_eq!(accepted.message.sender_address(), alice.address());
    }

    #[test]
    fn test_wrong_responder_cannot_accept() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mallory = Identity::generate();

        let generated =
            generate_intro(&alice, bob.info(), message(&alice, ProtocolType::Text, b"x")).unwrap();
        assert_eq!(
            accept_intro(&mallory, &generated.frame).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_seal_open_roundtrip_and_tamper() {
        let alice = Identity::generate();
        let key = SharedKey::from_bytes([42; 32]);
        let mut msg = message(&alice, ProtocolType::Traffic, b"packet");
        msg.seqno = 5;

        let frame = seal_frame(&key, &alice, &msg, None).unwrap();
        assert_eq!(frame.seqno, 5);
        assert_eq!(open_frame(&key, &frame).unwrap(), msg);

        let mut replayed_header = frame.clone();
        replayed_header.seqno = 6;
        assert!(open_frame(&key, &replayed_header).is_err());

        let mut flipped = frame;
        flipped.ciphertext[0] ^= 0x01;
        assert_eq!(
            open_frame(&key, &flipped).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_forged_signature_rejected() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let key = SharedKey::from_bytes([1; 32]);

        // Mallory seals a message claiming to be Alice
        let frame = seal_frame(&key, &mallory, &message(&alice, ProtocolType::Text, b"x"), None)
            .unwrap();
        assert_eq!(
            open_frame(&key, &frame).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    #[test]
    fn test_accept_requires_handshake_frame() {
        let alice = Identity::generate();
        let key = SharedKey::from_bytes([3; 32]);
        let frame = seal_frame(&key, &alice, &message(&alice, ProtocolType::Text, b""), None)
            .unwrap();
        assert_eq!(
            accept_intro(&alice, &frame).unwrap_err(),
            CryptoError::NotHandshake
        );
    }

    #[test]
    fn test_nonces_differ_per_frame() {
        let alice = Identity::generate();
        let key = SharedKey::from_bytes([7; 32]);
        let msg = message(&alice, ProtocolType::Text, b"same");

        let a = seal_frame(&key, &alice, &msg, None).unwrap();
        let b = seal_frame(&key, &alice, &msg, None).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}

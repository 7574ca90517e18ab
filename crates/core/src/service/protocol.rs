/// Hidden service wire frames
///
/// A `ProtocolFrame` is what travels over a path: a conversation tag, a
/// sealed `ProtocolMessage` and the sender's signature. Handshake frames also
/// carry the initiator's ephemeral X25519 key. The sender's descriptor only
/// appears inside the sealed message, so relays never learn who is talking.

use crate::service::intro::{Introduction, Signature};
use crate::service::{ServiceAddress, ServiceInfo};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque per-conversation identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConvoTag([u8; 16]);

impl ConvoTag {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ConvoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConvoTag({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for ConvoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Kind of payload carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Session bookkeeping (handshake acknowledgements), never handed to the
    /// data handler
    Control,
    Text,
    Traffic,
}

/// Plaintext content of a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub protocol: ProtocolType,
    pub tag: ConvoTag,
    pub seqno: u64,

    /// Descriptor of the sending service
    pub sender: ServiceInfo,

    /// Where the sender wants replies delivered
    pub reply_intro: Option<Introduction>,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn sender_address(&self) -> ServiceAddress {
        self.sender.address()
    }
}

/// Encrypted, signed frame as carried over a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFrame {
    pub tag: ConvoTag,
    pub seqno: u64,
    pub nonce: [u8; 12],

    /// Initiator's ephemeral key, present only on handshake frames
    pub ephemeral: Option<[u8; 32]>,

    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,

    pub signature: Signature,
}

impl ProtocolFrame {
    pub fn is_handshake(&self) -> bool {
        self.ephemeral.is_some()
    }

    /// Bytes covered by the sender's signature
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(16 + 8 + 12 + 33 + self.ciphertext.len());
        data.extend_from_slice(self.tag.as_bytes());
        data.extend_from_slice(&self.seqno.to_le_bytes());
        data.extend_from_slice(&self.nonce);
        match &self.ephemeral {
            Some(key) => {
                data.push(1);
                data.extend_from_slice(key);
            }
            None => data.push(0),
        }
        data.extend_from_slice(&self.ciphertext);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convo_tags_are_unique() {
        let a = ConvoTag::generate();
        let b = ConvoTag::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_signing_data_covers_ephemeral() {
        let frame = ProtocolFrame {
            tag: ConvoTag::from_bytes([1; 16]),
            seqno: 7,
            nonce: [2; 12],
            ephemeral: None,
            ciphertext: vec![3, 4, 5],
            signature: Signature([0; 64]),
        };
        let mut handshake = frame.clone();
        handshake.ephemeral = Some([9; 32]);

        assert!(!frame.is_handshake());
        assert!(handshake.is_handshake());
        assert_ne!(frame.signing_data(), handshake.signing_data());
    }
}

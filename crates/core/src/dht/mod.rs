/// DHT messages and client interface
///
/// The endpoint does not run DHT nodes itself. It issues lookups and
/// publishes through a `DhtClient`, tagging each request with a transaction
/// id, and is handed the matching responses later.

use crate::identity::{PublicKey, RouterId};
use crate::path::PathId;
use crate::service::{IntroSet, ServiceAddress};
use hsnet_common::{Result, Tag};
use serde::{Deserialize, Serialize};

/// Transaction id correlating a request with its response
pub type TxId = u64;

/// Signed-off knowledge about a relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterContact {
    pub router: RouterId,
    pub public_key: PublicKey,
    pub addresses: Vec<String>,
    pub last_updated: u64,
}

impl RouterContact {
    pub fn new(public_key: PublicKey, addresses: Vec<String>, last_updated: u64) -> Self {
        Self {
            router: RouterId::from_public_key(&public_key),
            public_key,
            addresses,
            last_updated,
        }
    }

    /// The advertised id must be derived from the advertised key
    pub fn is_consistent(&self) -> bool {
        self.router == RouterId::from_public_key(&self.public_key)
    }
}

/// Response to an introset lookup, tag lookup or publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GotIntroMessage {
    pub txid: TxId,
    pub intro_sets: Vec<IntroSet>,
}

/// Response to a router lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GotRouterMessage {
    pub txid: TxId,
    pub routers: Vec<RouterContact>,
}

/// Requests the endpoint sends into the DHT
///
/// `via` names one of the endpoint's own paths to send through, or `None`
/// to let the client pick. Errors mean the request never left; responses
/// arrive as `GotIntroMessage` / `GotRouterMessage`.
pub trait DhtClient: Send {
    fn find_intro_set(
        &mut self,
        txid: TxId,
        via: Option<PathId>,
        address: &ServiceAddress,
    ) -> Result<()>;

    fn find_intro_sets_by_tag(&mut self, txid: TxId, via: Option<PathId>, tag: &Tag) -> Result<()>;

    fn find_router(&mut self, txid: TxId, via: Option<PathId>, router: &RouterId) -> Result<()>;

    fn publish_intro_set(
        &mut self,
        txid: TxId,
        via: Option<PathId>,
        intro_set: &IntroSet,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_router_contact_consistency() {
        let key = KeyPair::generate().public_key();
        let mut contact = RouterContact::new(key, vec!["127.0.0.1:9000".into()], 0);
        assert!(contact.is_consistent());

        contact.router = RouterId::from_bytes([0; 32]);
        assert!(!contact.is_consistent());
    }
}

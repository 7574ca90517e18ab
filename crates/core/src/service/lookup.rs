use crate::dht::TxId;
use crate::identity::RouterId;
use crate::service::ServiceAddress;
use hsnet_common::Tag;
use rand::Rng;
use std::collections::HashMap;

/// What an outstanding DHT request is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    IntroSet(ServiceAddress),
    Tag(Tag),
    Router(RouterId),
    /// Confirmation of our own introset publish
    Publish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLookup {
    pub kind: LookupKind,
    pub issued_at: u64,
}

/// Outstanding DHT requests by transaction id
///
/// Each id is resolved at most once: by `take` when a response arrives or by
/// `expire` when it times out.
#[derive(Debug)]
pub struct PendingLookups {
    pending: HashMap<TxId, PendingLookup>,
    next_txid: TxId,
}

impl PendingLookups {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_txid: rand::thread_rng().gen(),
        }
    }

    fn gen_txid(&mut self) -> TxId {
        loop {
            self.next_txid = self.next_txid.wrapping_add(1);
            if self.next_txid != 0 && !self.pending.contains_key(&self.next_txid) {
                return self.next_txid;
            }
        }
    }

    /// Allocate a transaction id for a new request
    pub fn register(&mut self, kind: LookupKind, now: u64) -> TxId {
        let txid = self.gen_txid();
        self.pending.insert(txid, PendingLookup { kind, issued_at: now });
        txid
    }

    pub fn get(&self, txid: TxId) -> Option<&PendingLookup> {
        self.pending.get(&txid)
    }

    pub fn take(&mut self, txid: TxId) -> Option<PendingLookup> {
        self.pending.remove(&txid)
    }

    pub fn contains(&self, txid: TxId) -> bool {
        self.pending.contains_key(&txid)
    }

    pub fn has_pending(&self, kind: &LookupKind) -> bool {
        self.pending.values().any(|p| p.kind == *kind)
    }

    /// Remove and return lookups older than `timeout`
    pub fn expire(&mut self, now: u64, timeout: u64) -> Vec<(TxId, PendingLookup)> {
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.issued_at) > timeout)
            .map(|(txid, p)| (*txid, *p))
            .collect();
        for (txid, _) in &expired {
            self.pending.remove(txid);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for PendingLookups {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_exactly_once() {
        let mut lookups = PendingLookups::new();
        let txid = lookups.register(LookupKind::Publish, 0);
        assert_ne!(txid, 0);
        assert!(lookups.contains(txid));

        assert_eq!(lookups.take(txid).map(|p| p.kind), Some(LookupKind::Publish));
        assert!(lookups.take(txid).is_none());
        assert!(lookups.expire(u64::MAX, 0).is_empty());
    }

    #[test]
    fn test_ids_unique() {
        let mut lookups = PendingLookups::new();
        let a = lookups.register(LookupKind::Tag(Tag::new("a")), 0);
        let b = lookups.register(LookupKind::Tag(Tag::new("b")), 0);
        assert_ne!(a, b);
        assert_eq!(lookups.len(), 2);
        assert!(lookups.has_pending(&LookupKind::Tag(Tag::new("a"))));
        assert!(!lookups.has_pending(&LookupKind::Publish));
    }

    #[test]
    fn test_expire() {
        let mut lookups = PendingLookups::new();
        let old = lookups.register(LookupKind::Publish, 0);
        let new = lookups.register(LookupKind::Publish, 1_500);

        let expired = lookups.expire(2_001, 2_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, old);
        assert!(lookups.contains(new));
    }
}

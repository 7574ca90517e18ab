/// Conversation state keyed by `ConvoTag`
///
/// Entries are created field by field as a handshake progresses, so every
/// field is optional until the session is complete.

use crate::crypto::SharedKey;
use crate::service::{ConvoTag, Introduction, ServiceAddress, ServiceInfo};
use hsnet_common::service;
use std::collections::{BTreeSet, HashMap};

/// Sliding window over received sequence numbers
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    /// Bit `i` set means `highest - i` was seen
    seen: u64,
}

impl ReplayWindow {
    /// Record `seqno`; false if it is a duplicate or too old
    pub fn accept(&mut self, seqno: u64) -> bool {
        let window = service::REPLAY_WINDOW;
        let Some(highest) = self.highest else {
            self.highest = Some(seqno);
            self.seen = 1;
            return true;
        };

        if seqno > highest {
            let shift = seqno - highest;
            self.seen = if shift >= window { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.highest = Some(seqno);
            return true;
        }

        let offset = highest - seqno;
        if offset >= window {
            return false;
        }
        let bit = 1u64 << offset;
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub shared_key: Option<SharedKey>,
    pub remote: Option<ServiceInfo>,
    /// Remote introduction replies are sent to
    pub intro: Option<Introduction>,
    pub last_used: u64,
    /// Last sequence number we sent
    pub seqno: u64,
    replay: ReplayWindow,
}

impl Session {
    fn new(now: u64) -> Self {
        Self {
            last_used: now,
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared_key.is_some() && self.remote.is_some()
    }

    pub fn is_expired(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.last_used) > timeout
    }
}

#[derive(Debug, Default)]
pub struct SessionCache {
    sessions: HashMap<ConvoTag, Session>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, tag: ConvoTag, now: u64) -> &mut Session {
        let session = self.sessions.entry(tag).or_insert_with(|| Session::new(now));
        session.last_used = now;
        session
    }

    pub fn get(&self, tag: &ConvoTag) -> Option<&Session> {
        self.sessions.get(tag)
    }

    pub fn contains(&self, tag: &ConvoTag) -> bool {
        self.sessions.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get_cached_session_key_for(&self, tag: &ConvoTag) -> Option<&SharedKey> {
        self.sessions.get(tag)?.shared_key.as_ref()
    }

    pub fn put_cached_session_key_for(&mut self, tag: ConvoTag, key: SharedKey, now: u64) {
        self.entry(tag, now).shared_key = Some(key);
    }

    pub fn get_sender_for(&self, tag: &ConvoTag) -> Option<&ServiceInfo> {
        self.sessions.get(tag)?.remote.as_ref()
    }

    pub fn put_sender_for(&mut self, tag: ConvoTag, info: ServiceInfo, now: u64) {
        self.entry(tag, now).remote = Some(info);
    }

    pub fn get_intro_for(&self, tag: &ConvoTag) -> Option<&Introduction> {
        self.sessions.get(tag)?.intro.as_ref()
    }

    pub fn put_intro_for(&mut self, tag: ConvoTag, intro: Introduction, now: u64) {
        self.entry(tag, now).intro = Some(intro);
    }

    /// All conversations with the service described by `info`
    pub fn get_convo_tags_for_service(&self, info: &ServiceInfo) -> BTreeSet<ConvoTag> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.remote.as_ref() == Some(info))
            .map(|(tag, _)| *tag)
            .collect()
    }

    /// All conversations with the service at `address`
    pub fn tags_for_address(&self, address: &ServiceAddress) -> BTreeSet<ConvoTag> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.remote.map(|r| r.address()).as_ref() == Some(address))
            .map(|(tag, _)| *tag)
            .collect()
    }

    /// Some complete conversation with `address`, most recently used first
    pub fn best_tag_for(&self, address: &ServiceAddress) -> Option<ConvoTag> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.is_complete())
            .filter(|(_, s)| s.remote.map(|r| r.address()).as_ref() == Some(address))
            .max_by_key(|(_, s)| s.last_used)
            .map(|(tag, _)| *tag)
    }

    /// Next sequence number to send on `tag`
    pub fn next_seqno(&mut self, tag: &ConvoTag) -> Option<u64> {
        let session = self.sessions.get_mut(tag)?;
        session.seqno += 1;
        Some(session.seqno)
    }

    /// Record a sequence number chosen elsewhere
    pub fn set_seqno(&mut self, tag: &ConvoTag, seqno: u64) {
        if let Some(session) = self.sessions.get_mut(tag) {
            session.seqno = seqno;
        }
    }

    /// Check an inbound sequence number against the replay window
    pub fn accept_seqno(&mut self, tag: &ConvoTag, seqno: u64) -> bool {
        match self.sessions.get_mut(tag) {
            Some(session) => session.replay.accept(seqno),
            None => false,
        }
    }

    pub fn mark_used(&mut self, tag: &ConvoTag, now: u64) {
        if let Some(session) = self.sessions.get_mut(tag) {
            session.last_used = now;
        }
    }

    pub fn remove(&mut self, tag: &ConvoTag) -> Option<Session> {
        self.sessions.remove(tag)
    }

    /// Drop sessions idle for longer than `timeout`, returning their tags
    pub fn expire(&mut self, now: u64, timeout: u64) -> Vec<ConvoTag> {
        let expired: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now, timeout))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in &expired {
            self.sessions.remove(tag);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::default();
        assert!(window.accept(10));
        assert!(!window.accept(10));
        assert!(window.accept(12));
        assert!(window.accept(11));
        assert!(!window.accept(11));

        assert!(window.accept(200));
        // more than a window behind
        assert!(!window.accept(12));
        assert!(window.accept(200 - service::REPLAY_WINDOW + 1));
        assert!(!window.accept(200 - service::REPLAY_WINDOW));
    }

    #[test]
    fn test_fields_populate_independently() {
        let mut cache = SessionCache::new();
        let tag = ConvoTag::generate();
        let remote = Identity::generate();

        cache.put_sender_for(tag, *remote.info(), 10);
        assert!(cache.get_cached_session_key_for(&tag).is_none());
        assert!(!cache.get(&tag).unwrap().is_complete());

        cache.put_cached_session_key_for(tag, SharedKey::from_bytes([1; 32]), 20);
        assert!(cache.get(&tag).unwrap().is_complete());
        assert_eq!(cache.get(&tag).unwrap().last_used, 20);
        assert_eq!(cache.get_sender_for(&tag), Some(remote.info()));
        assert_eq!(cache.best_tag_for(&remote.address()), Some(tag));
    }

    #[test]
    fn test_convo_tags_for_service() {
        let mut cache = SessionCache::new();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let a1 = ConvoTag::generate();
        let a2 = ConvoTag::generate();
        let b1 = ConvoTag::generate();

        cache.put_sender_for(a1, *alice.info(), 0);
        cache.put_sender_for(a2, *alice.info(), 0);
        cache.put_sender_for(b1, *bob.info(), 0);

        let tags = cache.get_convo_tags_for_service(alice.info());
        assert_eq!(tags.len(), 2);
        assert!(tags.contains(&a1) && tags.contains(&a2));
        assert_eq!(cache.tags_for_address(&bob.address()).len(), 1);
    }

    #[test]
    fn test_seqno_and_expiry() {
        let mut cache = SessionCache::new();
        let tag = ConvoTag::generate();
        assert_eq!(cache.next_seqno(&tag), None);

        cache.put_cached_session_key_for(tag, SharedKey::from_bytes([2; 32]), 0);
        assert_eq!(cache.next_seqno(&tag), Some(1));
        assert_eq!(cache.next_seqno(&tag), Some(2));
        cache.set_seqno(&tag, 10);
        assert_eq!(cache.next_seqno(&tag), Some(11));

        assert!(cache.expire(100, 100).is_empty());
        cache.mark_used(&tag, 50);
        assert_eq!(cache.expire(151, 100), vec![tag]);
        assert!(cache.is_empty());
    }
}

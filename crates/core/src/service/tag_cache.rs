use crate::dht::TxId;
use crate::service::IntroSet;
use hsnet_common::{service, Tag};
use std::collections::{HashMap, HashSet};

/// Most recent lookup result for one topic tag
#[derive(Debug, Clone)]
pub struct CachedTagResult {
    pub tag: Tag,
    /// When the last lookup for this tag was issued
    pub last_request: u64,
    /// When `result` was last replaced
    pub last_modified: u64,
    pub result: Vec<IntroSet>,
    pub pending_tx: Option<TxId>,
}

impl CachedTagResult {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            last_request: 0,
            last_modified: 0,
            result: Vec::new(),
            pending_tx: None,
        }
    }

    pub fn should_refresh(&self, now: u64) -> bool {
        if now <= self.last_request {
            return false;
        }
        now - self.last_request > service::TAG_CACHE_TTL_MS
    }

    /// Replace the result set with a lookup response
    ///
    /// Introsets must already be validated. Returns false, leaving the cache
    /// untouched, when the response holds nothing usable.
    pub fn handle_response(&mut self, intro_sets: Vec<IntroSet>, now: u64) -> bool {
        let fresh: Vec<_> = intro_sets
            .into_iter()
            .filter(|set| set.topic == Some(self.tag))
            .collect();
        if fresh.is_empty() {
            return false;
        }
        self.result = fresh;
        self.last_modified = now;
        true
    }

    /// Drop introsets whose introductions have all expired
    pub fn expire(&mut self, now: u64) {
        self.result.retain(|set| !set.is_expired(now));
    }
}

#[derive(Debug, Default)]
pub struct TagCache {
    entries: HashMap<Tag, CachedTagResult>,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &Tag) -> Option<&CachedTagResult> {
        self.entries.get(tag)
    }

    pub fn get_mut(&mut self, tag: &Tag) -> Option<&mut CachedTagResult> {
        self.entries.get_mut(tag)
    }

    /// Fetch the entry for `tag`, creating it if this is the first use.
    /// The flag is true when the entry was just created.
    pub fn entry(&mut self, tag: Tag) -> (&mut CachedTagResult, bool) {
        let created = !self.entries.contains_key(&tag);
        let entry = self
            .entries
            .entry(tag)
            .or_insert_with(|| CachedTagResult::new(tag));
        (entry, created)
    }

    /// Expire stale results and forget tags nobody subscribes to any more
    pub fn expire(&mut self, now: u64, subscribed: &HashSet<Tag>) {
        self.entries.retain(|tag, _| subscribed.contains(tag));
        for entry in self.entries.values_mut() {
            entry.expire(now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::service::intro::tests::intro;

    fn set_with_topic(topic: Option<Tag>, expires_at: u64) -> IntroSet {
        let identity = Identity::generate();
        IntroSet::signed(&identity, vec![intro(1, expires_at)], topic, 0)
    }

    #[test]
    fn test_should_refresh() {
        let mut entry = CachedTagResult::new(Tag::new("chat"));
        entry.last_request = 1_000;
        assert!(!entry.should_refresh(1_000));
        assert!(!entry.should_refresh(500));
        assert!(!entry.should_refresh(1_000 + service::TAG_CACHE_TTL_MS));
        assert!(entry.should_refresh(1_001 + service::TAG_CACHE_TTL_MS));
    }

    #[test]
    fn test_response_replaces_wholesale() {
        let tag = Tag::new("chat");
        let mut entry = CachedTagResult::new(tag);

        assert!(entry.handle_response(vec![set_with_topic(Some(tag), 100)], 5));
        assert!(entry.handle_response(
            vec![set_with_topic(Some(tag), 100), set_with_topic(Some(tag), 100)],
            7
        ));
        assert_eq!(entry.result.len(), 2);
        assert_eq!(entry.last_modified, 7);

        // empty and off-topic responses are not fresh and change nothing
        assert!(!entry.handle_response(Vec::new(), 9));
        assert!(!entry.handle_response(vec![set_with_topic(Some(Tag::new("other")), 100)], 9));
        assert_eq!(entry.result.len(), 2);
        assert_eq!(entry.last_modified, 7);
    }

    #[test]
    fn test_expire() {
        let tag = Tag::new("chat");
        let other = Tag::new("other");
        let mut cache = TagCache::new();

        let (entry, created) = cache.entry(tag);
        assert!(created);
        entry.handle_response(
            vec![set_with_topic(Some(tag), 50), set_with_topic(Some(tag), 500)],
            0,
        );
        let (_, created) = cache.entry(other);
        assert!(created);
        let (_, created) = cache.entry(tag);
        assert!(!created);

        let subscribed: HashSet<_> = [tag].into_iter().collect();
        cache.expire(100, &subscribed);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&tag).unwrap().result.len(), 1);
    }
}

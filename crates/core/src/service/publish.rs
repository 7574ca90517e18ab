use crate::dht::TxId;
use hsnet_common::service;

/// Tracks when our own introset was last published
///
/// At most one publish is in flight. After a failure the next attempt waits
/// for the short retry interval, otherwise for the regular interval since
/// the last confirmed publish.
#[derive(Debug, Default, Clone)]
pub struct PublishState {
    last_publish: Option<u64>,
    last_attempt: Option<u64>,
    current_tx: Option<TxId>,
    last_failed: bool,
}

impl PublishState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_publish(&self, now: u64) -> bool {
        if self.current_tx.is_some() {
            return false;
        }
        if self.last_failed {
            return self.last_attempt.map_or(true, |t| {
                now.saturating_sub(t) >= service::INTROSET_PUBLISH_RETRY_INTERVAL_MS
            });
        }
        self.last_publish.map_or(true, |t| {
            now.saturating_sub(t) >= service::INTROSET_PUBLISH_INTERVAL_MS
        })
    }

    pub fn begin(&mut self, txid: TxId, now: u64) {
        self.current_tx = Some(txid);
        self.last_attempt = Some(now);
    }

    pub fn current_tx(&self) -> Option<TxId> {
        self.current_tx
    }

    pub fn last_publish(&self) -> Option<u64> {
        self.last_publish
    }

    pub fn published(&mut self, now: u64) {
        self.last_publish = Some(now);
        self.current_tx = None;
        self.last_failed = false;
    }

    /// The retry interval runs from when the failed attempt was sent
    pub fn failed(&mut self) {
        self.current_tx = None;
        self.last_failed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_interval() {
        let mut state = PublishState::new();
        assert!(state.should_publish(0));

        state.begin(1, 0);
        assert!(!state.should_publish(0));
        state.published(10);
        assert_eq!(state.last_publish(), Some(10));

        assert!(!state.should_publish(10 + service::INTROSET_PUBLISH_INTERVAL_MS - 1));
        assert!(state.should_publish(10 + service::INTROSET_PUBLISH_INTERVAL_MS));
    }

    #[test]
    fn test_failure_uses_retry_interval() {
        let mut state = PublishState::new();
        state.begin(1, 100);
        state.failed();

        assert!(!state.should_publish(100 + service::INTROSET_PUBLISH_RETRY_INTERVAL_MS - 1));
        assert!(state.should_publish(100 + service::INTROSET_PUBLISH_RETRY_INTERVAL_MS));
    }

    #[test]
    fn test_late_failure_keeps_attempt_time() {
        let mut state = PublishState::new();
        state.begin(1, 100);
        assert!(!state.should_publish(2_000));
        // detected well after the attempt went out
        state.failed();

        assert!(state.should_publish(100 + service::INTROSET_PUBLISH_RETRY_INTERVAL_MS));
        assert!(state.current_tx().is_none());
    }

    #[test]
    fn test_clock_going_backwards() {
        let mut state = PublishState::new();
        state.begin(1, 1_000);
        state.published(1_000);
        assert!(!state.should_publish(0));
    }
}

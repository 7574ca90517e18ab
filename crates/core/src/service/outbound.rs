/// Outbound conversation setup towards one remote service
///
/// An `OutboundContext` walks a remote address from "unknown" to an
/// established conversation:
///
/// 1. look up the remote's introset in the DHT (with bounded retries)
/// 2. pick an introduction and build a path terminating at its relay
/// 3. send a handshake frame over that path and wait for the remote's ack
///
/// Once established, the conversation lives in the endpoint's session cache
/// and the context keeps the route fresh as introductions expire.

use crate::crypto::{CompletionSender, CryptoJob, CryptoWorker, GeneratedIntro, SharedKey};
use crate::dht::{DhtClient, TxId};
use crate::identity::Identity;
use crate::path::{BuiltPath, PathBuildError, PathId, PathSet, PathTransport, TerminalHop};
use crate::service::lookup::{LookupKind, PendingLookups};
use crate::service::session_cache::SessionCache;
use crate::service::sendq::QueuedSend;
use crate::service::{
    ConvoTag, IntroSet, Introduction, ProtocolMessage, ProtocolType, ServiceAddress,
};
use hsnet_common::{routing, service};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Endpoint state an outbound context works against
///
/// Built by the endpoint from disjoint borrows of its own fields for the
/// duration of one call.
pub(crate) struct SessionEnv<'a> {
    pub identity: &'a Arc<Identity>,
    pub sessions: &'a mut SessionCache,
    pub lookups: &'a mut PendingLookups,
    pub dht: &'a mut Box<dyn DhtClient>,
    pub paths: &'a mut Box<dyn PathTransport>,
    pub own_paths: &'a PathSet,
    pub worker: &'a Arc<dyn CryptoWorker>,
    pub completions: &'a CompletionSender,
}

/// Where an outbound context is in reaching its remote service
///
/// Hop selection has no state of its own: it runs synchronously inside the
/// transition from `AwaitingIntroSet` (or a failed build) to
/// `AwaitingPathBuild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    AwaitingIntroSet,
    AwaitingPathBuild,
    Handshaking,
    Established,
    Failed,
}

/// An established conversation as reported to `ensure_path_to_service`
/// callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundSession {
    pub remote: ServiceAddress,
    pub tag: ConvoTag,
    pub path: PathId,
    pub intro: Introduction,
}

#[derive(Debug)]
pub struct OutboundContext {
    remote: ServiceAddress,
    state: OutboundState,
    created_at: u64,

    current_intro_set: Option<IntroSet>,
    /// Introduction the pending build or handshake targets
    selected_intro: Option<Introduction>,
    /// When each introduction was last tried
    attempted: HashMap<Introduction, u64>,

    update_tx: Option<TxId>,
    lookup_retries: u32,
    next_lookup_at: u64,

    pending_path: Option<(PathId, u64)>,
    build_failures: u32,
    /// Path and introduction frames currently go out on
    route: Option<(PathId, Introduction)>,
    /// Path built for the handshake in progress
    handshake_path: Option<PathId>,

    handshake_started: u64,
    gen_in_flight: bool,
    candidate: Option<(ConvoTag, SharedKey)>,
    established: Option<ConvoTag>,
    sequence_no: u64,

    /// First message, piggybacked on the handshake
    intro_payload: Option<QueuedSend>,
    queued: VecDeque<QueuedSend>,
    last_activity: u64,
    failure: Option<String>,
}

impl OutboundContext {
    pub fn new(remote: ServiceAddress, now: u64) -> Self {
        Self {
            remote,
            state: OutboundState::AwaitingIntroSet,
            created_at: now,
            current_intro_set: None,
            selected_intro: None,
            attempted: HashMap::new(),
            update_tx: None,
            lookup_retries: 0,
            next_lookup_at: now,
            pending_path: None,
            build_failures: 0,
            route: None,
            handshake_path: None,
            handshake_started: 0,
            gen_in_flight: false,
            candidate: None,
            established: None,
            sequence_no: 0,
            intro_payload: None,
            queued: VecDeque::new(),
            last_activity: now,
            failure: None,
        }
    }

    pub fn remote(&self) -> &ServiceAddress {
        &self.remote
    }

    pub fn state(&self) -> OutboundState {
        self.state
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_established(&self) -> bool {
        self.state == OutboundState::Established
    }

    pub fn is_failed(&self) -> bool {
        self.state == OutboundState::Failed
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn current_intro_set(&self) -> Option<&IntroSet> {
        self.current_intro_set.as_ref()
    }

    pub fn selected_intro(&self) -> Option<&Introduction> {
        self.selected_intro.as_ref()
    }

    pub fn update_tx(&self) -> Option<TxId> {
        self.update_tx
    }

    pub fn pending_path(&self) -> Option<PathId> {
        self.pending_path.map(|(id, _)| id)
    }

    pub fn established_tag(&self) -> Option<ConvoTag> {
        self.established
    }

    /// Tag and key of the handshake awaiting its ack
    pub fn candidate(&self) -> Option<(&ConvoTag, &SharedKey)> {
        self.candidate.as_ref().map(|(tag, key)| (tag, key))
    }

    pub fn route(&self) -> Option<(PathId, Introduction)> {
        self.route
    }

    pub fn session(&self) -> Option<OutboundSession> {
        let tag = self.established?;
        let (path, intro) = self.route?;
        Some(OutboundSession {
            remote: self.remote,
            tag,
            path,
            intro,
        })
    }

    pub fn next_seqno(&mut self) -> u64 {
        let seqno = self.sequence_no;
        self.sequence_no += 1;
        seqno
    }

    pub fn mark_active(&mut self, now: u64) {
        self.last_activity = now;
    }

    /// Hold a message until the conversation is established
    pub fn queue_send(&mut self, send: QueuedSend) {
        self.queued.push_back(send);
    }

    pub fn take_queued(&mut self) -> Vec<QueuedSend> {
        self.queued.drain(..).collect()
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Giving up on {}: {}", self.remote, reason);
        self.state = OutboundState::Failed;
        self.failure = Some(reason);
        self.pending_path = None;
        self.candidate = None;
        self.update_tx = None;
    }

    fn lookup_backoff(retries: u32) -> u64 {
        let shift = retries.saturating_sub(1).min(16);
        (service::LOOKUP_BACKOFF_BASE_MS << shift).min(service::LOOKUP_RETRY_INTERVAL_MS)
    }

    /// Ask the DHT for the remote's current introset
    pub(crate) fn update_intro_set(&mut self, env: &mut SessionEnv<'_>, now: u64) {
        if self.update_tx.is_some() || self.is_failed() {
            return;
        }

        let txid = env.lookups.register(LookupKind::IntroSet(self.remote), now);
        let via = env.own_paths.closest_to(&self.remote.dht_key(), now);
        match env.dht.find_intro_set(txid, via, &self.remote) {
            Ok(()) => {
                debug!("Looking up introset for {} (tx {})", self.remote, txid);
                self.update_tx = Some(txid);
            }
            Err(e) => {
                warn!("Introset lookup for {} not sent: {}", self.remote, e);
                env.lookups.take(txid);
                self.lookup_failed(now);
            }
        }
    }

    fn lookup_failed(&mut self, now: u64) {
        self.lookup_retries += 1;
        if self.lookup_retries > service::MAX_INTROSET_LOOKUP_RETRIES {
            self.fail("introset lookup retries exhausted");
            return;
        }
        self.next_lookup_at = now + Self::lookup_backoff(self.lookup_retries);
    }

    /// Outcome of the lookup issued as `txid`; `None` means nothing valid
    /// came back or the lookup timed out
    pub(crate) fn on_intro_set_update(
        &mut self,
        env: &mut SessionEnv<'_>,
        txid: TxId,
        intro_set: Option<IntroSet>,
        now: u64,
    ) {
        if self.update_tx != Some(txid) {
            return;
        }
        self.update_tx = None;

        match intro_set {
            Some(set) => self.apply_intro_set(env, set, now),
            None => {
                debug!("Introset lookup for {} came back empty", self.remote);
                self.lookup_failed(now);
            }
        }
    }

    /// Adopt `set` as the remote's current introset and act on it
    pub(crate) fn apply_intro_set(&mut self, env: &mut SessionEnv<'_>, set: IntroSet, now: u64) {
        if set.address() != self.remote || self.is_failed() {
            return;
        }
        if let Some(current) = &self.current_intro_set {
            if current.created_at > set.created_at {
                debug!("Ignoring older introset for {}", self.remote);
                return;
            }
        }
        self.current_intro_set = Some(set);
        self.lookup_retries = 0;

        match self.state {
            OutboundState::AwaitingIntroSet => self.select_and_build(env, now),
            OutboundState::Established if self.route_needs_refresh(now) => {
                if self.pending_path.is_none() {
                    self.select_and_build(env, now);
                }
            }
            _ => {}
        }
    }

    fn route_needs_refresh(&self, now: u64) -> bool {
        self.route.map_or(true, |(_, intro)| intro.is_expired(now))
    }

    /// Pick the next introduction to try
    ///
    /// Prefers untried introductions with the most life left, then falls
    /// back to whichever was tried longest ago.
    pub fn shift_introduction(&mut self, now: u64) -> bool {
        let Some(set) = &self.current_intro_set else {
            return false;
        };

        let live: Vec<_> = set.live_intros(now).copied().collect();
        let fresh = live
            .iter()
            .filter(|intro| !self.attempted.contains_key(*intro))
            .max_by(|a, b| {
                a.expires_at
                    .cmp(&b.expires_at)
                    .then(b.latency.cmp(&a.latency))
            });
        let next = fresh
            .or_else(|| {
                live.iter()
                    .min_by_key(|intro| self.attempted.get(*intro).copied().unwrap_or(0))
            })
            .copied();

        match next {
            Some(intro) => {
                self.attempted.insert(intro, now);
                self.selected_intro = Some(intro);
                true
            }
            None => false,
        }
    }

    fn select_and_build(&mut self, env: &mut SessionEnv<'_>, now: u64) {
        if !self.shift_introduction(now) {
            debug!("No live introductions for {}, refreshing", self.remote);
            if self.state != OutboundState::Established {
                self.state = OutboundState::AwaitingIntroSet;
            }
            self.next_lookup_at = now;
            self.update_intro_set(env, now);
            return;
        }
        self.build_path(env, now);
    }

    fn build_path(&mut self, env: &mut SessionEnv<'_>, now: u64) {
        let Some(intro) = self.selected_intro else {
            return;
        };
        let path_id = PathId::generate();
        let selector = Box::new(TerminalHop::new(intro.router));
        match env.paths.build_path(path_id, env.own_paths.hops(), selector) {
            Ok(()) => {
                debug!(
                    "Building {} to {} via {}",
                    path_id,
                    self.remote,
                    intro.router.short_hex()
                );
                self.pending_path = Some((path_id, now));
                if self.state != OutboundState::Established {
                    self.state = OutboundState::AwaitingPathBuild;
                }
            }
            Err(e) => {
                warn!("Path build to {} not started: {}", self.remote, e);
                self.build_failed(env, now);
            }
        }
    }

    fn build_failed(&mut self, env: &mut SessionEnv<'_>, now: u64) {
        self.pending_path = None;
        self.build_failures += 1;
        if self.build_failures >= service::MAX_PATH_BUILD_ATTEMPTS {
            if self.state == OutboundState::Established {
                // keep the old route, retry after the next introset refresh
                debug!("Route refresh to {} failed, keeping old route", self.remote);
                self.build_failures = 0;
                self.next_lookup_at = now + service::LOOKUP_RETRY_INTERVAL_MS;
            } else {
                self.fail("path build attempts exhausted");
            }
            return;
        }
        self.select_and_build(env, now);
    }

    /// Result of a build this context requested; false if `path_id` is not
    /// ours
    pub(crate) fn handle_path_built(
        &mut self,
        env: &mut SessionEnv<'_>,
        path_id: PathId,
        result: Result<BuiltPath, PathBuildError>,
        now: u64,
    ) -> bool {
        if self.pending_path.map(|(id, _)| id) != Some(path_id) {
            return false;
        }
        self.pending_path = None;

        let Some(intro) = self.selected_intro else {
            return true;
        };
        let built = match result {
            Ok(built) if built.terminal() == Some(&intro.router) => built,
            Ok(_) => {
                warn!("{} to {} ends at the wrong relay", path_id, self.remote);
                self.build_failed(env, now);
                return true;
            }
            Err(e) => {
                debug!("{} to {} failed: {}", path_id, self.remote, e);
                self.build_failed(env, now);
                return true;
            }
        };

        debug!(
            "{} to {} ready ({} hops, {}ms)",
            path_id,
            self.remote,
            built.hops.len(),
            built.latency
        );
        match self.state {
            OutboundState::AwaitingPathBuild => {
                self.handshake_path = Some(path_id);
                self.state = OutboundState::Handshaking;
                self.gen_intro(env, now);
            }
            OutboundState::Established => {
                self.build_failures = 0;
                self.route = Some((path_id, intro));
                if let Some(tag) = self.established {
                    env.sessions.put_intro_for(tag, intro, now);
                }
                info!("Route to {} moved to {}", self.remote, path_id);
            }
            _ => {}
        }
        true
    }

    fn gen_intro(&mut self, env: &mut SessionEnv<'_>, now: u64) {
        let Some(remote_info) = self.current_intro_set.as_ref().map(|set| set.service) else {
            return;
        };
        if self.intro_payload.is_none() {
            self.intro_payload = Some(self.queued.pop_front().unwrap_or(QueuedSend {
                protocol: ProtocolType::Control,
                payload: Vec::new(),
            }));
        }
        let Some(first) = self.intro_payload.clone() else {
            return;
        };

        let reply_intro = env.own_paths.best_intro(now);
        if reply_intro.is_none() {
            warn!("No inbound path yet, {} will not be able to reply", self.remote);
        }

        // every attempt gets a fresh sequence number so a retried handshake
        // is never mistaken for a replay
        let seqno = self.next_seqno();
        let job = CryptoJob::GenIntro {
            identity: env.identity.clone(),
            remote: remote_info,
            seqno,
            reply_intro,
            protocol: first.protocol,
            payload: first.payload,
        };
        self.handshake_started = now;
        self.gen_in_flight = true;
        env.worker.submit(job, env.completions.clone());
    }

    /// The worker finished sealing our handshake
    pub(crate) fn on_intro_generated(
        &mut self,
        env: &mut SessionEnv<'_>,
        result: Result<GeneratedIntro, crate::crypto::CryptoError>,
        now: u64,
    ) {
        if self.state != OutboundState::Handshaking || !self.gen_in_flight {
            return;
        }
        self.gen_in_flight = false;

        let generated = match result {
            Ok(generated) => generated,
            Err(e) => {
                self.fail(format!("handshake generation failed: {}", e));
                return;
            }
        };
        let (Some(path), Some(intro)) = (self.handshake_path, self.selected_intro) else {
            return;
        };

        self.candidate = Some((generated.tag, generated.key));
        if let Err(e) = env.paths.send_frame(path, &intro, generated.frame) {
            warn!("Handshake to {} not sent: {}", self.remote, e);
            self.handshake_failed(env, now);
        }
    }

    fn handshake_failed(&mut self, env: &mut SessionEnv<'_>, now: u64) {
        self.candidate = None;
        self.handshake_path = None;
        self.gen_in_flight = false;
        self.state = OutboundState::AwaitingPathBuild;
        self.build_failed(env, now);
    }

    /// The remote answered our handshake; commit the conversation
    pub(crate) fn on_handshake_reply(
        &mut self,
        env: &mut SessionEnv<'_>,
        msg: &ProtocolMessage,
        now: u64,
    ) -> bool {
        if self.state != OutboundState::Handshaking {
            return false;
        }
        let Some((tag, key)) = self.candidate.take() else {
            return false;
        };
        let Some(remote_info) = self.current_intro_set.as_ref().map(|set| set.service) else {
            return false;
        };
        if msg.tag != tag || msg.sender != remote_info {
            self.candidate = Some((tag, key));
            return false;
        }
        let (Some(path), Some(intro)) = (self.handshake_path.take(), self.selected_intro) else {
            return false;
        };

        env.sessions.put_sender_for(tag, remote_info, now);
        env.sessions.put_cached_session_key_for(tag, key, now);
        env.sessions.put_intro_for(tag, intro, now);
        env.sessions.set_seqno(&tag, self.sequence_no.saturating_sub(1));

        self.established = Some(tag);
        self.route = Some((path, intro));
        self.state = OutboundState::Established;
        self.build_failures = 0;
        self.intro_payload = None;
        self.last_activity = now;
        info!("Conversation with {} established", self.remote);
        true
    }

    /// Periodic maintenance; returns true when the context should be
    /// removed
    pub(crate) fn tick(&mut self, env: &mut SessionEnv<'_>, now: u64, idle_timeout: u64) -> bool {
        match self.state {
            OutboundState::Failed => return true,
            OutboundState::AwaitingIntroSet => {
                if self.update_tx.is_none() && now >= self.next_lookup_at {
                    self.update_intro_set(env, now);
                }
            }
            OutboundState::AwaitingPathBuild => {
                if let Some((_, started)) = self.pending_path {
                    if now.saturating_sub(started) > routing::PATH_BUILD_TIMEOUT_MS {
                        debug!("Path build to {} timed out", self.remote);
                        self.build_failed(env, now);
                    }
                }
            }
            OutboundState::Handshaking => {
                if now.saturating_sub(self.handshake_started) > service::HANDSHAKE_TIMEOUT_MS {
                    debug!("Handshake with {} timed out", self.remote);
                    self.handshake_failed(env, now);
                }
            }
            OutboundState::Established => {
                let Some(tag) = self.established else {
                    return true;
                };
                if !env.sessions.contains(&tag) {
                    debug!("Conversation with {} expired", self.remote);
                    return true;
                }
                if now.saturating_sub(self.last_activity) > idle_timeout {
                    debug!("Conversation with {} idle", self.remote);
                    return true;
                }

                if let Some((_, started)) = self.pending_path {
                    if now.saturating_sub(started) > routing::PATH_BUILD_TIMEOUT_MS {
                        self.build_failed(env, now);
                    }
                } else if self.route_needs_refresh(now)
                    && self.update_tx.is_none()
                    && now >= self.next_lookup_at
                {
                    debug!("Introduction for {} expired, refreshing", self.remote);
                    self.update_intro_set(env, now);
                }
            }
        }
        self.is_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::intro::tests::intro;

    fn context_with(intros: Vec<Introduction>) -> OutboundContext {
        let identity = Identity::generate();
        let set = IntroSet::signed(&identity, intros, None, 0);
        let mut ctx = OutboundContext::new(identity.address(), 0);
        ctx.current_intro_set = Some(set);
        ctx
    }

    #[test]
    fn test_shift_prefers_longest_lived_untried() {
        let mut ctx = context_with(vec![intro(1, 1_000), intro(2, 9_000), intro(3, 5_000)]);

        assert!(ctx.shift_introduction(0));
        assert_eq!(ctx.selected_intro().unwrap().router, intro(2, 0).router);
        assert!(ctx.shift_introduction(1));
        assert_eq!(ctx.selected_intro().unwrap().router, intro(3, 0).router);
        assert!(ctx.shift_introduction(2));
        assert_eq!(ctx.selected_intro().unwrap().router, intro(1, 0).router);

        // all tried: oldest attempt comes round again
        assert!(ctx.shift_introduction(3));
        assert_eq!(ctx.selected_intro().unwrap().router, intro(2, 0).router);
    }

    #[test]
    fn test_shift_skips_expired() {
        let mut ctx = context_with(vec![intro(1, 1_000), intro(2, 500)]);
        assert!(ctx.shift_introduction(600));
        assert_eq!(ctx.selected_intro().unwrap().router, intro(1, 0).router);
        assert!(!ctx.shift_introduction(1_000));
    }

    #[test]
    fn test_lookup_backoff_is_capped() {
        assert_eq!(
            OutboundContext::lookup_backoff(1),
            service::LOOKUP_BACKOFF_BASE_MS
        );
        assert_eq!(
            OutboundContext::lookup_backoff(2),
            service::LOOKUP_BACKOFF_BASE_MS * 2
        );
        assert_eq!(
            OutboundContext::lookup_backoff(30),
            service::LOOKUP_RETRY_INTERVAL_MS
        );
    }

    #[test]
    fn test_sequence_numbers() {
        let mut ctx = context_with(vec![intro(1, 1_000)]);
        assert_eq!(ctx.next_seqno(), 0);
        assert_eq!(ctx.next_seqno(), 1);
        assert_eq!(ctx.state(), OutboundState::AwaitingIntroSet);
        assert!(ctx.session().is_none());
    }
}

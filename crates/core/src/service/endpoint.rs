/// Hidden service endpoint
///
/// An `Endpoint` is a service identity plus everything needed to talk to
/// other services over the overlay: its own inbound paths and published
/// introset, outbound contexts towards remotes, the session cache, pending
/// DHT lookups and the tag prefetch cache.
///
/// All state lives on one logical context. Every entry point takes the
/// current time explicitly and finishes by draining crypto completions, so
/// with an inline worker a call runs to quiescence before returning.

use crate::crypto::{CompletionSender, CryptoCompletion, CryptoError, CryptoJob, CryptoWorker};
use crate::crypto::{AcceptedIntro, SharedKey};
use crate::dht::{DhtClient, GotIntroMessage, GotRouterMessage, RouterContact, TxId};
use crate::identity::{Identity, IdentityError, RouterId};
use crate::path::{PathBuilt, PathSet, PathTransport, RandomHops};
use crate::service::handler::{DataHandler, NetworkIsolation};
use crate::service::lookup::{LookupKind, PendingLookups};
use crate::service::outbound::{OutboundContext, OutboundSession, SessionEnv};
use crate::service::publish::PublishState;
use crate::service::sendq::{QueuedSend, SendQueues};
use crate::service::session_cache::SessionCache;
use crate::service::tag_cache::TagCache;
use crate::service::{
    ConvoTag, IntroSet, Introduction, ProtocolFrame, ProtocolMessage, ProtocolType,
    ServiceAddress, ServiceInfo,
};
use hsnet_common::{service, ConfigError, EndpointConfig, InboundPolicy, Tag};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Network namespace {0} requested but no isolation support available")]
    IsolationUnavailable(String),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EnsureError {
    #[error("Endpoint not started")]
    NotStarted,

    #[error("Path to {0} already pending")]
    AlreadyPending(ServiceAddress),

    #[error("Cannot open a path to ourselves")]
    OwnAddress,
}

/// Resolves once with the outcome of `ensure_path_to_service`
///
/// `Some` carries the established conversation, `None` means it failed or
/// timed out.
#[derive(Debug)]
pub struct PathEnsureHandle {
    rx: oneshot::Receiver<Option<OutboundSession>>,
}

impl PathEnsureHandle {
    pub async fn wait(self) -> Option<OutboundSession> {
        self.rx.await.ok().flatten()
    }

    /// `None` while unresolved
    pub fn try_result(&mut self) -> Option<Option<OutboundSession>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(None),
        }
    }
}

#[derive(Debug)]
struct PendingEnsure {
    sender: oneshot::Sender<Option<OutboundSession>>,
    deadline: u64,
}

impl PendingEnsure {
    fn resolve(self, outcome: Option<OutboundSession>) {
        let _ = self.sender.send(outcome);
    }
}

/// Endpoint statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub outbound_contexts: usize,
    pub sessions: usize,
    pub pending_lookups: usize,
    pub inbound_paths_ready: usize,
    pub inbound_paths_building: usize,
    pub cached_tags: usize,
    pub known_routers: usize,
    pub queued_sends: usize,

    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub replays_dropped: u64,
    pub messages_delivered: u64,
    pub sessions_established: u64,
    pub sessions_accepted: u64,
    pub inbound_rejected: u64,
    pub intro_sets_published: u64,
    pub lookups_timed_out: u64,
    pub contexts_failed: u64,
    pub ensures_timed_out: u64,
}

pub struct Endpoint {
    config: EndpointConfig,
    identity: Option<Arc<Identity>>,
    started: bool,

    dht: Box<dyn DhtClient>,
    paths: Box<dyn PathTransport>,
    handler: Box<dyn DataHandler>,
    isolation: Option<Box<dyn NetworkIsolation>>,
    isolation_pending: bool,
    worker: Arc<dyn CryptoWorker>,
    completions_tx: CompletionSender,
    completions_rx: mpsc::UnboundedReceiver<CryptoCompletion>,

    own_paths: PathSet,
    intro_set: Option<IntroSet>,
    publish: PublishState,

    sessions: SessionCache,
    send_queues: SendQueues,
    lookups: PendingLookups,
    contexts: HashMap<ServiceAddress, OutboundContext>,
    pending_ensures: HashMap<ServiceAddress, PendingEnsure>,

    tag_cache: TagCache,
    prefetch_tags: HashSet<Tag>,
    prefetch_addrs: Vec<ServiceAddress>,
    remote_intro_sets: HashMap<ServiceAddress, IntroSet>,
    known_routers: HashMap<RouterId, RouterContact>,
    pending_routers: HashSet<RouterId>,
    inbound_allow: HashSet<ServiceAddress>,

    counters: EndpointStats,
}

impl Endpoint {
    pub fn new(
        config: EndpointConfig,
        dht: Box<dyn DhtClient>,
        paths: Box<dyn PathTransport>,
        handler: Box<dyn DataHandler>,
        worker: Arc<dyn CryptoWorker>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let own_paths = PathSet::new(config.paths, config.hops);
        Self {
            config,
            identity: None,
            started: false,
            dht,
            paths,
            handler,
            isolation: None,
            isolation_pending: false,
            worker,
            completions_tx,
            completions_rx,
            own_paths,
            intro_set: None,
            publish: PublishState::new(),
            sessions: SessionCache::new(),
            send_queues: SendQueues::new(),
            lookups: PendingLookups::new(),
            contexts: HashMap::new(),
            pending_ensures: HashMap::new(),
            tag_cache: TagCache::new(),
            prefetch_tags: HashSet::new(),
            prefetch_addrs: Vec::new(),
            remote_intro_sets: HashMap::new(),
            known_routers: HashMap::new(),
            pending_routers: HashSet::new(),
            inbound_allow: HashSet::new(),
            counters: EndpointStats::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: Box<dyn NetworkIsolation>) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Use `identity` instead of loading or generating one at start
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_deref()
    }

    pub fn address(&self) -> Option<ServiceAddress> {
        self.identity.as_ref().map(|id| id.address())
    }

    /// Our most recently published introset
    pub fn intro_set(&self) -> Option<&IntroSet> {
        self.intro_set.as_ref()
    }

    pub fn known_router(&self, router: &RouterId) -> Option<&RouterContact> {
        self.known_routers.get(router)
    }

    pub fn cached_intro_set(&self, remote: &ServiceAddress) -> Option<&IntroSet> {
        self.remote_intro_sets.get(remote)
    }

    pub fn tag_cache(&self) -> &TagCache {
        &self.tag_cache
    }

    pub fn outbound_context(&self, remote: &ServiceAddress) -> Option<&OutboundContext> {
        self.contexts.get(remote)
    }

    pub fn start(&mut self, now: u64) -> Result<(), EndpointError> {
        if self.started {
            return Ok(());
        }

        let parse_addr = |key: &str, value: &String| {
            ServiceAddress::from_hostname(value).map_err(|_| ConfigError::invalid(key, value))
        };
        self.prefetch_addrs = self
            .config
            .prefetch_addrs
            .iter()
            .map(|a| parse_addr("prefetch-addr", a))
            .collect::<Result<_, _>>()?;
        self.inbound_allow = self
            .config
            .inbound_allow
            .iter()
            .map(|a| parse_addr("inbound-allow", a))
            .collect::<Result<_, _>>()?;
        self.prefetch_tags = self.config.prefetch_tags.iter().map(|t| Tag::new(t)).collect();

        if let Some(netns) = &self.config.netns {
            let Some(isolation) = self.isolation.as_mut() else {
                return Err(EndpointError::IsolationUnavailable(netns.clone()));
            };
            if let Err(e) = isolation.isolate(netns) {
                warn!("Isolation into {} failed, will retry: {}", netns, e);
                self.isolation_pending = true;
            }
        }

        if self.identity.is_none() {
            let identity = match &self.config.keyfile {
                Some(path) => Identity::load_or_create(path)?,
                None => Identity::generate(),
            };
            self.identity = Some(Arc::new(identity));
        }

        self.started = true;
        if let Some(address) = self.address() {
            info!("Endpoint {} started", address);
        }
        self.maintain_paths(now);
        self.process_completions(now);
        Ok(())
    }

    /// Periodic maintenance
    pub fn tick(&mut self, now: u64) {
        if !self.started {
            return;
        }

        self.retry_isolation();
        self.process_completions(now);
        self.expire_lookups(now);
        self.maintain_paths(now);
        if self.should_publish_descriptors(now) {
            self.publish_intro_set(now);
        }
        self.expire_sessions(now);
        self.expire_ensures(now);
        self.tick_contexts(now);
        self.tick_prefetch(now);
        self.process_completions(now);
    }

    fn retry_isolation(&mut self) {
        if !self.isolation_pending {
            return;
        }
        let (Some(netns), Some(isolation)) = (self.config.netns.as_deref(), self.isolation.as_mut())
        else {
            return;
        };
        match isolation.isolate(netns) {
            Ok(()) => {
                info!("Isolated into {}", netns);
                self.isolation_pending = false;
            }
            Err(e) => debug!("Isolation into {} still failing: {}", netns, e),
        }
    }

    /// Drain every crypto completion that is ready
    pub fn process_completions(&mut self, now: u64) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.handle_completion(completion, now);
        }
    }

    /// Wait for the next crypto completion, for callers driving the
    /// endpoint from an event loop
    pub async fn recv_completion(&mut self) -> Option<CryptoCompletion> {
        self.completions_rx.recv().await
    }

    pub fn handle_completion(&mut self, completion: CryptoCompletion, now: u64) {
        match completion {
            CryptoCompletion::IntroGenerated { remote, result } => {
                self.with_context(&remote, |ctx, env| ctx.on_intro_generated(env, result, now));
                self.settle_context(&remote);
            }
            CryptoCompletion::Encrypted { tag, result } => self.on_encrypted(tag, result, now),
            CryptoCompletion::Decrypted { tag, result } => self.on_decrypted(tag, result, now),
            CryptoCompletion::IntroAccepted { tag, result } => {
                self.on_intro_accepted(tag, result, now)
            }
        }
    }

    fn split(&mut self) -> Option<(&mut HashMap<ServiceAddress, OutboundContext>, SessionEnv<'_>)> {
        let identity = self.identity.as_ref()?;
        Some((
            &mut self.contexts,
            SessionEnv {
                identity,
                sessions: &mut self.sessions,
                lookups: &mut self.lookups,
                dht: &mut self.dht,
                paths: &mut self.paths,
                own_paths: &self.own_paths,
                worker: &self.worker,
                completions: &self.completions_tx,
            },
        ))
    }

    fn with_context<R>(
        &mut self,
        remote: &ServiceAddress,
        f: impl FnOnce(&mut OutboundContext, &mut SessionEnv<'_>) -> R,
    ) -> Option<R> {
        let (contexts, mut env) = self.split()?;
        let ctx = contexts.get_mut(remote)?;
        Some(f(ctx, &mut env))
    }

    /// Fire the pending ensure hook for `remote` if its context reached a
    /// terminal state, discarding failed contexts
    fn settle_context(&mut self, remote: &ServiceAddress) {
        let Some(ctx) = self.contexts.get(remote) else {
            return;
        };
        if ctx.is_established() {
            if let Some(pending) = self.pending_ensures.remove(remote) {
                pending.resolve(ctx.session());
            }
        } else if ctx.is_failed() {
            self.contexts.remove(remote);
            self.counters.contexts_failed += 1;
            if let Some(pending) = self.pending_ensures.remove(remote) {
                pending.resolve(None);
            }
        }
    }

    // Own paths and introset publishing

    fn maintain_paths(&mut self, now: u64) {
        self.own_paths.expire(now);
        for path_id in self.own_paths.plan_builds(now) {
            let selector = Box::new(RandomHops::new());
            if let Err(e) = self.paths.build_path(path_id, self.own_paths.hops(), selector) {
                warn!("Inbound path build not started: {}", e);
                self.own_paths.abandon(&path_id);
            }
        }
    }

    pub fn handle_path_built(&mut self, event: PathBuilt, now: u64) -> bool {
        if self.own_paths.handle_built(event.path_id, &event.result, now) {
            return true;
        }

        let Some(remote) = self
            .contexts
            .iter()
            .find(|(_, ctx)| ctx.pending_path() == Some(event.path_id))
            .map(|(remote, _)| *remote)
        else {
            debug!("Build result for unknown {}", event.path_id);
            return false;
        };

        let PathBuilt { path_id, result } = event;
        self.with_context(&remote, |ctx, env| ctx.handle_path_built(env, path_id, result, now));
        self.process_completions(now);
        self.settle_context(&remote);
        true
    }

    pub fn should_publish_descriptors(&self, now: u64) -> bool {
        self.started
            && self.publish.should_publish(now)
            && !self.own_paths.intros(now).is_empty()
    }

    /// Sign and publish a fresh introset built from our ready paths
    pub fn publish_intro_set(&mut self, now: u64) -> bool {
        let Some(identity) = self.identity.clone() else {
            return false;
        };
        if self.publish.current_tx().is_some() {
            return false;
        }
        let intros = self.own_paths.intros(now);
        if intros.is_empty() {
            debug!("No inbound paths ready, not publishing");
            return false;
        }

        let set = IntroSet::signed(&identity, intros, self.config.topic(), now);
        let txid = self.lookups.register(LookupKind::Publish, now);
        let via = self
            .own_paths
            .closest_to(&identity.address().dht_key(), now);
        self.publish.begin(txid, now);

        match self.dht.publish_intro_set(txid, via, &set) {
            Ok(()) => {
                debug!("Publishing introset with {} intros (tx {})", set.intros.len(), txid);
                self.intro_set = Some(set);
                true
            }
            Err(e) => {
                warn!("Introset publish not sent: {}", e);
                self.lookups.take(txid);
                self.publish.failed();
                self.handler.intro_set_publish_fail();
                false
            }
        }
    }

    fn on_publish_response(&mut self, txid: TxId, intro_sets: &[IntroSet], now: u64) {
        if self.publish.current_tx() != Some(txid) {
            return;
        }
        let confirmed = self
            .intro_set
            .as_ref()
            .map_or(false, |ours| intro_sets.iter().any(|set| set == ours));
        if confirmed {
            info!("Introset published");
            self.publish.published(now);
            self.counters.intro_sets_published += 1;
            self.handler.intro_set_published();
        } else {
            warn!("Introset publish not confirmed");
            self.publish.failed();
            self.handler.intro_set_publish_fail();
        }
    }

    // Lookups

    fn lookup_intro_set(&mut self, remote: ServiceAddress, now: u64) -> bool {
        let txid = self.lookups.register(LookupKind::IntroSet(remote), now);
        let via = self.own_paths.closest_to(&remote.dht_key(), now);
        match self.dht.find_intro_set(txid, via, &remote) {
            Ok(()) => true,
            Err(e) => {
                debug!("Introset lookup for {} not sent: {}", remote, e);
                self.lookups.take(txid);
                false
            }
        }
    }

    pub fn handle_got_intro_message(&mut self, msg: GotIntroMessage, now: u64) -> bool {
        let Some(pending) = self.lookups.get(msg.txid).copied() else {
            debug!("Introset response for unknown tx {}", msg.txid);
            return false;
        };
        if matches!(pending.kind, LookupKind::Router(_)) {
            debug!("Introset response for router lookup tx {}", msg.txid);
            return false;
        }
        self.lookups.take(msg.txid);

        match pending.kind {
            LookupKind::Publish => self.on_publish_response(msg.txid, &msg.intro_sets, now),
            LookupKind::IntroSet(remote) => {
                self.on_intro_set_response(msg.txid, remote, msg.intro_sets, now)
            }
            LookupKind::Tag(tag) => self.on_tag_response(msg.txid, tag, msg.intro_sets, now),
            LookupKind::Router(_) => {}
        }
        self.process_completions(now);
        true
    }

    fn cache_intro_set(&mut self, set: &IntroSet) {
        let newer = self
            .remote_intro_sets
            .get(&set.address())
            .map_or(true, |cached| cached.created_at <= set.created_at);
        if newer {
            self.remote_intro_sets.insert(set.address(), set.clone());
        }
    }

    fn on_intro_set_response(
        &mut self,
        txid: TxId,
        remote: ServiceAddress,
        intro_sets: Vec<IntroSet>,
        now: u64,
    ) {
        let best = intro_sets
            .into_iter()
            .filter(|set| set.address() == remote)
            .filter(|set| match set.validate(now) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Discarding introset for {}: {}", remote, e);
                    false
                }
            })
            .max_by_key(|set| set.created_at);

        if let Some(set) = &best {
            self.cache_intro_set(set);
        }
        if self.contexts.contains_key(&remote) {
            self.with_context(&remote, |ctx, env| ctx.on_intro_set_update(env, txid, best, now));
            self.learn_intro_routers(&remote, now);
            self.settle_context(&remote);
        }
    }

    fn tag_dht_key(tag: &Tag) -> RouterId {
        RouterId::from_bytes(*blake3::hash(tag.as_bytes()).as_bytes())
    }

    /// Issue a DHT lookup for services publishing under `tag`
    pub fn generate_lookup_by_tag(&mut self, tag: Tag, now: u64) -> Option<TxId> {
        let txid = self.lookups.register(LookupKind::Tag(tag), now);
        let via = self.own_paths.closest_to(&Self::tag_dht_key(&tag), now);
        match self.dht.find_intro_sets_by_tag(txid, via, &tag) {
            Ok(()) => Some(txid),
            Err(e) => {
                debug!("Tag lookup for {} not sent: {}", tag, e);
                self.lookups.take(txid);
                None
            }
        }
    }

    /// Keep the introsets published under `tag` cached
    ///
    /// Returns true if a lookup was issued.
    pub fn prefetch_services_by_tag(&mut self, tag: Tag, now: u64) -> bool {
        self.prefetch_tags.insert(tag);
        {
            let (entry, created) = self.tag_cache.entry(tag);
            if entry.pending_tx.is_some() || (!created && !entry.should_refresh(now)) {
                return false;
            }
        }

        let Some(txid) = self.generate_lookup_by_tag(tag, now) else {
            return false;
        };
        if let Some(entry) = self.tag_cache.get_mut(&tag) {
            entry.last_request = now;
            entry.pending_tx = Some(txid);
        }
        true
    }

    fn on_tag_response(&mut self, txid: TxId, tag: Tag, intro_sets: Vec<IntroSet>, now: u64) {
        let valid: Vec<_> = intro_sets
            .into_iter()
            .filter(|set| set.validate(now).is_ok())
            .collect();
        let Some(entry) = self.tag_cache.get_mut(&tag) else {
            return;
        };
        if entry.pending_tx == Some(txid) {
            entry.pending_tx = None;
        }
        if !entry.handle_response(valid, now) {
            debug!("Nothing fresh for tag {}", tag);
            return;
        }
        let fresh = entry.result.clone();
        debug!("Tag {} now has {} services", tag, fresh.len());
        for set in &fresh {
            self.cache_intro_set(set);
        }
    }

    /// Look up `router` unless we already know it or are looking
    pub fn ensure_router_is_known(&mut self, router: RouterId, now: u64) -> bool {
        if self.known_routers.contains_key(&router) || self.pending_routers.contains(&router) {
            return false;
        }
        let txid = self.lookups.register(LookupKind::Router(router), now);
        let via = self.own_paths.closest_to(&router, now);
        match self.dht.find_router(txid, via, &router) {
            Ok(()) => {
                self.pending_routers.insert(router);
                true
            }
            Err(e) => {
                debug!("Router lookup for {} not sent: {}", router.short_hex(), e);
                self.lookups.take(txid);
                false
            }
        }
    }

    fn learn_intro_routers(&mut self, remote: &ServiceAddress, now: u64) {
        let routers: Vec<RouterId> = self
            .contexts
            .get(remote)
            .and_then(|ctx| ctx.current_intro_set())
            .map(|set| set.intros.iter().map(|intro| intro.router).collect())
            .unwrap_or_default();
        for router in routers {
            self.ensure_router_is_known(router, now);
        }
    }

    pub fn handle_got_router_message(&mut self, msg: GotRouterMessage, _now: u64) -> bool {
        let Some(pending) = self.lookups.get(msg.txid).copied() else {
            debug!("Router response for unknown tx {}", msg.txid);
            return false;
        };
        let LookupKind::Router(router) = pending.kind else {
            debug!("Router response for non-router tx {}", msg.txid);
            return false;
        };
        self.lookups.take(msg.txid);
        self.pending_routers.remove(&router);

        for contact in msg.routers {
            if contact.is_consistent() {
                self.known_routers.insert(contact.router, contact);
            } else {
                debug!("Discarding inconsistent contact for {}", contact.router.short_hex());
            }
        }
        if !self.known_routers.contains_key(&router) {
            debug!("Router {} not found", router.short_hex());
        }
        true
    }

    fn expire_lookups(&mut self, now: u64) {
        for (txid, pending) in self.lookups.expire(now, service::LOOKUP_TIMEOUT_MS) {
            self.counters.lookups_timed_out += 1;
            match pending.kind {
                LookupKind::Publish => {
                    if self.publish.current_tx() == Some(txid) {
                        warn!("Introset publish timed out");
                        self.publish.failed();
                        self.handler.intro_set_publish_fail();
                    }
                }
                LookupKind::IntroSet(remote) => {
                    debug!("Introset lookup for {} timed out", remote);
                    self.with_context(&remote, |ctx, env| {
                        ctx.on_intro_set_update(env, txid, None, now)
                    });
                    self.settle_context(&remote);
                }
                LookupKind::Tag(tag) => {
                    if let Some(entry) = self.tag_cache.get_mut(&tag) {
                        if entry.pending_tx == Some(txid) {
                            entry.pending_tx = None;
                        }
                    }
                }
                LookupKind::Router(router) => {
                    self.pending_routers.remove(&router);
                }
            }
        }
    }

    // Outbound

    /// Start establishing a conversation with `remote`
    ///
    /// The returned handle resolves exactly once: with the session when
    /// established, or `None` on failure or after `timeout_ms`.
    pub fn ensure_path_to_service(
        &mut self,
        remote: ServiceAddress,
        timeout_ms: u64,
        now: u64,
    ) -> Result<PathEnsureHandle, EnsureError> {
        let Some(identity) = self.identity.as_ref().filter(|_| self.started) else {
            return Err(EnsureError::NotStarted);
        };
        if identity.address() == remote {
            return Err(EnsureError::OwnAddress);
        }
        if self.pending_ensures.contains_key(&remote) {
            return Err(EnsureError::AlreadyPending(remote));
        }

        let (sender, rx) = oneshot::channel();
        let pending = PendingEnsure {
            sender,
            deadline: now.saturating_add(timeout_ms),
        };

        if let Some(session) = self.contexts.get(&remote).and_then(|ctx| ctx.session()) {
            pending.resolve(Some(session));
            return Ok(PathEnsureHandle { rx });
        }
        self.pending_ensures.insert(remote, pending);

        if !self.contexts.contains_key(&remote) {
            debug!("New outbound context for {}", remote);
            self.contexts.insert(remote, OutboundContext::new(remote, now));
            let cached = self
                .remote_intro_sets
                .get(&remote)
                .filter(|set| !set.is_expired(now))
                .cloned();
            self.with_context(&remote, |ctx, env| match cached {
                Some(set) => ctx.apply_intro_set(env, set, now),
                None => ctx.update_intro_set(env, now),
            });
            self.learn_intro_routers(&remote, now);
        }

        self.process_completions(now);
        self.settle_context(&remote);
        Ok(PathEnsureHandle { rx })
    }

    fn expire_ensures(&mut self, now: u64) {
        let expired: Vec<_> = self
            .pending_ensures
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(remote, _)| *remote)
            .collect();
        for remote in expired {
            info!("Path to {} timed out", remote);
            self.counters.ensures_timed_out += 1;
            if let Some(pending) = self.pending_ensures.remove(&remote) {
                pending.resolve(None);
            }
            if self
                .contexts
                .get(&remote)
                .map_or(false, |ctx| !ctx.is_established())
            {
                self.contexts.remove(&remote);
            }
        }
    }

    fn tick_contexts(&mut self, now: u64) {
        let idle_timeout = self.config.session_timeout_ms;
        let remotes: Vec<_> = self.contexts.keys().copied().collect();
        for remote in remotes {
            let remove = self
                .with_context(&remote, |ctx, env| ctx.tick(env, now, idle_timeout))
                .unwrap_or(false);
            if !remove {
                self.settle_context(&remote);
                continue;
            }
            let Some(ctx) = self.contexts.remove(&remote) else {
                continue;
            };
            if ctx.is_failed() {
                self.counters.contexts_failed += 1;
            }
            if let Some(tag) = ctx.established_tag() {
                self.sessions.remove(&tag);
                self.send_queues.drop_convo(&tag);
            }
            if let Some(pending) = self.pending_ensures.remove(&remote) {
                pending.resolve(None);
            }
            debug!("Dropped outbound context for {}", remote);
        }
    }

    pub fn has_path_to_service(&self, remote: &ServiceAddress) -> bool {
        self.contexts
            .get(remote)
            .map_or(false, |ctx| ctx.is_established())
            || self.sessions.best_tag_for(remote).is_some()
    }

    pub fn has_pending_path_to_service(&self, remote: &ServiceAddress) -> bool {
        self.pending_ensures.contains_key(remote)
            || self
                .contexts
                .get(remote)
                .map_or(false, |ctx| !ctx.is_established() && !ctx.is_failed())
    }

    /// Drop everything we hold for `remote`; returns false if there was
    /// nothing
    pub fn forget_path_to_service(&mut self, remote: &ServiceAddress) -> bool {
        let mut forgot = self.contexts.remove(remote).is_some();
        if let Some(pending) = self.pending_ensures.remove(remote) {
            pending.resolve(None);
            forgot = true;
        }
        for tag in self.sessions.tags_for_address(remote) {
            self.sessions.remove(&tag);
            self.send_queues.drop_convo(&tag);
            forgot = true;
        }
        if forgot {
            info!("Forgot path to {}", remote);
        }
        forgot
    }

    /// Queue `payload` for `remote`
    ///
    /// Sent immediately on an established conversation, held by the
    /// outbound context while one is being set up. False if there is
    /// neither.
    pub fn send_to_service(
        &mut self,
        remote: &ServiceAddress,
        protocol: ProtocolType,
        payload: Vec<u8>,
        now: u64,
    ) -> bool {
        if !self.started {
            return false;
        }
        let send = QueuedSend { protocol, payload };
        let tag = match self.contexts.get_mut(remote) {
            Some(ctx) if ctx.is_established() => {
                ctx.mark_active(now);
                ctx.established_tag()
            }
            Some(ctx) if !ctx.is_failed() => {
                ctx.queue_send(send);
                return true;
            }
            Some(_) => return false,
            None => self.sessions.best_tag_for(remote),
        };
        let Some(tag) = tag else {
            return false;
        };

        self.send_queues.push(tag, send);
        self.pump(tag, now);
        self.process_completions(now);
        true
    }

    /// Hand the next queued message on `tag` to the crypto worker
    fn pump(&mut self, tag: ConvoTag, now: u64) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        let Some(key) = self.sessions.get_cached_session_key_for(&tag).cloned() else {
            let dropped = self.send_queues.drop_convo(&tag);
            debug!("No session for {}, dropped {} queued", tag, dropped);
            return;
        };
        let Some(send) = self.send_queues.next_ready(&tag) else {
            return;
        };
        let Some(seqno) = self.sessions.next_seqno(&tag) else {
            self.send_queues.complete(&tag);
            return;
        };

        let job = CryptoJob::Encrypt {
            identity,
            key,
            tag,
            seqno,
            reply_intro: self.own_paths.best_intro(now),
            protocol: send.protocol,
            payload: send.payload,
        };
        self.worker.submit(job, self.completions_tx.clone());
    }

    fn context_for_tag(&self, tag: &ConvoTag) -> Option<ServiceAddress> {
        self.contexts
            .iter()
            .find(|(_, ctx)| ctx.established_tag().as_ref() == Some(tag))
            .map(|(remote, _)| *remote)
    }

    fn route_for(&self, tag: &ConvoTag, now: u64) -> Option<(crate::path::PathId, Introduction)> {
        if let Some(remote) = self.context_for_tag(tag) {
            return self.contexts.get(&remote).and_then(|ctx| ctx.route());
        }
        let intro = self.sessions.get_intro_for(tag)?;
        let path = self.own_paths.closest_to(&intro.router, now)?;
        Some((path, *intro))
    }

    fn on_encrypted(&mut self, tag: ConvoTag, result: Result<ProtocolFrame, CryptoError>, now: u64) {
        self.send_queues.complete(&tag);
        match result {
            Ok(frame) => match self.route_for(&tag, now) {
                Some((path, intro)) => match self.paths.send_frame(path, &intro, frame) {
                    Ok(()) => {
                        self.counters.frames_sent += 1;
                        self.sessions.mark_used(&tag, now);
                    }
                    Err(e) => {
                        warn!("Frame on {} not sent: {}", tag, e);
                        self.counters.frames_dropped += 1;
                    }
                },
                None => {
                    debug!("No route for {}, dropping frame", tag);
                    self.counters.frames_dropped += 1;
                }
            },
            Err(e) => {
                warn!("Encrypting on {} failed: {}", tag, e);
                self.counters.frames_dropped += 1;
            }
        }
        self.pump(tag, now);
    }

    // Inbound

    /// Process a frame that arrived on one of our paths
    ///
    /// Returns false if the frame was dropped without further processing.
    pub fn handle_hidden_service_frame(&mut self, frame: ProtocolFrame, now: u64) -> bool {
        let Some(identity) = self.identity.clone() else {
            return false;
        };
        self.counters.frames_received += 1;

        let tag = frame.tag;
        let candidate_key = self.contexts.values().find_map(|ctx| {
            ctx.candidate()
                .filter(|(candidate, _)| **candidate == tag)
                .map(|(_, key)| key.clone())
        });

        let job = if let Some(key) = self.sessions.get_cached_session_key_for(&tag) {
            CryptoJob::Decrypt {
                key: key.clone(),
                frame,
            }
        } else if let Some(key) = candidate_key {
            CryptoJob::Decrypt { key, frame }
        } else if frame.is_handshake() {
            CryptoJob::AcceptIntro { identity, frame }
        } else {
            debug!("Frame for unknown {}", tag);
            self.counters.frames_dropped += 1;
            return false;
        };

        self.worker.submit(job, self.completions_tx.clone());
        self.process_completions(now);
        true
    }

    fn deliver(&mut self, msg: &ProtocolMessage) {
        if msg.protocol == ProtocolType::Control {
            return;
        }
        self.counters.messages_delivered += 1;
        self.handler.handle_data_message(msg);
    }

    fn on_decrypted(&mut self, tag: ConvoTag, result: Result<ProtocolMessage, CryptoError>, now: u64) {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Frame on {} rejected: {}", tag, e);
                self.counters.frames_dropped += 1;
                return;
            }
        };

        if self.sessions.get(&tag).map_or(false, |s| s.is_complete()) {
            if self.sessions.get_sender_for(&tag) != Some(&msg.sender) {
                warn!("Frame on {} from unexpected sender", tag);
                self.counters.frames_dropped += 1;
                return;
            }
            if !self.sessions.accept_seqno(&tag, msg.seqno) {
                debug!("Replayed frame {} on {}", msg.seqno, tag);
                self.counters.replays_dropped += 1;
                return;
            }
            self.sessions.mark_used(&tag, now);
            match self.context_for_tag(&tag) {
                Some(remote) => {
                    if let Some(ctx) = self.contexts.get_mut(&remote) {
                        ctx.mark_active(now);
                    }
                }
                None => {
                    if let Some(intro) = msg.reply_intro {
                        self.sessions.put_intro_for(tag, intro, now);
                    }
                }
            }
            self.deliver(&msg);
            return;
        }

        let Some(remote) = self
            .contexts
            .iter()
            .find(|(_, ctx)| ctx.candidate().map(|(t, _)| *t) == Some(tag))
            .map(|(remote, _)| *remote)
        else {
            debug!("Decrypted frame for unknown {}", tag);
            self.counters.frames_dropped += 1;
            return;
        };

        let committed = self
            .with_context(&remote, |ctx, env| ctx.on_handshake_reply(env, &msg, now))
            .unwrap_or(false);
        if !committed {
            debug!("Handshake reply from {} rejected", remote);
            self.counters.frames_dropped += 1;
            return;
        }
        self.sessions.accept_seqno(&tag, msg.seqno);
        self.counters.sessions_established += 1;
        self.deliver(&msg);

        let queued = self
            .contexts
            .get_mut(&remote)
            .map(|ctx| ctx.take_queued())
            .unwrap_or_default();
        for send in queued {
            self.send_queues.push(tag, send);
        }
        self.pump(tag, now);
        self.settle_context(&remote);
    }

    fn admit_inbound(&mut self, sender: &ServiceAddress, payload: &[u8]) -> bool {
        match self.config.inbound_policy {
            InboundPolicy::Accept => true,
            InboundPolicy::Reject => false,
            InboundPolicy::AllowList => self.inbound_allow.contains(sender),
            InboundPolicy::Handler => self.handler.handle_authenticated_data_from(sender, payload),
        }
    }

    fn on_intro_accepted(&mut self, tag: ConvoTag, result: Result<AcceptedIntro, CryptoError>, now: u64) {
        let AcceptedIntro { key, message } = match result {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("Handshake on {} rejected: {}", tag, e);
                self.counters.frames_dropped += 1;
                return;
            }
        };
        if self.sessions.contains(&tag) {
            debug!("Duplicate handshake on {}", tag);
            self.counters.frames_dropped += 1;
            return;
        }

        let sender = message.sender_address();
        if !self.admit_inbound(&sender, &message.payload) {
            info!("Rejected conversation from {}", sender);
            self.counters.inbound_rejected += 1;
            return;
        }

        self.sessions.put_sender_for(tag, message.sender, now);
        self.sessions.put_cached_session_key_for(tag, key, now);
        if let Some(intro) = message.reply_intro {
            self.sessions.put_intro_for(tag, intro, now);
        }
        self.sessions.accept_seqno(&tag, message.seqno);
        self.counters.sessions_accepted += 1;
        info!("Accepted conversation from {}", sender);
        self.deliver(&message);

        self.send_queues.push(
            tag,
            QueuedSend {
                protocol: ProtocolType::Control,
                payload: Vec::new(),
            },
        );
        self.pump(tag, now);
    }

    fn expire_sessions(&mut self, now: u64) {
        for tag in self.sessions.expire(now, self.config.session_timeout_ms) {
            self.send_queues.drop_convo(&tag);
            debug!("Session {} expired", tag);
        }
    }

    fn tick_prefetch(&mut self, now: u64) {
        let subscribed = self.prefetch_tags.clone();
        self.tag_cache.expire(now, &subscribed);
        for tag in subscribed {
            self.prefetch_services_by_tag(tag, now);
        }

        self.remote_intro_sets.retain(|_, set| !set.is_expired(now));
        for remote in self.prefetch_addrs.clone() {
            let fresh = self.remote_intro_sets.get(&remote).map_or(false, |set| {
                now.saturating_sub(set.created_at) < service::INTROSET_PUBLISH_INTERVAL_MS
            });
            if fresh
                || self.contexts.contains_key(&remote)
                || self.lookups.has_pending(&LookupKind::IntroSet(remote))
            {
                continue;
            }
            self.lookup_intro_set(remote, now);
        }
    }

    // Session cache accessors

    pub fn get_cached_session_key_for(&self, tag: &ConvoTag) -> Option<&SharedKey> {
        self.sessions.get_cached_session_key_for(tag)
    }

    pub fn put_cached_session_key_for(&mut self, tag: ConvoTag, key: SharedKey, now: u64) {
        self.sessions.put_cached_session_key_for(tag, key, now)
    }

    pub fn get_sender_for(&self, tag: &ConvoTag) -> Option<&ServiceInfo> {
        self.sessions.get_sender_for(tag)
    }

    pub fn put_sender_for(&mut self, tag: ConvoTag, info: ServiceInfo, now: u64) {
        self.sessions.put_sender_for(tag, info, now)
    }

    pub fn get_intro_for(&self, tag: &ConvoTag) -> Option<&Introduction> {
        self.sessions.get_intro_for(tag)
    }

    pub fn put_intro_for(&mut self, tag: ConvoTag, intro: Introduction, now: u64) {
        self.sessions.put_intro_for(tag, intro, now)
    }

    pub fn get_convo_tags_for_service(&self, info: &ServiceInfo) -> BTreeSet<ConvoTag> {
        self.sessions.get_convo_tags_for_service(info)
    }

    pub fn get_seqno_for_convo(&mut self, tag: &ConvoTag) -> Option<u64> {
        self.sessions.next_seqno(tag)
    }

    pub fn stats(&self) -> EndpointStats {
        let paths = self.own_paths.stats();
        EndpointStats {
            outbound_contexts: self.contexts.len(),
            sessions: self.sessions.len(),
            pending_lookups: self.lookups.len(),
            inbound_paths_ready: paths.ready,
            inbound_paths_building: paths.building,
            cached_tags: self.tag_cache.len(),
            known_routers: self.known_routers.len(),
            queued_sends: self.send_queues.total_pending(),
            ..self.counters
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::InlineWorker;
    use crate::dht::TxId;
    use crate::identity::RouterId;
    use crate::path::{HopSelection, PathId};
    use crate::service::LoggingHandler;
    use hsnet_common::{HsNetError, Result};

    struct NullDht;

    impl DhtClient for NullDht {
        fn find_intro_set(&mut self, _: TxId, _: Option<PathId>, _: &ServiceAddress) -> Result<()> {
            Ok(())
        }
        fn find_intro_sets_by_tag(&mut self, _: TxId, _: Option<PathId>, _: &Tag) -> Result<()> {
            Ok(())
        }
        fn find_router(&mut self, _: TxId, _: Option<PathId>, _: &RouterId) -> Result<()> {
            Ok(())
        }
        fn publish_intro_set(&mut self, _: TxId, _: Option<PathId>, _: &IntroSet) -> Result<()> {
            Ok(())
        }
    }

    struct NullPaths;

    impl PathTransport for NullPaths {
        fn build_path(&mut self, _: PathId, _: usize, _: Box<dyn HopSelection>) -> Result<()> {
            Ok(())
        }
        fn send_frame(&mut self, _: PathId, _: &Introduction, _: ProtocolFrame) -> Result<()> {
            Ok(())
        }
    }

    struct FailingIsolation;

    impl NetworkIsolation for FailingIsolation {
        fn isolate(&mut self, _netns: &str) -> Result<()> {
            Err(HsNetError::internal("no worker context"))
        }
    }

    fn endpoint(config: EndpointConfig) -> Endpoint {
        Endpoint::new(
            config,
            Box::new(NullDht),
            Box::new(NullPaths),
            Box::new(LoggingHandler::default()),
            Arc::new(InlineWorker),
        )
    }

    #[test]
    fn test_start_requests_inbound_paths() {
        let mut ep = endpoint(EndpointConfig::new().with_paths(3));
        assert!(!ep.should_publish_descriptors(0));
        ep.start(0).unwrap();
        assert!(ep.is_started());
        assert_eq!(ep.stats().inbound_paths_building, 3);
        // nothing ready to advertise yet
        assert!(!ep.should_publish_descriptors(0));
        assert!(!ep.publish_intro_set(0));
    }

    #[test]
    fn test_netns_without_isolation_fails_fast() {
        let mut config = EndpointConfig::new();
        config.set_option("netns", "hidden").unwrap();
        let mut ep = endpoint(config);
        assert!(matches!(
            ep.start(0),
            Err(EndpointError::IsolationUnavailable(_))
        ));
        assert!(!ep.is_started());
    }

    #[test]
    fn test_isolation_failure_is_not_fatal() {
        let mut config = EndpointConfig::new();
        config.set_option("netns", "hidden").unwrap();
        let mut ep = endpoint(config).with_isolation(Box::new(FailingIsolation));
        ep.start(0).unwrap();
        assert!(ep.is_started());
        ep.tick(1_000);
    }

    #[test]
    fn test_bad_prefetch_addr_rejected() {
        let mut config = EndpointConfig::new();
        config.set_option("prefetch-addr", "not-an-address").unwrap();
        let mut ep = endpoint(config);
        assert!(matches!(ep.start(0), Err(EndpointError::Config(_))));
    }

    #[test]
    fn test_ensure_requires_start() {
        let mut ep = endpoint(EndpointConfig::new());
        let remote = Identity::generate().address();
        assert_eq!(
            ep.ensure_path_to_service(remote, 1_000, 0).unwrap_err(),
            EnsureError::NotStarted
        );
    }

    #[test]
    fn test_ensure_to_self_rejected() {
        let identity = Identity::generate();
        let address = identity.address();
        let mut ep = endpoint(EndpointConfig::new()).with_identity(identity);
        ep.start(0).unwrap();
        assert_eq!(ep.address(), Some(address));
        assert_eq!(
            ep.ensure_path_to_service(address, 1_000, 0).unwrap_err(),
            EnsureError::OwnAddress
        );
    }

    #[test]
    fn test_unknown_frame_dropped() {
        let mut ep = endpoint(EndpointConfig::new());
        ep.start(0).unwrap();
        let frame = ProtocolFrame {
            tag: ConvoTag::generate(),
            seqno: 0,
            nonce: [0; 12],
            ephemeral: None,
            ciphertext: vec![1, 2, 3],
            signature: crate::service::Signature([0; 64]),
        };
        assert!(!ep.handle_hidden_service_frame(frame, 0));
        assert_eq!(ep.stats().frames_dropped, 1);
    }

    #[test]
    fn test_forget_unknown_service() {
        let mut ep = endpoint(EndpointConfig::new());
        ep.start(0).unwrap();
        assert!(!ep.forget_path_to_service(&Identity::generate().address()));
    }
}

/// In-process stand-in for the DHT and path substrate
///
/// Every endpoint attached to a `LoopbackNet` sees the same introset store
/// and the same set of relays. Requests are answered by posting an
/// `Event` to the requesting endpoint's channel, so responses always arrive
/// on a later turn of its event loop.

use hsnet_common::{HsNetError, Result, Tag};
use hsnet_core::{
    BuiltPath, DhtClient, GotIntroMessage, GotRouterMessage, HopSelection, IntroSet,
    Introduction, KeyPair, PathBuilt, PathId, PathTransport, ProtocolFrame, RouterContact,
    RouterId, ServiceAddress, TxId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Something the substrate hands back to an endpoint
#[derive(Debug)]
pub enum Event {
    GotIntro(GotIntroMessage),
    GotRouter(GotRouterMessage),
    PathBuilt(PathBuilt),
    Frame(ProtocolFrame),
}

pub type EventSender = mpsc::UnboundedSender<Event>;

#[derive(Default)]
struct NetState {
    relays: Vec<RouterContact>,
    intro_sets: HashMap<ServiceAddress, IntroSet>,
    /// Owner of each built path, by path id
    path_owners: HashMap<PathId, EventSender>,
}

#[derive(Clone, Default)]
pub struct LoopbackNet {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNet {
    pub fn new(relays: usize) -> Self {
        let relays = (0..relays)
            .map(|i| {
                let key = KeyPair::generate().public_key();
                RouterContact::new(key, vec![format!("127.0.0.1:{}", 10_000 + i)], 0)
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(NetState {
                relays,
                ..NetState::default()
            })),
        }
    }

    /// Substrate handles for one endpoint whose events go to `events`
    pub fn attach(&self, events: EventSender) -> (LoopbackDht, LoopbackPaths) {
        (
            LoopbackDht {
                net: self.clone(),
                events: events.clone(),
            },
            LoopbackPaths {
                net: self.clone(),
                events,
            },
        )
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut NetState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| HsNetError::internal("loopback state poisoned"))?;
        Ok(f(&mut state))
    }
}

fn post(events: &EventSender, event: Event) -> Result<()> {
    events
        .send(event)
        .map_err(|_| HsNetError::network("endpoint event loop gone"))
}

pub struct LoopbackDht {
    net: LoopbackNet,
    events: EventSender,
}

impl DhtClient for LoopbackDht {
    fn find_intro_set(&mut self, txid: TxId, _via: Option<PathId>, address: &ServiceAddress) -> Result<()> {
        let intro_sets = self
            .net
            .with_state(|s| s.intro_sets.get(address).cloned().into_iter().collect())?;
        post(&self.events, Event::GotIntro(GotIntroMessage { txid, intro_sets }))
    }

    fn find_intro_sets_by_tag(&mut self, txid: TxId, _via: Option<PathId>, tag: &Tag) -> Result<()> {
        let intro_sets = self.net.with_state(|s| {
            s.intro_sets
                .values()
                .filter(|set| set.topic.as_ref() == Some(tag))
                .cloned()
                .collect()
        })?;
        post(&self.events, Event::GotIntro(GotIntroMessage { txid, intro_sets }))
    }

    fn find_router(&mut self, txid: TxId, _via: Option<PathId>, router: &RouterId) -> Result<()> {
        let routers = self.net.with_state(|s| {
            s.relays
                .iter()
                .filter(|contact| &contact.router == router)
                .cloned()
                .collect()
        })?;
        post(&self.events, Event::GotRouter(GotRouterMessage { txid, routers }))
    }

    fn publish_intro_set(&mut self, txid: TxId, _via: Option<PathId>, intro_set: &IntroSet) -> Result<()> {
        self.net.with_state(|s| {
            s.intro_sets.insert(intro_set.address(), intro_set.clone());
        })?;
        debug!("Stored introset for {}", intro_set.address());
        let intro_sets = vec![intro_set.clone()];
        post(&self.events, Event::GotIntro(GotIntroMessage { txid, intro_sets }))
    }
}

pub struct LoopbackPaths {
    net: LoopbackNet,
    events: EventSender,
}

impl PathTransport for LoopbackPaths {
    fn build_path(&mut self, path_id: PathId, hops: usize, selector: Box<dyn HopSelection>) -> Result<()> {
        let candidates: Vec<RouterId> = self
            .net
            .with_state(|s| s.relays.iter().map(|contact| contact.router).collect())?;

        let mut chosen: Vec<RouterId> = Vec::with_capacity(hops);
        for hop in 0..hops {
            match selector.select_hop(&candidates, chosen.last(), hop, hops) {
                Some(router) => chosen.push(router),
                None => {
                    let failed = PathBuilt {
                        path_id,
                        result: Err(hsnet_core::PathBuildError::NoRouter(hop)),
                    };
                    return post(&self.events, Event::PathBuilt(failed));
                }
            }
        }

        let events = self.events.clone();
        self.net.with_state(|s| {
            s.path_owners.insert(path_id, events);
        })?;
        let built = PathBuilt {
            path_id,
            result: Ok(BuiltPath {
                latency: 10 * chosen.len() as u64,
                hops: chosen,
            }),
        };
        post(&self.events, Event::PathBuilt(built))
    }

    fn send_frame(&mut self, _path: PathId, to: &Introduction, frame: ProtocolFrame) -> Result<()> {
        let owner = self
            .net
            .with_state(|s| s.path_owners.get(&to.path_id).cloned())?
            .ok_or_else(|| HsNetError::network(format!("no path {} at the far end", to.path_id)))?;
        post(&owner, Event::Frame(frame))
    }
}

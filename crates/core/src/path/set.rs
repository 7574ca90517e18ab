use super::{BuiltPath, PathBuildError, PathId};
use crate::identity::RouterId;
use crate::service::Introduction;
use hsnet_common::{routing, service};
use std::collections::HashMap;
use tracing::{debug, info};

/// One of the endpoint's own inbound paths
#[derive(Debug, Clone)]
pub enum OwnPath {
    Building { started_at: u64 },
    Ready { intro: Introduction },
}

/// Inbound paths owned by an endpoint
///
/// Each ready path yields one introduction, valid until the path expires.
/// Paths are replaced before they expire so the published set never goes
/// empty while the endpoint is healthy.
#[derive(Debug)]
pub struct PathSet {
    paths: HashMap<PathId, OwnPath>,
    target: usize,
    hops: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PathSetStats {
    pub building: usize,
    pub ready: usize,
}

impl PathSet {
    pub fn new(target: usize, hops: usize) -> Self {
        Self {
            paths: HashMap::new(),
            target: target.clamp(1, routing::MAX_PATHS),
            hops: hops.clamp(routing::MIN_HOPS, routing::MAX_HOPS),
        }
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    pub fn contains(&self, path_id: &PathId) -> bool {
        self.paths.contains_key(path_id)
    }

    /// Paths that still have enough life left to be worth advertising
    fn healthy(&self, now: u64) -> usize {
        self.paths
            .values()
            .filter(|p| match p {
                OwnPath::Building { .. } => true,
                OwnPath::Ready { intro } => {
                    intro.expires_at.saturating_sub(now) > service::INTROSET_PUBLISH_INTERVAL_MS
                }
            })
            .count()
    }

    /// Reserve ids for the builds needed to get back to the target
    pub fn plan_builds(&mut self, now: u64) -> Vec<PathId> {
        let missing = self.target.saturating_sub(self.healthy(now));
        let ids: Vec<_> = (0..missing).map(|_| PathId::generate()).collect();
        for id in &ids {
            self.paths.insert(*id, OwnPath::Building { started_at: now });
        }
        ids
    }

    /// Forget a build the substrate refused to start
    pub fn abandon(&mut self, path_id: &PathId) {
        self.paths.remove(path_id);
    }

    /// Record a build result; returns false if the path is not ours
    pub fn handle_built(
        &mut self,
        path_id: PathId,
        result: &Result<BuiltPath, PathBuildError>,
        now: u64,
    ) -> bool {
        if !matches!(self.paths.get(&path_id), Some(OwnPath::Building { .. })) {
            return false;
        }

        match result {
            Ok(built) => match built.terminal() {
                Some(router) => {
                    let intro = Introduction {
                        router: *router,
                        path_id,
                        expires_at: now + routing::PATH_LIFETIME_MS,
                        latency: built.latency,
                    };
                    info!("Inbound {} ready via {}", path_id, router.short_hex());
                    self.paths.insert(path_id, OwnPath::Ready { intro });
                }
                None => {
                    debug!("Inbound {} built with no hops, dropping", path_id);
                    self.paths.remove(&path_id);
                }
            },
            Err(e) => {
                debug!("Inbound {} failed: {}", path_id, e);
                self.paths.remove(&path_id);
            }
        }
        true
    }

    /// Drop expired paths and builds that never completed
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.paths.len();
        self.paths.retain(|_, p| match p {
            OwnPath::Building { started_at } => {
                now.saturating_sub(*started_at) <= routing::PATH_BUILD_TIMEOUT_MS
            }
            OwnPath::Ready { intro } => !intro.is_expired(now),
        });
        before - self.paths.len()
    }

    fn ready(&self, now: u64) -> impl Iterator<Item = &Introduction> {
        self.paths.values().filter_map(move |p| match p {
            OwnPath::Ready { intro } if !intro.is_expired(now) => Some(intro),
            _ => None,
        })
    }

    /// Introductions to advertise, longest lived first
    pub fn intros(&self, now: u64) -> Vec<Introduction> {
        let mut intros: Vec<_> = self.ready(now).copied().collect();
        intros.sort_by(|a, b| {
            b.expires_at
                .cmp(&a.expires_at)
                .then(a.latency.cmp(&b.latency))
        });
        intros.truncate(service::MAX_INTROS);
        intros
    }

    /// Introduction to hand out as a reply address
    pub fn best_intro(&self, now: u64) -> Option<Introduction> {
        self.intros(now).into_iter().next()
    }

    /// Ready path whose terminal relay is XOR-closest to `key`
    pub fn closest_to(&self, key: &RouterId, now: u64) -> Option<PathId> {
        self.ready(now)
            .min_by_key(|intro| intro.router.distance(key))
            .map(|intro| intro.path_id)
    }

    pub fn stats(&self) -> PathSetStats {
        let mut stats = PathSetStats::default();
        for p in self.paths.values() {
            match p {
                OwnPath::Building { .. } => stats.building += 1,
                OwnPath::Ready { .. } => stats.ready += 1,
            }
        }
        stats
    }
}

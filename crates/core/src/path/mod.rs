/// Paths through the relay network
///
/// Building and carrying frames over paths is the substrate's job; this
/// module only describes the requests the endpoint makes and the results it
/// gets back.

mod selection;
mod set;

pub use selection::{HopSelection, RandomHops, TerminalHop};
pub use set::{OwnPath, PathSet, PathSetStats};

use crate::identity::RouterId;
use crate::service::{Introduction, ProtocolFrame};
use serde::{Deserialize, Serialize};

/// Unique identifier for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId(pub u64);

impl PathId {
    pub fn generate() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Path({:016x})", self.0)
    }
}

/// A path the substrate finished building
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPath {
    pub hops: Vec<RouterId>,
    /// Round trip measured during the build, in milliseconds
    pub latency: u64,
}

impl BuiltPath {
    pub fn terminal(&self) -> Option<&RouterId> {
        self.hops.last()
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PathBuildError {
    #[error("Path build timed out")]
    Timeout,

    #[error("No suitable router for hop {0}")]
    NoRouter(usize),

    #[error("Path build rejected: {0}")]
    Rejected(String),
}

/// Outcome of a build request, reported back to the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBuilt {
    pub path_id: PathId,
    pub result: Result<BuiltPath, PathBuildError>,
}

/// Operations the endpoint needs from the path layer
pub trait PathTransport: Send {
    /// Request a path of `hops` hops, chosen through `selector`
    ///
    /// The result arrives later as a `PathBuilt`.
    fn build_path(
        &mut self,
        path_id: PathId,
        hops: usize,
        selector: Box<dyn HopSelection>,
    ) -> hsnet_common::Result<()>;

    /// Send `frame` out over `path` towards the remote introduction
    fn send_frame(
        &mut self,
        path: PathId,
        to: &Introduction,
        frame: ProtocolFrame,
    ) -> hsnet_common::Result<()>;
}

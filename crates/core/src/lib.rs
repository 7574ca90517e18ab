pub mod crypto;
pub mod dht;
pub mod identity;
pub mod path;
pub mod service;

pub use identity::{
    Distance, ExportableIdentity, Identity, IdentityError, KeyPair, KeyPairError, PublicKey,
    RouterId, RouterIdError,
};

pub use crypto::{
    CryptoCompletion, CryptoError, CryptoJob, CryptoWorker, InlineWorker, SharedKey, WorkerPool,
};

pub use dht::{DhtClient, GotIntroMessage, GotRouterMessage, RouterContact, TxId};

pub use path::{
    BuiltPath, HopSelection, PathBuildError, PathBuilt, PathId, PathSet, PathTransport,
    RandomHops, TerminalHop,
};

pub use service::{
    ConvoTag, DataHandler, Endpoint, EndpointError, EndpointStats, EnsureError, IntroSet,
    Introduction, LoggingHandler, NetworkIsolation, OutboundSession, PathEnsureHandle,
    ProtocolFrame, ProtocolMessage, ProtocolType, ServiceAddress, ServiceInfo,
};

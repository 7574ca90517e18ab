/// Hidden service layer
///
/// Service identities and addresses, signed introduction sets, the session
/// cache and the endpoint that ties lookups, paths and handshakes together.

pub mod address;
pub mod endpoint;
pub mod handler;
pub mod intro;
pub mod lookup;
pub mod outbound;
pub mod protocol;
pub mod publish;
pub mod sendq;
pub mod session_cache;
pub mod tag_cache;

pub use address::{ServiceAddress, ServiceAddressError, ServiceInfo};
pub use endpoint::{Endpoint, EndpointError, EndpointStats, EnsureError, PathEnsureHandle};
pub use handler::{DataHandler, LoggingHandler, NetworkIsolation};
pub use intro::{IntroSet, IntroSetError, Introduction, Signature};
pub use lookup::{LookupKind, PendingLookup, PendingLookups};
pub use outbound::{OutboundContext, OutboundSession, OutboundState};
pub use protocol::{ConvoTag, ProtocolFrame, ProtocolMessage, ProtocolType};
pub use publish::PublishState;
pub use sendq::{QueuedSend, SendQueues};
pub use session_cache::{ReplayWindow, Session, SessionCache};
pub use tag_cache::{CachedTagResult, TagCache};

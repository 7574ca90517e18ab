mod identity;
mod keypair;
mod router_id;

pub use identity::{ExportableIdentity, Identity, IdentityError};
pub use keypair::{KeyPair, KeyPairError, PublicKey};
pub use router_id::{Distance, RouterId, RouterIdError};

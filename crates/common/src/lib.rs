pub mod config;
pub mod error;
pub mod types;

pub use config::{
    routing, service, ConfigError, EndpointConfig, InboundPolicy,
};
pub use error::{HsNetError, Result};
pub use types::{time_now_ms, Tag, TAG_LEN};

use crate::types::Tag;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Path substrate constants
pub mod routing {
    /// Lifetime of a built path before it must be replaced
    pub const PATH_LIFETIME_MS: u64 = 10 * 60 * 1000;

    /// Default number of hops in a path
    pub const DEFAULT_HOPS: usize = 3;

    /// Minimum number of hops (the terminal hop alone)
    pub const MIN_HOPS: usize = 1;

    /// Maximum number of hops
    pub const MAX_HOPS: usize = 8;

    /// Default number of inbound paths an endpoint keeps for its introductions
    pub const DEFAULT_PATHS: usize = 4;

    /// Maximum number of inbound paths an endpoint may keep
    pub const MAX_PATHS: usize = 16;

    /// A path build with no result after this long is treated as failed
    pub const PATH_BUILD_TIMEOUT_MS: u64 = 2_000;
}

/// Hidden service session constants
pub mod service {
    use super::routing;

    /// Minimum interval for publishing introduction sets
    pub const INTROSET_PUBLISH_INTERVAL_MS: u64 = routing::PATH_LIFETIME_MS / 4;

    /// Delay before retrying a failed introduction set publish
    pub const INTROSET_PUBLISH_RETRY_INTERVAL_MS: u64 = 5_000;

    /// Maximum number of introductions carried in one introduction set
    pub const MAX_INTROS: usize = 10;

    /// Freshness window of a cached tag lookup
    pub const TAG_CACHE_TTL_MS: u64 = 10_000;

    /// Sessions without traffic for this long are pruned
    pub const SESSION_IDLE_TIMEOUT_MS: u64 = 60_000;

    /// A DHT transaction with no response after this long is abandoned
    pub const LOOKUP_TIMEOUT_MS: u64 = 2_000;

    /// First delay of the introduction set lookup backoff
    pub const LOOKUP_BACKOFF_BASE_MS: u64 = 250;

    /// Upper bound of the introduction set lookup backoff
    pub const LOOKUP_RETRY_INTERVAL_MS: u64 = 1_000;

    /// Introduction set lookups retried before a context gives up
    pub const MAX_INTROSET_LOOKUP_RETRIES: u32 = 3;

    /// Failed path builds or handshakes tolerated before a context gives up
    pub const MAX_PATH_BUILD_ATTEMPTS: u32 = 3;

    /// A handshake with no reply after this long counts as a failed attempt
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 2_000;

    /// Default deadline for `ensure_path_to_service`
    pub const DEFAULT_ENSURE_TIMEOUT_MS: u64 = 5_000;

    /// Number of received sequence numbers tracked for replay filtering
    pub const REPLAY_WINDOW: u64 = 64;
}

/// Policy for sessions opened by a remote service we never contacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundPolicy {
    /// Ask the data handler via `handle_authenticated_data_from`
    Handler,
    Accept,
    Reject,
    /// Accept only services listed in `inbound_allow`
    AllowList,
}

impl Default for InboundPolicy {
    fn default() -> Self {
        Self::Handler
    }
}

/// Endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Identity keyfile; a fresh identity is generated and saved if missing
    pub keyfile: Option<PathBuf>,

    /// Network namespace to isolate the endpoint into
    pub netns: Option<String>,

    /// Topic tag published with our introduction set
    pub tag: Option<String>,

    /// Tags whose services are prefetched
    pub prefetch_tags: Vec<String>,

    /// Service hostnames whose introduction sets are prefetched
    pub prefetch_addrs: Vec<String>,

    /// Number of inbound paths kept for introductions
    pub paths: usize,

    /// Hops per path
    pub hops: usize,

    pub inbound_policy: InboundPolicy,

    /// Service hostnames accepted under `InboundPolicy::AllowList`
    pub inbound_allow: Vec<String>,

    /// Session inactivity threshold
    pub session_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            keyfile: None,
            netns: None,
            tag: None,
            prefetch_tags: Vec::new(),
            prefetch_addrs: Vec::new(),
            paths: routing::DEFAULT_PATHS,
            hops: routing::DEFAULT_HOPS,
            inbound_policy: InboundPolicy::default(),
            inbound_allow: Vec::new(),
            session_timeout_ms: service::SESSION_IDLE_TIMEOUT_MS,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.keyfile = Some(path.into());
        self
    }

    pub fn with_paths(mut self, paths: usize) -> Self {
        self.paths = paths.min(routing::MAX_PATHS);
        self
    }

    pub fn with_inbound_policy(mut self, policy: InboundPolicy) -> Self {
        self.inbound_policy = policy;
        self
    }

    /// Apply a single `key=value` option
    ///
    /// Unknown keys are rejected rather than ignored.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key {
            "keyfile" => self.keyfile = Some(PathBuf::from(value)),
            "netns" => {
                self.netns = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "tag" => self.tag = Some(value.to_string()),
            "prefetch-tag" => self.prefetch_tags.push(value.to_string()),
            "prefetch-addr" => self.prefetch_addrs.push(value.to_string()),
            "paths" => {
                let paths = parse_number(key, value)?;
                if paths == 0 || paths > routing::MAX_PATHS {
                    return Err(ConfigError::invalid(key, value));
                }
                self.paths = paths;
            }
            "hops" => {
                let hops = parse_number(key, value)?;
                if !(routing::MIN_HOPS..=routing::MAX_HOPS).contains(&hops) {
                    return Err(ConfigError::invalid(key, value));
                }
                self.hops = hops;
            }
            "inbound-policy" => {
                self.inbound_policy = match value {
                    "handler" => InboundPolicy::Handler,
                    "accept" => InboundPolicy::Accept,
                    "reject" => InboundPolicy::Reject,
                    "allowlist" => InboundPolicy::AllowList,
                    _ => return Err(ConfigError::invalid(key, value)),
                }
            }
            "inbound-allow" => {
                self.inbound_allow.push(value.to_string());
                self.inbound_policy = InboundPolicy::AllowList;
            }
            "session-timeout" => {
                let ms = parse_number(key, value)?;
                if ms == 0 {
                    return Err(ConfigError::invalid(key, value));
                }
                self.session_timeout_ms = ms as u64;
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Our published topic tag, if any
    pub fn topic(&self) -> Option<Tag> {
        self.tag.as_deref().filter(|t| !t.is_empty()).map(Tag::new)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::invalid(key, value))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid value {value:?} for option {key}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EndpointConfig::default();
        assert_eq!(config.paths, routing::DEFAULT_PATHS);
        assert_eq!(config.hops, routing::DEFAULT_HOPS);
        assert_eq!(config.inbound_policy, InboundPolicy::Handler);
        assert!(config.keyfile.is_none());
    }

    #[test]
    fn test_publish_interval_is_quarter_path_lifetime() {
        assert_eq!(
            service::INTROSET_PUBLISH_INTERVAL_MS * 4,
            routing::PATH_LIFETIME_MS
        );
    }

    #[test]
    fn test_set_option_recognized_keys() {
        let mut config = EndpointConfig::new();
        config.set_option("keyfile", "/tmp/hs.key").unwrap();
        config.set_option("netns", "hs0").unwrap();
        config.set_option("tag", "chat").unwrap();
        config.set_option("prefetch-tag", "files").unwrap();
        config.set_option("paths", "6").unwrap();
        config.set_option("hops", "2").unwrap();
        config.set_option("inbound-policy", "reject").unwrap();

        assert_eq!(config.keyfile, Some(PathBuf::from("/tmp/hs.key")));
        assert_eq!(config.netns.as_deref(), Some("hs0"));
        assert_eq!(config.topic(), Some(Tag::new("chat")));
        assert_eq!(config.prefetch_tags, vec!["files".to_string()]);
        assert_eq!(config.paths, 6);
        assert_eq!(config.hops, 2);
        assert_eq!(config.inbound_policy, InboundPolicy::Reject);
    }

    #[test]
    fn test_set_option_rejects_unknown_key() {
        let mut config = EndpointConfig::new();
        let err = config.set_option("bogus", "1").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(k) if k == "bogus"));
    }

    #[test]
    fn test_set_option_rejects_bad_values() {
        let mut config = EndpointConfig::new();
        assert!(config.set_option("paths", "zero").is_err());
        assert!(config.set_option("paths", "0").is_err());
        assert!(config.set_option("hops", "42").is_err());
        assert!(config.set_option("inbound-policy", "maybe").is_err());
        assert_eq!(config.paths, routing::DEFAULT_PATHS);
    }

    #[test]
    fn test_inbound_allow_switches_policy() {
        let mut config = EndpointConfig::new();
        config.set_option("inbound-allow", "abc.hs").unwrap();
        assert_eq!(config.inbound_policy, InboundPolicy::AllowList);
        assert_eq!(config.inbound_allow.len(), 1);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoint.toml");

        let mut config = EndpointConfig::new().with_paths(2);
        config.set_option("prefetch-tag", "news").unwrap();
        config.to_file(&path).unwrap();

        let loaded = EndpointConfig::from_file(&path).unwrap();
        assert_eq!(loaded.paths, 2);
        assert_eq!(loaded.prefetch_tags, vec!["news".to_string()]);
    }
}

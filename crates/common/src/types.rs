use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
///
/// All scheduling in the session layer is expressed in these units so that
/// callers can drive `tick(now)` with a synthetic clock.
pub fn time_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub const TAG_LEN: usize = 16;

/// Application-defined topic label attached to an introduction set
///
/// Strings longer than 16 bytes are truncated, shorter ones zero padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag([u8; TAG_LEN]);

impl Tag {
    pub fn new(name: &str) -> Self {
        let mut bytes = [0u8; TAG_LEN];
        let src = name.as_bytes();
        let len = src.len().min(TAG_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; TAG_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Printable form with trailing padding stripped
    pub fn as_string(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(TAG_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.as_string())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl FromStr for Tag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_padding_and_display() {
        let tag = Tag::new("mytag");
        assert_eq!(tag.as_string(), "mytag");
        assert_eq!(&tag.as_bytes()[..5], b"mytag");
        assert!(tag.as_bytes()[5..].iter().all(|b| *b == 0));
        assert!(!tag.is_empty());
        assert!(Tag::new("").is_empty());
    }

    #[test]
    fn test_tag_truncates_long_names() {
        let tag = Tag::new("a-very-long-topic-name-indeed");
        assert_eq!(tag.as_string().len(), TAG_LEN);
    }

    #[test]
    fn test_time_now_is_monotonic_enough() {
        let a = time_now_ms();
        let b = time_now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}

//! Per-process instance identity.
//!
//! The identity is a loop breaker: a gateway stamps it on every envelope it
//! publishes and drops envelopes carrying its own stamp when they come back
//! through its pattern subscription. It is not unique and not a security
//! token. Two instances drawing the same value would each miss the other's
//! messages, which at 10^8 possible values is tolerated.

use rand::Rng;
use std::fmt;

/// Opaque token identifying one running gateway process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentity(String);

impl InstanceIdentity {
    /// Draw a fresh identity: two 4-digit groups, e.g. `4821-0937`.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let high: u16 = rng.gen_range(0..10_000);
        let low: u16 = rng.gen_range(0..10_000);
        Self(format!("{high:04}-{low:04}"))
    }

    /// Use a fixed identity, e.g. one pinned in configuration.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The token as sent in envelopes.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an envelope's `originId` is this instance.
    #[must_use]
    pub fn is_origin_of(&self, origin_id: &str) -> bool {
        self.0 == origin_id
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_format() {
        for _ in 0..100 {
            let id = InstanceIdentity::generate();
            let (high, low) = id.as_str().split_once('-').unwrap();
            assert_eq!(high.len(), 4);
            assert_eq!(low.len(), 4);
            assert!(high.chars().all(|c| c.is_ascii_digit()));
            assert!(low.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_origin_check() {
        let id = InstanceIdentity::from_string("1234-5678");
        assert!(id.is_origin_of("1234-5678"));
        assert!(!id.is_origin_of("1234-5679"));
        assert_eq!(id.to_string(), "1234-5678");
    }
}

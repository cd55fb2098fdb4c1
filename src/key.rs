//! Limiter key handling.

use std::fmt;

/// Suffix appended to a limiter key to name its lock record.
const LOCK_SUFFIX: &str = "Lock";

/// Identifies one logical rate-limited resource.
///
/// Every limiter instance built with the same key, in any process, shares
/// one bucket in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey(String);

impl LimiterKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of the hash holding the bucket fields.
    pub fn state_key(&self) -> &str {
        &self.0
    }

    /// Store key of the lease guarding this bucket.
    pub fn lock_key(&self) -> String {
        format!("{}{}", self.0, LOCK_SUFFIX)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LimiterKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for LimiterKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_derivation() {
        let key = LimiterKey::new("orders-api");
        assert_eq!(key.state_key(), "orders-api");
        assert_eq!(key.lock_key(), "orders-apiLock");
    }

    #[test]
    fn test_key_equality() {
        let a: LimiterKey = "junit".into();
        let b = LimiterKey::from("junit".to_string());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "junit");
    }
}

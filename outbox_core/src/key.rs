//! Identification of a logical outbox instance.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical outbox: the provider that drains it and the client (tenant,
/// database, ...) it belongs to.
///
/// ```
/// use outbox_core::OutboxKey;
///
/// let key = OutboxKey::new("postgres_polling", "tenant-A");
/// assert_eq!(key.to_string(), "postgres_polling:tenant-A");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutboxKey {
    provider_key: String,
    client_key: String,
}

impl OutboxKey {
    /// Creates a new key.
    pub fn new(provider_key: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            provider_key: provider_key.into(),
            client_key: client_key.into(),
        }
    }

    /// The provider part of the key.
    pub fn provider_key(&self) -> &str {
        &self.provider_key
    }

    /// The client part of the key.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }
}

impl fmt::Display for OutboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_key, self.client_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn keys_compare_by_value() {
        let a = OutboxKey::new("pg", "tenant");
        let b = OutboxKey::new(String::from("pg"), String::from("tenant"));
        assert_eq!(a, b);
        assert_ne!(a, OutboxKey::new("pg", "other"));

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }
}

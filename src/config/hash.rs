//! Hashing for change detection.
//!
//! This module provides deterministic hashes of descriptions and of the
//! resolved dependency ids of a resource. The dependency fingerprint stored
//! with every record is how the differ notices that something a resource
//! depends on was replaced underneath it.

use sha2::{Digest, Sha256};

use super::spec::{Description, ResourceKey};

/// Hasher for descriptions and dependency fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the declared resources of a description.
    ///
    /// Resource order in the file does not affect the hash.
    #[must_use]
    pub fn hash_description(&self, description: &Description) -> String {
        let mut hasher = Sha256::new();

        hasher.update(description.stack.name.as_bytes());
        hasher.update(description.stack.environment.as_bytes());

        let mut resources: Vec<_> = description.resources.iter().collect();
        resources.sort_by_key(|r| r.key());
        for resource in resources {
            hasher.update(resource.key().to_string().as_bytes());
            // BTreeMap-backed values serialize in a stable order
            let encoded = serde_json::to_vec(resource).unwrap_or_default();
            hasher.update(&encoded);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a resource's resolved dependencies.
    ///
    /// Each entry pairs a dependency key with its remote identifier.
    #[must_use]
    pub fn dependency_fingerprint<'a>(
        &self,
        dependencies: impl IntoIterator<Item = (&'a ResourceKey, &'a str)>,
    ) -> String {
        let mut entries: Vec<(&ResourceKey, &str)> = dependencies.into_iter().collect();
        entries.sort_unstable();
        entries.dedup();

        let mut hasher = Sha256::new();
        for (key, remote_id) in entries {
            hasher.update(key.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(remote_id.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    #[test]
    fn test_dependency_fingerprint_order_independent() {
        let hasher = ConfigHasher::new();
        let vpc = ResourceKey::new("aws_vpc", "main");
        let sg = ResourceKey::new("aws_security_group", "web");

        let a = hasher.dependency_fingerprint([(&vpc, "vpc-1"), (&sg, "sg-1")]);
        let b = hasher.dependency_fingerprint([(&sg, "sg-1"), (&vpc, "vpc-1")]);
        assert_eq!(a, b);

        let c = hasher.dependency_fingerprint([(&vpc, "vpc-2"), (&sg, "sg-1")]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_empty_fingerprint_is_stable() {
        let hasher = ConfigHasher::new();
        let a = hasher.dependency_fingerprint(std::iter::empty());
        let b = hasher.dependency_fingerprint(std::iter::empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_description_hash_ignores_resource_order() {
        let parser = ConfigParser::new();
        let first = parser
            .parse_yaml(
                r"
stack: { name: s }
resources:
  - { name: a, kind: aws_vpc, attributes: { cidr_block: 10.0.0.0/16 } }
  - { name: b, kind: aws_eip, attributes: { domain: vpc } }
",
                None,
            )
            .expect("parse");
        let second = parser
            .parse_yaml(
                r"
stack: { name: s }
resources:
  - { name: b, kind: aws_eip, attributes: { domain: vpc } }
  - { name: a, kind: aws_vpc, attributes: { cidr_block: 10.0.0.0/16 } }
",
                None,
            )
            .expect("parse");

        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_description(&first), hasher.hash_description(&second));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}

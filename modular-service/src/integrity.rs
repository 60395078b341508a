//! Tamper-evident record fingerprints.
//!
//! Every persisted user, group, policy, and audit record carries an
//! HMAC-SHA256 tag computed with the server secret over a canonical
//! serialization of its fields: object keys sorted recursively, compact
//! UTF-8 JSON, the `hash` field itself excluded. A record whose stored tag
//! no longer matches is flagged compromised; callers decide what that means
//! for them (authorization refuses it, listings surface it).

use ring::hmac;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::ConsistencyStatus;

pub struct IntegrityService {
    key: hmac::Key,
}

impl IntegrityService {
    pub fn new(secret_key: &str) -> Self {
        Self { key: hmac::Key::new(hmac::HMAC_SHA256, secret_key.as_bytes()) }
    }

    /// Compute the fingerprint of an entity, ignoring any `hash` field it
    /// already carries.
    pub fn fingerprint<T: Serialize>(&self, entity: &T) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(entity)?;
        if let Value::Object(fields) = &mut value {
            fields.remove("hash");
        }
        let canonical = serde_json::to_string(&canonicalize(value))?;
        let tag = hmac::sign(&self.key, canonical.as_bytes());
        Ok(hex::encode(tag.as_ref()))
    }

    pub fn verify<T: Serialize>(&self, entity: &T, stored_hash: &str) -> ConsistencyStatus {
        match self.fingerprint(entity) {
            Ok(expected) if expected == stored_hash => ConsistencyStatus::Ok,
            _ => ConsistencyStatus::Compromised,
        }
    }
}

/// Rebuild a value with every object's keys in sorted order, so that the
/// serialized form is independent of field declaration or insertion order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut entries: Vec<(String, Value)> = fields.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, entry) in entries {
                sorted.insert(key, canonicalize(entry));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_order_independent() {
        let service = IntegrityService::new("0123456789abcdef");
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(service.fingerprint(&a).unwrap(), service.fingerprint(&b).unwrap());
    }

    #[test]
    fn stored_hash_field_does_not_feed_itself() {
        let service = IntegrityService::new("0123456789abcdef");
        let without = json!({"name": "alice"});
        let with = json!({"name": "alice", "hash": "deadbeef"});
        assert_eq!(service.fingerprint(&without).unwrap(), service.fingerprint(&with).unwrap());
    }

    #[test]
    fn mutation_changes_the_fingerprint() {
        let service = IntegrityService::new("0123456789abcdef");
        let original = json!({"name": "alice", "groups": ["g1"]});
        let hash = service.fingerprint(&original).unwrap();
        assert_eq!(service.verify(&original, &hash), ConsistencyStatus::Ok);

        let tampered = json!({"name": "alice", "groups": ["g1", "admin_group"]});
        assert_eq!(service.verify(&tampered, &hash), ConsistencyStatus::Compromised);
    }

    #[test]
    fn key_matters() {
        let one = IntegrityService::new("0123456789abcdef");
        let two = IntegrityService::new("fedcba9876543210");
        let record = json!({"name": "alice"});
        let hash = one.fingerprint(&record).unwrap();
        assert_eq!(two.verify(&record, &hash), ConsistencyStatus::Compromised);
    }
}

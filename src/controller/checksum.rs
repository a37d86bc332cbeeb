//! Change detection through content checksums
//!
//! A Database keeps the checksums it was last reconciled with in annotations,
//! a DbInstance keeps them in its status. A mismatch restarts the state
//! machine from its first phase.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::credentials::DatabaseCredentials;

pub const SPEC_ANNOTATION: &str = "checksum/spec";
pub const SECRET_ANNOTATION: &str = "checksum/secret";

/// Keys of `DbInstanceStatus::checksums`
pub const SPEC_KEY: &str = "spec";
pub const CONFIG_KEY: &str = "config";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn spec_checksum<T: Serialize>(spec: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_vec(spec)?))
}

/// Checksum of the credential values of a Database's secret
pub fn secret_checksum(credentials: &DatabaseCredentials) -> String {
    let mut hasher = Sha256::new();
    for part in [&credentials.name, &credentials.username, &credentials.password] {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Checksum of config map data, independent of key order
pub fn config_checksum(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Annotations that differ from the expected checksums, with their new values
pub fn changed_annotations(
    annotations: Option<&BTreeMap<String, String>>,
    expected: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    expected
        .iter()
        .filter(|(key, value)| annotations.and_then(|a| a.get(*key)) != Some(*value))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn credentials(password: &str) -> DatabaseCredentials {
        DatabaseCredentials {
            name: "app-db1".to_string(),
            username: "app-db1".to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_secret_checksum_follows_password() {
        let before = secret_checksum(&credentials("a"));
        assert_eq!(before, secret_checksum(&credentials("a")));
        assert_ne!(before, secret_checksum(&credentials("b")));
        assert_eq!(before.len(), 64);
    }

    #[test]
    fn test_spec_checksum_is_stable() {
        let spec = serde_json::json!({"instance": "gen-pg", "secretName": "db1-creds"});
        assert_eq!(spec_checksum(&spec).unwrap(), spec_checksum(&spec).unwrap());
    }

    #[test]
    fn test_changed_annotations() {
        let expected = BTreeMap::from([
            (SPEC_ANNOTATION.to_string(), "s1".to_string()),
            (SECRET_ANNOTATION.to_string(), "p1".to_string()),
        ]);
        assert_eq!(changed_annotations(None, &expected).len(), 2);

        let current = BTreeMap::from([
            (SPEC_ANNOTATION.to_string(), "s1".to_string()),
            (SECRET_ANNOTATION.to_string(), "p0".to_string()),
        ]);
        let changed = changed_annotations(Some(&current), &expected);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed.get(SECRET_ANNOTATION).map(String::as_str), Some("p1"));

        assert!(changed_annotations(Some(&expected), &expected).is_empty());
    }
}

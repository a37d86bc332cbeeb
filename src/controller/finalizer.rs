//! Finalizers guarding Databases and DbUsers
//!
//! A Database carries `db.<name>` while its database exists on the server.
//! Every DbUser adds `dbuser.<name>` to itself and to its Database, which
//! keeps the Database from being removed while users reference it.

use kube::core::ObjectMeta;

const DATABASE_PREFIX: &str = "db.";
const DBUSER_PREFIX: &str = "dbuser.";

pub fn database_finalizer(name: &str) -> String {
    format!("{}{}", DATABASE_PREFIX, name)
}

pub fn dbuser_finalizer(name: &str) -> String {
    format!("{}{}", DBUSER_PREFIX, name)
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// DbUser finalizers present on a Database
pub fn dbuser_finalizers(meta: &ObjectMeta) -> Vec<String> {
    meta.finalizers
        .iter()
        .flatten()
        .filter(|f| f.starts_with(DBUSER_PREFIX))
        .cloned()
        .collect()
}

/// Finalizer list with `finalizer` added, `None` when already present
pub fn with_finalizer(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(meta, finalizer) {
        return None;
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, `None` when absent
pub fn without_finalizer(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if !has_finalizer(meta, finalizer) {
        return None;
    }
    Some(
        meta.finalizers
            .iter()
            .flatten()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

/// Merge patch replacing the finalizer list
///
/// The resource version makes the patch fail on a concurrent change instead
/// of dropping another writer's finalizer.
pub fn finalizers_patch(meta: &ObjectMeta, finalizers: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "finalizers": finalizers,
        }
    })
}

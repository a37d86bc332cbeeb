//! Common utilities for Kubernetes resource generation
//!
//! Shared labels, owner references and the field manager used by every
//! generator.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "db-operator";

/// Label carrying the name of the object a child belongs to
pub const OWNER_LABEL: &str = "kinda.rocks/owner";

/// Generate an owner reference pointing at `owner`
///
/// Children referencing a Database are garbage collected with it.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Owner references for a Database's children; empty unless `cleanup` is set
pub fn owner_references_if<K>(owner: &K, enabled: bool) -> Option<Vec<OwnerReference>>
where
    K: Resource<DynamicType = ()>,
{
    enabled.then(|| vec![owner_reference(owner)])
}

/// Generate standard labels for resources belonging to `owner`
pub fn standard_labels(owner: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), owner.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (OWNER_LABEL.to_string(), owner.to_string()),
    ])
}

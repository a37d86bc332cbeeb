//! Credentials of the cloudsql proxy, copied into the Database namespace

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;

use crate::resources::common::standard_labels;
use crate::resources::proxy::CREDENTIALS_FILE;

pub fn secret_name(database: &str) -> String {
    format!("{}-instance-access", database)
}

/// Pick the credentials out of the configured source secret
///
/// The `credentials.json` key is preferred; a secret with a single key is
/// accepted as is.
pub fn credentials_from_secret(source: &Secret) -> Option<ByteString> {
    let data = source.data.as_ref()?;
    if let Some(value) = data.get(CREDENTIALS_FILE) {
        return Some(value.clone());
    }
    match data.values().collect::<Vec<_>>().as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

pub fn generate_secret(
    database: &str,
    namespace: &str,
    credentials: ByteString,
    owner_references: Option<Vec<OwnerReference>>,
) -> Secret {
    let name = secret_name(database);
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(standard_labels(database, "instance-access")),
            owner_references,
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(CREDENTIALS_FILE.to_string(), credentials)])),
        ..Default::default()
    }
}

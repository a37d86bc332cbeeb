//! Info config map published next to a Database's credentials secret

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;

use crate::database::TlsMode;
use crate::crd::Engine;
use crate::resources::common::standard_labels;

pub const DB_HOST: &str = "DB_HOST";
pub const DB_PORT: &str = "DB_PORT";
pub const SSL_MODE: &str = "SSL_MODE";

/// Connection details for clients of a Database
///
/// Keys reported by the instance come first so the address of the Database
/// (possibly its proxy) wins.
pub fn info_data(
    instance_info: &BTreeMap<String, String>,
    host: &str,
    port: u16,
    engine: Engine,
    tls: TlsMode,
) -> BTreeMap<String, String> {
    let mut data = instance_info.clone();
    data.insert(DB_HOST.to_string(), host.to_string());
    data.insert(DB_PORT.to_string(), port.to_string());
    data.insert(SSL_MODE.to_string(), tls.engine_token(engine).to_string());
    data
}

/// Empty config map named like the credentials secret
pub fn generate_config_map(
    name: &str,
    namespace: &str,
    owner_references: Option<Vec<OwnerReference>>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(standard_labels(name, "info")),
            owner_references,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Merge info keys into an existing config map, leaving other keys alone
pub fn merge_info(config_map: &mut ConfigMap, info: BTreeMap<String, String>) -> bool {
    let data = config_map.data.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in info {
        if data.get(&key) != Some(&value) {
            data.insert(key, value);
            changed = true;
        }
    }
    changed
}

//! Older `v1alpha1` versions of Database and DbInstance
//!
//! Both are still served so existing manifests keep applying. They lack
//! templates, cleanup and TLS settings; converting to `v1beta1` fills those
//! with defaults. An object served as `v1alpha1` carries its full `v1beta1`
//! spec in [`PRESERVED_SPEC_ANNOTATION`], so converting it back restores the
//! fields the old version cannot hold.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::database::{self as current, DatabaseBackup, PostgresOptions};
use super::db_instance::{
    self as current_instance, DbInstanceBackup, DbInstanceMonitoring, DbInstanceSslConnection,
    GenericInstance, GoogleInstance,
};
use super::types::NamespacedName;

/// Key the legacy connection string template is rendered under
pub const CONNECTION_STRING_KEY: &str = "CONNECTION_STRING";

/// Annotation holding the `v1beta1` spec of an object served as `v1alpha1`
pub const PRESERVED_SPEC_ANNOTATION: &str = "kinda.rocks/v1beta1-spec";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kinda.rocks",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    shortname = "db",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Status", "type":"boolean", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Protected", "type":"boolean", "jsonPath":".spec.deletionProtected"}"#,
    printcolumn = r#"{"name":"DBInstance", "type":"string", "jsonPath":".spec.instance"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    pub secret_name: String,

    pub instance: String,

    #[serde(default)]
    pub deletion_protected: bool,

    #[serde(default)]
    pub backup: DatabaseBackup,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string_template: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    #[serde(default)]
    pub phase: String,

    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kinda.rocks",
    version = "v1alpha1",
    kind = "DbInstance",
    plural = "dbinstances",
    shortname = "dbin",
    status = "DbInstanceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Status", "type":"boolean", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceSpec {
    pub engine: String,

    pub admin_user_secret: NamespacedName,

    #[serde(default)]
    pub backup: DbInstanceBackup,

    #[serde(default)]
    pub monitoring: DbInstanceMonitoring,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleInstance>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<GenericInstance>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceStatus {
    #[serde(default)]
    pub phase: String,

    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub info: BTreeMap<String, String>,

    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl From<DatabaseSpec> for current::DatabaseSpec {
    fn from(old: DatabaseSpec) -> Self {
        let postgres = (!old.extensions.is_empty()).then(|| PostgresOptions {
            extensions: old.extensions,
            ..Default::default()
        });
        let secrets_templates = old
            .connection_string_template
            .map(|t| BTreeMap::from([(CONNECTION_STRING_KEY.to_string(), t)]));

        current::DatabaseSpec {
            secret_name: old.secret_name,
            instance: old.instance,
            deletion_protected: old.deletion_protected,
            backup: old.backup,
            postgres,
            secrets_templates,
            templates: Vec::new(),
            cleanup: false,
        }
    }
}

impl From<DbInstanceSpec> for current_instance::DbInstanceSpec {
    fn from(old: DbInstanceSpec) -> Self {
        current_instance::DbInstanceSpec {
            engine: old.engine,
            admin_secret_ref: old.admin_user_secret,
            backup: old.backup,
            monitoring: old.monitoring,
            ssl_connection: DbInstanceSslConnection::default(),
            google: old.google,
            generic: old.generic,
            percona: None,
        }
    }
}

impl From<current::DatabaseSpec> for DatabaseSpec {
    fn from(new: current::DatabaseSpec) -> Self {
        DatabaseSpec {
            secret_name: new.secret_name,
            instance: new.instance,
            deletion_protected: new.deletion_protected,
            backup: new.backup,
            extensions: new.postgres.map(|p| p.extensions).unwrap_or_default(),
            connection_string_template: new
                .secrets_templates
                .and_then(|mut t| t.remove(CONNECTION_STRING_KEY)),
        }
    }
}

impl From<current_instance::DbInstanceSpec> for DbInstanceSpec {
    fn from(new: current_instance::DbInstanceSpec) -> Self {
        DbInstanceSpec {
            engine: new.engine,
            admin_user_secret: new.admin_secret_ref,
            backup: new.backup,
            monitoring: new.monitoring,
            google: new.google,
            generic: new.generic,
        }
    }
}

/// Put back what a `v1alpha1` round trip dropped from a Database spec
///
/// Fields both versions hold keep the values of `spec`.
pub fn restore_database(spec: &mut current::DatabaseSpec, preserved: &current::DatabaseSpec) {
    spec.templates = preserved.templates.clone();
    spec.cleanup = preserved.cleanup;

    if let Some(options) = &preserved.postgres {
        let extensions = spec.postgres.take().map(|p| p.extensions).unwrap_or_default();
        spec.postgres = Some(PostgresOptions {
            extensions,
            ..options.clone()
        });
    }

    let mut templates: BTreeMap<String, String> = preserved
        .secrets_templates
        .iter()
        .flatten()
        .filter(|(key, _)| key.as_str() != CONNECTION_STRING_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(connection_string) = spec
        .secrets_templates
        .as_ref()
        .and_then(|t| t.get(CONNECTION_STRING_KEY))
    {
        templates.insert(CONNECTION_STRING_KEY.to_string(), connection_string.clone());
    }
    spec.secrets_templates = (!templates.is_empty()).then_some(templates);
}

/// Put back what a `v1alpha1` round trip dropped from a DbInstance spec
pub fn restore_db_instance(
    spec: &mut current_instance::DbInstanceSpec,
    preserved: &current_instance::DbInstanceSpec,
) {
    spec.ssl_connection = preserved.ssl_connection.clone();
    spec.percona = preserved.percona.clone();
}

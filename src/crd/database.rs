//! Database CRD definition
//!
//! A Database declares a logical database on a DbInstance. The operator
//! creates the database and its main user, keeps the credentials in the
//! secret named by `secretName`, publishes connection details in a config
//! map of the same name and renders user templates into both.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Template;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kinda.rocks",
    version = "v1beta1",
    kind = "Database",
    plural = "databases",
    shortname = "db",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Status", "type":"boolean", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Protected", "type":"boolean", "jsonPath":".spec.deletionProtected"}"#,
    printcolumn = r#"{"name":"DBInstance", "type":"string", "jsonPath":".spec.instance"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Secret the credentials are written to
    pub secret_name: String,

    /// Name of the DbInstance hosting the database
    pub instance: String,

    /// Keep the database and its user on the server when the resource is deleted
    #[serde(default)]
    pub deletion_protected: bool,

    #[serde(default)]
    pub backup: DatabaseBackup,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresOptions>,

    /// Legacy templates, key to template body. Exclusive with `templates`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_templates: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,

    /// Owner-reference child objects so they are removed with the Database
    #[serde(default)]
    pub cleanup: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseBackup {
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub cron: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<String>,

    #[serde(default)]
    pub drop_public_schema: bool,

    /// Database to use as TEMPLATE on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Phase of a Database
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum DatabasePhase {
    #[default]
    Creating,
    InstanceAccessSecretCreating,
    ProxyCreating,
    SecretsTemplating,
    InfoConfigMapCreating,
    BackupJobCreating,
    Finishing,
    Ready,
    Deleting,
}

impl DatabasePhase {
    /// Numeric code exported in metrics
    pub fn code(&self) -> i64 {
        match self {
            DatabasePhase::Creating => 20,
            DatabasePhase::InstanceAccessSecretCreating => 25,
            DatabasePhase::ProxyCreating => 40,
            DatabasePhase::SecretsTemplating => 50,
            DatabasePhase::InfoConfigMapCreating => 60,
            DatabasePhase::BackupJobCreating => 70,
            DatabasePhase::Finishing => 80,
            DatabasePhase::Ready => 100,
            DatabasePhase::Deleting => 110,
        }
    }
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatabasePhase::Creating => "Creating",
            DatabasePhase::InstanceAccessSecretCreating => "InstanceAccessSecretCreating",
            DatabasePhase::ProxyCreating => "ProxyCreating",
            DatabasePhase::SecretsTemplating => "SecretsTemplating",
            DatabasePhase::InfoConfigMapCreating => "InfoConfigMapCreating",
            DatabasePhase::BackupJobCreating => "BackupJobCreating",
            DatabasePhase::Finishing => "Finishing",
            DatabasePhase::Ready => "Ready",
            DatabasePhase::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// Pointer to the DbInstance the Database was last reconciled against
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub name: String,
    pub engine: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub service_name: String,

    #[serde(default)]
    pub sql_port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    #[serde(default)]
    pub phase: DatabasePhase,

    #[serde(default)]
    pub status: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ref: Option<InstanceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_status: Option<ProxyStatus>,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,
}

impl Database {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.status)
    }

    pub fn phase(&self) -> DatabasePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Proxy status when the proxy is up
    pub fn ready_proxy(&self) -> Option<&ProxyStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.proxy_status.as_ref())
            .filter(|p| p.status)
    }

    pub fn postgres_extensions(&self) -> &[String] {
        self.spec
            .postgres
            .as_ref()
            .map(|p| p.extensions.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_codes_are_stable() {
        assert_eq!(DatabasePhase::Ready.code(), 100);
        assert_eq!(DatabasePhase::Creating.code(), 20);
        assert_eq!(DatabasePhase::Deleting.code(), 110);
    }

    #[test]
    fn test_phase_serializes_verbatim() {
        let json = serde_json::to_string(&DatabasePhase::InfoConfigMapCreating).unwrap();
        assert_eq!(json, "\"InfoConfigMapCreating\"");
        assert_eq!(
            DatabasePhase::InfoConfigMapCreating.to_string(),
            "InfoConfigMapCreating"
        );
    }

    #[test]
    fn test_spec_defaults() {
        let spec: DatabaseSpec =
            serde_json::from_str(r#"{"secretName":"db1-creds","instance":"gen-pg"}"#).unwrap();
        assert!(!spec.deletion_protected);
        assert!(!spec.cleanup);
        assert!(spec.templates.is_empty());
        assert!(spec.secrets_templates.is_none());
        assert!(!spec.backup.enable);
    }
}

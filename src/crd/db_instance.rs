//! DbInstance CRD definition
//!
//! A DbInstance describes a database server the operator can provision
//! databases on. It is cluster scoped and is referenced by name from
//! Database resources. Exactly one backend block (`google`, `generic` or
//! `percona`) must be set.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Engine, NamespacedName, UnsupportedEngine};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kinda.rocks",
    version = "v1beta1",
    kind = "DbInstance",
    plural = "dbinstances",
    shortname = "dbin",
    status = "DbInstanceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Status", "type":"boolean", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Engine", "type":"string", "jsonPath":".spec.engine"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceSpec {
    /// Database engine, `postgres` or `mysql`
    pub engine: String,

    /// Secret holding the admin credentials of the server
    pub admin_secret_ref: NamespacedName,

    #[serde(default)]
    pub backup: DbInstanceBackup,

    #[serde(default)]
    pub monitoring: DbInstanceMonitoring,

    #[serde(default)]
    pub ssl_connection: DbInstanceSslConnection,

    /// Cloud SQL managed instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleInstance>,

    /// Any server reachable from the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<GenericInstance>,

    /// Clustered servers fronted by ProxySQL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percona: Option<PerconaCluster>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceBackup {
    /// GCS bucket the backup jobs upload to
    #[serde(default)]
    pub bucket: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceMonitoring {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceSslConnection {
    #[serde(default)]
    pub enabled: bool,

    /// Encrypt without verifying the server certificate
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleInstance {
    /// Cloud SQL instance name
    pub instance: String,

    /// ConfigMap whose `config` key holds the instance body as JSON
    pub config_map_ref: NamespacedName,

    /// Override of the Cloud SQL Admin API endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,

    /// Secret with the service account used by the cloudsql proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<NamespacedName>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenericInstance {
    pub host: String,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Host the backup jobs connect to instead of `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_host: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PerconaCluster {
    pub servers: Vec<BackendServer>,

    /// Secret with `user` and `password` of the ProxySQL monitor account
    pub monitor_user_secret: NamespacedName,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendServer {
    pub host: String,

    pub port: u16,

    #[serde(default = "default_max_conn")]
    pub max_conn: u32,

    #[serde(default)]
    pub read_only: bool,
}

fn default_max_conn() -> u32 {
    100
}

/// Which backend block of a DbInstance is set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Google,
    Generic,
    Percona,
}

impl BackendKind {
    /// Cloud SQL is only reachable through a proxy next to the operator.
    /// Clustered backends get a proxy per Database instead.
    pub fn needs_instance_proxy(&self) -> bool {
        matches!(self, BackendKind::Google)
    }
}

/// Validation failures of a DbInstance spec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceSpecError {
    #[error(transparent)]
    Engine(#[from] UnsupportedEngine),

    #[error("no backend is configured, one of google, generic or percona must be set")]
    NoBackend,

    #[error("only one backend can be configured, found: {0}")]
    MultipleBackends(String),
}

impl DbInstanceSpec {
    pub fn engine(&self) -> Result<Engine, UnsupportedEngine> {
        self.engine.parse()
    }

    /// Returns the single configured backend
    pub fn validate_backend(&self) -> Result<BackendKind, InstanceSpecError> {
        let mut set = Vec::new();
        if self.google.is_some() {
            set.push((BackendKind::Google, "google"));
        }
        if self.generic.is_some() {
            set.push((BackendKind::Generic, "generic"));
        }
        if self.percona.is_some() {
            set.push((BackendKind::Percona, "percona"));
        }

        match set.as_slice() {
            [] => Err(InstanceSpecError::NoBackend),
            [(kind, _)] => Ok(*kind),
            many => Err(InstanceSpecError::MultipleBackends(
                many.iter()
                    .map(|(_, name)| *name)
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// Engine and backend checks run by the Validating phase
    pub fn validate(&self) -> Result<(Engine, BackendKind), InstanceSpecError> {
        let engine = self.engine()?;
        let backend = self.validate_backend()?;
        Ok((engine, backend))
    }
}

/// Phase of a DbInstance
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum InstancePhase {
    #[default]
    Validating,
    Creating,
    Broadcasting,
    ProxyCreating,
    Running,
}

impl InstancePhase {
    /// Numeric code exported in metrics
    pub fn code(&self) -> i64 {
        match self {
            InstancePhase::Validating => 10,
            InstancePhase::Creating => 20,
            InstancePhase::Broadcasting => 30,
            InstancePhase::ProxyCreating => 40,
            InstancePhase::Running => 100,
        }
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstancePhase::Validating => write!(f, "Validating"),
            InstancePhase::Creating => write!(f, "Creating"),
            InstancePhase::Broadcasting => write!(f, "Broadcasting"),
            InstancePhase::ProxyCreating => write!(f, "ProxyCreating"),
            InstancePhase::Running => write!(f, "Running"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,

    #[serde(default)]
    pub status: bool,

    /// Connection details reported by the backend (DB_CONN, DB_PORT, DB_VERSION, ...)
    #[serde(default)]
    pub info: BTreeMap<String, String>,

    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl DbInstance {
    /// True once the instance reached Running
    pub fn is_running(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.status)
    }

    pub fn info(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.info.clone())
            .unwrap_or_default()
    }
}

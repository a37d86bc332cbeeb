//! DbUser CRD definition
//!
//! An additional principal on a Database in the same namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Template;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kinda.rocks",
    version = "v1beta1",
    kind = "DbUser",
    plural = "dbusers",
    shortname = "dbu",
    namespaced,
    status = "DbUserStatus",
    printcolumn = r#"{"name":"Status", "type":"boolean", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.databaseRef"}"#,
    printcolumn = r#"{"name":"Access", "type":"string", "jsonPath":".spec.accessType"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DbUserSpec {
    /// Name of the Database in the same namespace
    pub database_ref: String,

    /// `readOnly` or `readWrite`
    pub access_type: String,

    /// Secret the user credentials are written to
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum DbUserPhase {
    #[default]
    Creating,
    SecretsTemplating,
    Ready,
    Deleting,
}

impl std::fmt::Display for DbUserPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbUserPhase::Creating => write!(f, "Creating"),
            DbUserPhase::SecretsTemplating => write!(f, "SecretsTemplating"),
            DbUserPhase::Ready => write!(f, "Ready"),
            DbUserPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbUserStatus {
    #[serde(default)]
    pub phase: DbUserPhase,

    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub database_name: String,

    /// Set once the user exists on the server; later reconciles update it
    #[serde(default)]
    pub created: bool,
}

impl DbUser {
    pub fn is_created(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.created)
    }
}

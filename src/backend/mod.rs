//! Instance backends
//!
//! A backend knows whether the server behind a DbInstance exists, how to
//! create or update it and which connection details to report. `create`
//! may answer [`BackendError::AlreadyExists`], after which the reconciler
//! calls `update`. Only Cloud SQL instances are created by the operator.

pub mod generic;
pub mod gsql;
pub mod percona;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::database::{AdminCredentials, DriverError};

pub use generic::Generic;
pub use gsql::{Gsql, GsqlApi};
pub use percona::{Percona, ProxySqlUser, proxysql_config};

/// Keys of the instance info map
pub const INFO_DB_CONN: &str = "DB_CONN";
pub const INFO_DB_PORT: &str = "DB_PORT";
pub const INFO_DB_VERSION: &str = "DB_VERSION";
pub const INFO_DB_PUBLIC_IP: &str = "DB_PUBLIC_IP";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("instance {0} already exists")]
    AlreadyExists(String),

    #[error("instance {0} does not exist")]
    NotFound(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cloud SQL API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("instance {name} did not become {state} in time")]
    Timeout { name: String, state: String },

    #[error("no cluster member is reachable: {0}")]
    Unreachable(String),

    #[error("template error: {0}")]
    Template(String),
}

impl BackendError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
pub enum Backend {
    Generic(Generic),
    Gsql(Gsql),
    Percona(Percona),
}

impl Backend {
    /// Fails with [`BackendError::NotFound`] when the instance is missing
    pub async fn exist(&self, admin: &AdminCredentials) -> Result<()> {
        match self {
            Backend::Generic(b) => b.exist(admin).await,
            Backend::Gsql(b) => b.exist().await,
            Backend::Percona(b) => b.exist(admin).await,
        }
    }

    /// Servers not managed by the operator are never created
    pub async fn create(&self, admin: &AdminCredentials) -> Result<()> {
        match self {
            Backend::Gsql(b) => b.create(admin).await,
            Backend::Generic(_) | Backend::Percona(_) => Ok(()),
        }
    }

    pub async fn update(&self, admin: &AdminCredentials) -> Result<()> {
        match self {
            Backend::Gsql(b) => b.update(admin).await,
            Backend::Generic(_) | Backend::Percona(_) => Ok(()),
        }
    }

    pub async fn info(&self, admin: &AdminCredentials) -> Result<BTreeMap<String, String>> {
        match self {
            Backend::Generic(b) => b.info(admin).await,
            Backend::Gsql(b) => b.info().await,
            Backend::Percona(b) => b.info(admin).await,
        }
    }
}

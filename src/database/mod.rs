//! Engine drivers
//!
//! A [`Driver`] speaks to one database on one server. The variant carries
//! the engine specific configuration; every operation is idempotent so the
//! reconcilers can repeat it after partial failures.

pub mod dummy;
pub mod mysql;
pub mod postgres;
mod retry;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::ByteString;
use thiserror::Error;

use crate::crd::{Engine, PostgresOptions};

pub use dummy::{Dummy, DriverCall};
pub use mysql::Mysql;
pub use postgres::Postgres;
pub use retry::retry;

/// Timeout for opening a connection to a database server
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied to every statement
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts and spacing used when dropping a database that may still be in use
pub const DELETE_DATABASE_ATTEMPTS: u32 = 3;
pub const DELETE_DATABASE_DELAY: Duration = Duration::from_secs(5);

/// Secret keys accepted for the admin password, in order of preference
pub const ADMIN_PASSWORD_KEYS: [&str; 3] = ["password", "postgresql-password", "mysql-root-password"];
pub const ADMIN_USER_KEY: &str = "user";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("admin secret has no password, expected one of: {}", ADMIN_PASSWORD_KEYS.join(", "))]
    MissingAdminPassword,

    #[error("admin secret value for {0} is not valid UTF-8")]
    InvalidUtf8(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("mysql error: {0}")]
    Mysql(#[from] sqlx::Error),

    #[error("role {0} can't be dropped, dependent objects still exist")]
    DependentObjects(String),

    #[error("extensions not installed: {}", .0.join(", "))]
    ExtensionsMissing(Vec<String>),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("query returned no rows")]
    EmptyResult,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("{0}")]
    Injected(String),
}

impl DriverError {
    /// Failures the caller logs and continues past
    pub fn is_dependent_objects(&self) -> bool {
        matches!(self, DriverError::DependentObjects(_))
    }
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// Transport security towards the database server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Disabled,
    Required,
    VerifyCa,
}

impl TlsMode {
    /// Map the DbInstance TLS policy. `skip_verify` downgrades to `Required`.
    pub fn from_policy(enabled: bool, skip_verify: bool) -> Self {
        match (enabled, skip_verify) {
            (false, _) => TlsMode::Disabled,
            (true, true) => TlsMode::Required,
            (true, false) => TlsMode::VerifyCa,
        }
    }

    /// Engine specific connection string token
    pub fn engine_token(&self, engine: Engine) -> &'static str {
        match (engine, self) {
            (Engine::Postgres, TlsMode::Disabled) => "disable",
            (Engine::Postgres, TlsMode::Required) => "require",
            (Engine::Postgres, TlsMode::VerifyCa) => "verify-ca",
            (Engine::Mysql, TlsMode::Disabled) => "disabled",
            (Engine::Mysql, TlsMode::Required) => "required",
            (Engine::Mysql, TlsMode::VerifyCa) => "verify_ca",
        }
    }
}

/// Privileges granted to a user on its database
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessType {
    ReadOnly,
    ReadWrite,
    /// Owner-level access of the Database's own user
    MainUser,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::ReadOnly => "readOnly",
            AccessType::ReadWrite => "readWrite",
            AccessType::MainUser => "mainUser",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported access type \"{0}\", expected readOnly or readWrite")]
pub struct UnsupportedAccessType(pub String);

/// Only the user-facing access types parse; `mainUser` is internal
impl FromStr for AccessType {
    type Err = UnsupportedAccessType;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "readOnly" => Ok(AccessType::ReadOnly),
            "readWrite" => Ok(AccessType::ReadWrite),
            other => Err(UnsupportedAccessType(other.to_string())),
        }
    }
}

/// Admin principal of a database server
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A principal the driver creates, updates or connects as
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseUser {
    pub username: String,
    pub password: String,
    pub access_type: AccessType,
}

impl fmt::Debug for DatabaseUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("access_type", &self.access_type)
            .finish()
    }
}

impl From<&AdminCredentials> for DatabaseUser {
    fn from(admin: &AdminCredentials) -> Self {
        Self {
            username: admin.username.clone(),
            password: admin.password.clone(),
            access_type: AccessType::MainUser,
        }
    }
}

/// Host and port a client connects to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

/// Where a driver connects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    /// Database the driver operates on
    pub database: String,
    pub tls: TlsMode,
}

/// Conventional admin account of an engine
pub fn default_admin_user(engine: Engine) -> &'static str {
    match engine {
        Engine::Postgres => "postgres",
        Engine::Mysql => "root",
    }
}

/// Database every server of an engine has
pub fn control_database(engine: Engine) -> &'static str {
    match engine {
        Engine::Postgres => "postgres",
        Engine::Mysql => "mysql",
    }
}

/// Statement answering the server version as a single text column
pub fn server_version_query(engine: Engine) -> &'static str {
    match engine {
        Engine::Postgres => "SHOW server_version",
        Engine::Mysql => "SELECT VERSION()",
    }
}

/// Read admin credentials from secret data
///
/// The password may live under `password` or one of the keys used by the
/// common helm charts. The user defaults to the engine's admin account.
pub fn parse_admin_credentials(
    engine: Engine,
    data: &BTreeMap<String, ByteString>,
) -> Result<AdminCredentials> {
    let value = |key: &str| -> Result<Option<String>> {
        data.get(key)
            .map(|v| String::from_utf8(v.0.clone()).map_err(|_| DriverError::InvalidUtf8(key.to_string())))
            .transpose()
    };

    let mut password = None;
    for key in ADMIN_PASSWORD_KEYS {
        if let Some(p) = value(key)? {
            password = Some(p);
            break;
        }
    }
    let password = password.ok_or(DriverError::MissingAdminPassword)?;

    let username = value(ADMIN_USER_KEY)?
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| default_admin_user(engine).to_string());

    Ok(AdminCredentials { username, password })
}

/// Engine driver
#[derive(Clone, Debug)]
pub enum Driver {
    Postgres(Postgres),
    Mysql(Mysql),
    Dummy(Dummy),
}

impl Driver {
    /// Driver for `target`; `options` and `main_user` only matter to PostgreSQL
    pub fn new(
        engine: Engine,
        target: ConnectionTarget,
        options: Option<&PostgresOptions>,
        main_user: &str,
    ) -> Self {
        match engine {
            Engine::Postgres => Driver::Postgres(Postgres::new(
                target,
                options.cloned().unwrap_or_default(),
                main_user,
            )),
            Engine::Mysql => Driver::Mysql(Mysql::new(target)),
        }
    }

    pub fn engine(&self) -> Engine {
        match self {
            Driver::Postgres(_) => Engine::Postgres,
            Driver::Mysql(_) => Engine::Mysql,
            Driver::Dummy(d) => d.engine,
        }
    }

    /// Create the target database; existing databases are left alone
    pub async fn create_database(&self, admin: &AdminCredentials) -> Result<()> {
        match self {
            Driver::Postgres(d) => d.create_database(admin).await,
            Driver::Mysql(d) => d.create_database(admin).await,
            Driver::Dummy(d) => d.create_database(admin),
        }
    }

    pub async fn create_or_update_user(
        &self,
        admin: &AdminCredentials,
        user: &DatabaseUser,
    ) -> Result<()> {
        match self {
            Driver::Postgres(d) => d.create_or_update_user(admin, user).await,
            Driver::Mysql(d) => d.create_or_update_user(admin, user).await,
            Driver::Dummy(d) => d.create_or_update_user(admin, user),
        }
    }

    /// Drop a user. A missing user is not an error.
    pub async fn delete_user(&self, admin: &AdminCredentials, user: &DatabaseUser) -> Result<()> {
        match self {
            Driver::Postgres(d) => d.delete_user(admin, user).await,
            Driver::Mysql(d) => d.delete_user(admin, user).await,
            Driver::Dummy(d) => d.delete_user(admin, user),
        }
    }

    /// Drop the target database, retrying while it is still in use
    pub async fn delete_database(&self, admin: &AdminCredentials) -> Result<()> {
        match self {
            Driver::Postgres(d) => {
                retry(DELETE_DATABASE_ATTEMPTS, DELETE_DATABASE_DELAY, || {
                    d.delete_database(admin)
                })
                .await
            }
            Driver::Mysql(d) => {
                retry(DELETE_DATABASE_ATTEMPTS, DELETE_DATABASE_DELAY, || {
                    d.delete_database(admin)
                })
                .await
            }
            Driver::Dummy(d) => d.delete_database(admin),
        }
    }

    pub fn parse_admin_credentials(
        &self,
        data: &BTreeMap<String, ByteString>,
    ) -> Result<AdminCredentials> {
        parse_admin_credentials(self.engine(), data)
    }

    pub fn address(&self) -> Address {
        match self {
            Driver::Postgres(d) => d.address(),
            Driver::Mysql(d) => d.address(),
            Driver::Dummy(d) => d.address.clone(),
        }
    }

    /// Connect as `user` and run a trivial query
    pub async fn check_status(&self, user: &DatabaseUser) -> Result<()> {
        match self {
            Driver::Postgres(d) => d.check_status(user).await,
            Driver::Mysql(d) => d.check_status(user).await,
            Driver::Dummy(d) => d.check_status(user),
        }
    }

    /// Run a read-only statement as `user` and return the first column of the first row
    pub async fn query_as_user(&self, query: &str, user: &DatabaseUser) -> Result<String> {
        match self {
            Driver::Postgres(d) => d.query_as_user(query, user).await,
            Driver::Mysql(d) => d.query_as_user(query, user).await,
            Driver::Dummy(d) => d.query_as_user(query, user),
        }
    }
}

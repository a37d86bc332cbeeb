//! PostgreSQL driver
//!
//! DDL is built from quoted identifiers and literals, never bound
//! parameters, because PostgreSQL does not accept parameters in utility
//! statements. Quoting validates its input first so an unusable name fails
//! before a connection is opened.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, info, warn};

use super::{
    AccessType, Address, AdminCredentials, CONNECT_TIMEOUT, ConnectionTarget, DatabaseUser,
    DriverError, Result, STATEMENT_TIMEOUT, TlsMode, control_database,
};
use crate::crd::{Engine, PostgresOptions};

/// Longest identifier PostgreSQL keeps without truncating
pub const MAX_IDENTIFIER_LEN: usize = 63;

const PUBLIC_SCHEMA: &str = "public";

#[derive(Clone, Debug)]
pub struct Postgres {
    pub target: ConnectionTarget,
    pub options: PostgresOptions,
    /// Owner of the database; default privileges are granted for objects it creates
    pub main_user: String,
}

impl Postgres {
    pub fn new(target: ConnectionTarget, options: PostgresOptions, main_user: impl Into<String>) -> Self {
        Self {
            target,
            options,
            main_user: main_user.into(),
        }
    }

    pub fn address(&self) -> Address {
        Address {
            host: self.target.host.clone(),
            port: self.target.port,
        }
    }

    /// Schemas the users are granted access to
    fn schemas(&self) -> Vec<String> {
        let mut schemas = Vec::new();
        if !self.options.drop_public_schema {
            schemas.push(PUBLIC_SCHEMA.to_string());
        }
        schemas.extend(
            self.options
                .schemas
                .iter()
                .filter(|s| s.as_str() != PUBLIC_SCHEMA)
                .cloned(),
        );
        schemas
    }

    async fn connect(
        &self,
        username: &str,
        password: &str,
        dbname: &str,
    ) -> Result<tokio_postgres::Client> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.target.host)
            .port(self.target.port)
            .user(username)
            .password(password)
            .dbname(dbname)
            .connect_timeout(CONNECT_TIMEOUT)
            .options(&format!(
                "-c statement_timeout={}",
                STATEMENT_TIMEOUT.as_millis()
            ));

        let client = match self.target.tls {
            TlsMode::Disabled => {
                config.ssl_mode(tokio_postgres::config::SslMode::Disable);
                let (client, connection) = config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::trace!(error = %e, "PostgreSQL connection closed");
                    }
                });
                client
            }
            mode => {
                config.ssl_mode(tokio_postgres::config::SslMode::Require);
                let tls = build_tls_connector(mode)?;
                let (client, connection) = config.connect(tls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::trace!(error = %e, "PostgreSQL TLS connection closed");
                    }
                });
                client
            }
        };

        debug!(
            host = %self.target.host,
            port = self.target.port,
            database = %dbname,
            user = %username,
            "PostgreSQL connection established"
        );
        Ok(client)
    }

    async fn connect_admin(&self, admin: &AdminCredentials, dbname: &str) -> Result<tokio_postgres::Client> {
        self.connect(&admin.username, &admin.password, dbname).await
    }

    async fn database_exists(&self, client: &tokio_postgres::Client) -> Result<bool> {
        let row = client
            .query_opt(
                "SELECT 1 FROM pg_database WHERE datname = $1",
                &[&self.target.database],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn create_database(&self, admin: &AdminCredentials) -> Result<()> {
        let database = &self.target.database;
        let create = create_database_statement(database, self.options.template.as_deref())?;
        let setup = database_setup_statements(&self.options)?;

        let client = self
            .connect_admin(admin, control_database(Engine::Postgres))
            .await?;
        if self.database_exists(&client).await? {
            debug!(database = %database, "Database already exists");
        } else {
            match client.batch_execute(&create).await {
                Ok(()) => info!(database = %database, "Created database"),
                Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => {
                    debug!(database = %database, "Database created concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !setup.is_empty() {
            let client = self.connect_admin(admin, database).await?;
            client.batch_execute(&setup.join(";\n")).await?;
        }
        Ok(())
    }

    pub async fn create_or_update_user(
        &self,
        admin: &AdminCredentials,
        user: &DatabaseUser,
    ) -> Result<()> {
        let role = quote_identifier(&user.username)?;
        let password = quote_literal(&user.password)?;
        let grants = grant_statements(
            user.access_type,
            &self.target.database,
            &user.username,
            &self.main_user,
            &self.schemas(),
        )?;

        let client = self
            .connect_admin(admin, control_database(Engine::Postgres))
            .await?;
        let exists = client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&user.username])
            .await?
            .is_some();

        if exists {
            client
                .batch_execute(&format!("ALTER ROLE {} WITH LOGIN PASSWORD {}", role, password))
                .await?;
            debug!(user = %user.username, "Updated user password");
        } else {
            match client
                .batch_execute(&format!("CREATE USER {} WITH PASSWORD {}", role, password))
                .await
            {
                Ok(()) => info!(user = %user.username, "Created user"),
                Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                    client
                        .batch_execute(&format!("ALTER ROLE {} WITH LOGIN PASSWORD {}", role, password))
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let client = self.connect_admin(admin, &self.target.database).await?;
        client.batch_execute(&grants.join(";\n")).await?;
        Ok(())
    }

    pub async fn delete_user(&self, admin: &AdminCredentials, user: &DatabaseUser) -> Result<()> {
        let role = quote_identifier(&user.username)?;

        let client = self
            .connect_admin(admin, control_database(Engine::Postgres))
            .await?;
        let exists = client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&user.username])
            .await?
            .is_some();
        if !exists {
            debug!(user = %user.username, "User does not exist");
            return Ok(());
        }

        if self.database_exists(&client).await? {
            let db_client = self.connect_admin(admin, &self.target.database).await?;
            db_client
                .batch_execute(&format!("DROP OWNED BY {}", role))
                .await?;
        }

        match client
            .batch_execute(&format!("DROP USER IF EXISTS {}", role))
            .await
        {
            Ok(()) => {
                info!(user = %user.username, "Dropped user");
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::DEPENDENT_OBJECTS_STILL_EXIST) => {
                warn!(user = %user.username, error = %e, "User still owns objects");
                Err(DriverError::DependentObjects(user.username.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_database(&self, admin: &AdminCredentials) -> Result<()> {
        let database = &self.target.database;
        let quoted = quote_identifier(database)?;
        let admin_role = quote_identifier(&admin.username)?;

        let client = self
            .connect_admin(admin, control_database(Engine::Postgres))
            .await?;
        if !self.database_exists(&client).await? {
            debug!(database = %database, "Database does not exist");
            return Ok(());
        }

        client
            .batch_execute(&format!(
                "REVOKE CONNECT ON DATABASE {db} FROM PUBLIC;\nREVOKE CONNECT ON DATABASE {db} FROM {admin}",
                db = quoted,
                admin = admin_role
            ))
            .await?;
        client
            .execute(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[database],
            )
            .await?;
        client
            .batch_execute(&format!("DROP DATABASE IF EXISTS {}", quoted))
            .await?;
        info!(database = %database, "Dropped database");
        Ok(())
    }

    pub async fn check_status(&self, user: &DatabaseUser) -> Result<()> {
        let client = self
            .connect(&user.username, &user.password, &self.target.database)
            .await?;
        client.simple_query("SELECT 1").await?;

        if self.options.extensions.is_empty() {
            return Ok(());
        }
        let rows = client
            .query("SELECT extname FROM pg_extension", &[])
            .await?;
        let installed: Vec<String> = rows.iter().map(|r| r.get::<_, String>(0)).collect();
        let missing = missing_extensions(&self.options.extensions, &installed);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DriverError::ExtensionsMissing(missing))
        }
    }

    pub async fn query_as_user(&self, query: &str, user: &DatabaseUser) -> Result<String> {
        let client = self
            .connect(&user.username, &user.password, &self.target.database)
            .await?;
        let messages = client.simple_query(query).await?;
        messages
            .into_iter()
            .find_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(row.get(0).unwrap_or_default().to_string()),
                _ => None,
            })
            .ok_or(DriverError::EmptyResult)
    }
}

/// Quote an identifier with double quotes
pub fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN || name.contains('\0') {
        return Err(DriverError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a string literal
///
/// Values containing backslashes use the escape string syntax so the result
/// does not depend on `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(DriverError::InvalidIdentifier(value.to_string()));
    }
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        Ok(format!("E'{}'", escaped.replace('\\', "\\\\")))
    } else {
        Ok(format!("'{}'", escaped))
    }
}

pub fn create_database_statement(database: &str, template: Option<&str>) -> Result<String> {
    let mut sql = format!("CREATE DATABASE {}", quote_identifier(database)?);
    if let Some(template) = template.filter(|t| !t.is_empty()) {
        sql.push_str(&format!(" TEMPLATE {}", quote_identifier(template)?));
    }
    Ok(sql)
}

/// Extensions, schemas and the optional public schema drop, run inside the new database
pub fn database_setup_statements(options: &PostgresOptions) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    for extension in &options.extensions {
        statements.push(format!(
            "CREATE EXTENSION IF NOT EXISTS {}",
            quote_identifier(extension)?
        ));
    }
    for schema in &options.schemas {
        statements.push(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(schema)?
        ));
    }
    if options.drop_public_schema {
        statements.push("DROP SCHEMA IF EXISTS public CASCADE".to_string());
    }
    Ok(statements)
}

/// Grants for `username` on `database` according to its access type
pub fn grant_statements(
    access: AccessType,
    database: &str,
    username: &str,
    main_user: &str,
    schemas: &[String],
) -> Result<Vec<String>> {
    let db = quote_identifier(database)?;
    let role = quote_identifier(username)?;
    let owner = quote_identifier(main_user)?;

    let mut statements = Vec::new();
    match access {
        AccessType::MainUser => {
            statements.push(format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {}", db, role));
            for schema in schemas {
                let schema = quote_identifier(schema)?;
                statements.push(format!("GRANT ALL ON SCHEMA {} TO {}", schema, role));
                statements.push(format!(
                    "GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA {} TO {}",
                    schema, role
                ));
                statements.push(format!(
                    "GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA {} TO {}",
                    schema, role
                ));
            }
        }
        AccessType::ReadOnly | AccessType::ReadWrite => {
            let (tables, sequences) = match access {
                AccessType::ReadOnly => ("SELECT", "SELECT"),
                _ => ("SELECT, INSERT, UPDATE, DELETE", "USAGE, SELECT"),
            };
            statements.push(format!("GRANT CONNECT ON DATABASE {} TO {}", db, role));
            for schema in schemas {
                let schema = quote_identifier(schema)?;
                statements.push(format!("GRANT USAGE ON SCHEMA {} TO {}", schema, role));
                statements.push(format!(
                    "GRANT {} ON ALL TABLES IN SCHEMA {} TO {}",
                    tables, schema, role
                ));
                statements.push(format!(
                    "GRANT {} ON ALL SEQUENCES IN SCHEMA {} TO {}",
                    sequences, schema, role
                ));
                statements.push(format!(
                    "ALTER DEFAULT PRIVILEGES FOR ROLE {} IN SCHEMA {} GRANT {} ON TABLES TO {}",
                    owner, schema, tables, role
                ));
                statements.push(format!(
                    "ALTER DEFAULT PRIVILEGES FOR ROLE {} IN SCHEMA {} GRANT {} ON SEQUENCES TO {}",
                    owner, schema, sequences, role
                ));
            }
        }
    }
    Ok(statements)
}

fn missing_extensions(wanted: &[String], installed: &[String]) -> Vec<String> {
    wanted
        .iter()
        .filter(|e| !installed.contains(e))
        .cloned()
        .collect()
}

fn build_tls_connector(mode: TlsMode) -> Result<MakeRustlsConnect> {
    match mode {
        TlsMode::Disabled => Err(DriverError::Tls(
            "cannot build TLS connector for disabled TLS mode".to_string(),
        )),
        TlsMode::Required => {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
            Ok(MakeRustlsConnect::new(config))
        }
        TlsMode::VerifyCa => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            Ok(MakeRustlsConnect::new(config))
        }
    }
}

/// Accepts any server certificate; the `require` mode encrypts without verifying
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

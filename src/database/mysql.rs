//! MySQL driver
//!
//! Statements run over the text protocol (`raw_sql`) since account
//! management statements cannot be prepared with bound parameters.

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{Connection, Executor, Row};
use tracing::{debug, info};

use super::{
    AccessType, Address, AdminCredentials, CONNECT_TIMEOUT, ConnectionTarget, DatabaseUser,
    DriverError, Result, TlsMode, control_database,
};
use crate::crd::Engine;

pub const MAX_DATABASE_NAME_LEN: usize = 64;
pub const MAX_USER_NAME_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct Mysql {
    pub target: ConnectionTarget,
}

impl Mysql {
    pub fn new(target: ConnectionTarget) -> Self {
        Self { target }
    }

    pub fn address(&self) -> Address {
        Address {
            host: self.target.host.clone(),
            port: self.target.port,
        }
    }

    async fn connect(&self, username: &str, password: &str, database: &str) -> Result<MySqlConnection> {
        let ssl_mode = match self.target.tls {
            TlsMode::Disabled => MySqlSslMode::Disabled,
            TlsMode::Required => MySqlSslMode::Required,
            TlsMode::VerifyCa => MySqlSslMode::VerifyCa,
        };
        let options = MySqlConnectOptions::new()
            .host(&self.target.host)
            .port(self.target.port)
            .username(username)
            .password(password)
            .database(database)
            .ssl_mode(ssl_mode);

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, MySqlConnection::connect_with(&options))
            .await
            .map_err(|_| DriverError::Timeout(format!("{}:{}", self.target.host, self.target.port)))??;

        debug!(
            host = %self.target.host,
            port = self.target.port,
            database = %database,
            user = %username,
            "MySQL connection established"
        );
        Ok(conn)
    }

    async fn execute_all(&self, admin: &AdminCredentials, statements: &[String]) -> Result<()> {
        let mut conn = self
            .connect(&admin.username, &admin.password, control_database(Engine::Mysql))
            .await?;
        for statement in statements {
            conn.execute(sqlx::raw_sql(statement)).await?;
        }
        conn.close().await?;
        Ok(())
    }

    pub async fn create_database(&self, admin: &AdminCredentials) -> Result<()> {
        let statement = format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_identifier(&self.target.database)?
        );
        self.execute_all(admin, &[statement]).await?;
        info!(database = %self.target.database, "Ensured database exists");
        Ok(())
    }

    pub async fn create_or_update_user(
        &self,
        admin: &AdminCredentials,
        user: &DatabaseUser,
    ) -> Result<()> {
        let statements = user_statements(&self.target.database, user)?;
        self.execute_all(admin, &statements).await?;
        info!(user = %user.username, access = %user.access_type, "Ensured user exists");
        Ok(())
    }

    pub async fn delete_user(&self, admin: &AdminCredentials, user: &DatabaseUser) -> Result<()> {
        let statement = format!("DROP USER IF EXISTS {}", quote_account(&user.username)?);
        self.execute_all(admin, &[statement]).await?;
        info!(user = %user.username, "Dropped user");
        Ok(())
    }

    pub async fn delete_database(&self, admin: &AdminCredentials) -> Result<()> {
        let statement = format!(
            "DROP DATABASE IF EXISTS {}",
            quote_identifier(&self.target.database)?
        );
        self.execute_all(admin, &[statement]).await?;
        info!(database = %self.target.database, "Dropped database");
        Ok(())
    }

    pub async fn check_status(&self, user: &DatabaseUser) -> Result<()> {
        let mut conn = self
            .connect(&user.username, &user.password, &self.target.database)
            .await?;
        conn.execute(sqlx::raw_sql("SELECT 1")).await?;
        conn.close().await?;
        Ok(())
    }

    pub async fn query_as_user(&self, query: &str, user: &DatabaseUser) -> Result<String> {
        let mut conn = self
            .connect(&user.username, &user.password, &self.target.database)
            .await?;
        let row = conn.fetch_optional(sqlx::query(query)).await?;
        conn.close().await?;
        let row = row.ok_or(DriverError::EmptyResult)?;
        first_column_as_string(&row)
    }
}

fn first_column_as_string(row: &MySqlRow) -> Result<String> {
    if let Ok(value) = row.try_get::<String, _>(0) {
        return Ok(value);
    }
    if let Ok(value) = row.try_get::<i64, _>(0) {
        return Ok(value.to_string());
    }
    if let Ok(value) = row.try_get::<f64, _>(0) {
        return Ok(value.to_string());
    }
    Ok(row.try_get::<Option<String>, _>(0)?.unwrap_or_default())
}

/// Quote an identifier with backticks
pub fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty() || name.len() > MAX_DATABASE_NAME_LEN || name.contains('\0') || name.ends_with(' ') {
        return Err(DriverError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote a string literal, escaping backslashes and single quotes
pub fn quote_literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(DriverError::InvalidIdentifier(value.to_string()));
    }
    Ok(format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''")))
}

/// `'user'@'%'`
pub fn quote_account(username: &str) -> Result<String> {
    if username.is_empty() || username.len() > MAX_USER_NAME_LEN {
        return Err(DriverError::InvalidIdentifier(username.to_string()));
    }
    Ok(format!("{}@'%'", quote_literal(username)?))
}

/// Create or update a user and grant it access to `database`
pub fn user_statements(database: &str, user: &DatabaseUser) -> Result<Vec<String>> {
    let account = quote_account(&user.username)?;
    let password = quote_literal(&user.password)?;
    let db = quote_identifier(database)?;

    let privileges = match user.access_type {
        AccessType::MainUser => "ALL PRIVILEGES",
        AccessType::ReadWrite => "SELECT, INSERT, UPDATE, DELETE",
        AccessType::ReadOnly => "SELECT",
    };

    Ok(vec![
        format!("CREATE USER IF NOT EXISTS {} IDENTIFIED BY {}", account, password),
        format!("ALTER USER {} IDENTIFIED BY {}", account, password),
        format!("GRANT {} ON {}.* TO {}", privileges, db, account),
    ])
}

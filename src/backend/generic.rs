//! Servers managed outside the operator

use std::collections::BTreeMap;

use tracing::debug;

use super::{INFO_DB_CONN, INFO_DB_PORT, INFO_DB_PUBLIC_IP, INFO_DB_VERSION, Result};
use crate::crd::Engine;
use crate::database::{
    AdminCredentials, ConnectionTarget, DatabaseUser, Driver, TlsMode, control_database,
    server_version_query,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generic {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub public_ip: Option<String>,
    pub tls: TlsMode,
}

impl Generic {
    /// Driver on the control database, connecting as admin
    fn control_driver(&self, admin: &AdminCredentials) -> Driver {
        let target = ConnectionTarget {
            host: self.host.clone(),
            port: self.port,
            database: control_database(self.engine).to_string(),
            tls: self.tls,
        };
        Driver::new(self.engine, target, None, &admin.username)
    }

    /// Connect to the control database as admin
    pub async fn exist(&self, admin: &AdminCredentials) -> Result<()> {
        self.control_driver(admin)
            .check_status(&DatabaseUser::from(admin))
            .await?;
        debug!(host = %self.host, port = self.port, "Generic instance reachable");
        Ok(())
    }

    /// Connection details plus the version the server reports
    pub async fn info(&self, admin: &AdminCredentials) -> Result<BTreeMap<String, String>> {
        let version = self
            .control_driver(admin)
            .query_as_user(server_version_query(self.engine), &DatabaseUser::from(admin))
            .await?;
        Ok(self.info_with_version(&version))
    }

    pub fn info_with_version(&self, version: &str) -> BTreeMap<String, String> {
        let mut info = BTreeMap::from([
            (INFO_DB_CONN.to_string(), self.host.clone()),
            (INFO_DB_PORT.to_string(), self.port.to_string()),
            (INFO_DB_VERSION.to_string(), version.to_string()),
        ]);
        if let Some(ip) = self.public_ip.as_ref().filter(|ip| !ip.is_empty()) {
            info.insert(INFO_DB_PUBLIC_IP.to_string(), ip.clone());
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_includes_version_and_public_ip() {
        let mut generic = Generic {
            engine: Engine::Postgres,
            host: "pg".to_string(),
            port: 5432,
            public_ip: None,
            tls: TlsMode::Disabled,
        };
        let info = generic.info_with_version("16.2");
        assert_eq!(info.get(INFO_DB_CONN).map(String::as_str), Some("pg"));
        assert_eq!(info.get(INFO_DB_PORT).map(String::as_str), Some("5432"));
        assert_eq!(info.get(INFO_DB_VERSION).map(String::as_str), Some("16.2"));
        assert!(!info.contains_key(INFO_DB_PUBLIC_IP));

        generic.public_ip = Some("1.2.3.4".to_string());
        assert_eq!(
            generic.info_with_version("16.2").get(INFO_DB_PUBLIC_IP).map(String::as_str),
            Some("1.2.3.4")
        );
    }

    #[test]
    fn test_version_query_per_engine() {
        assert_eq!(server_version_query(Engine::Postgres), "SHOW server_version");
        assert_eq!(server_version_query(Engine::Mysql), "SELECT VERSION()");
    }
}

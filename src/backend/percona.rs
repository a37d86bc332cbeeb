//! Percona XtraDB clusters fronted by ProxySQL
//!
//! The cluster is provisioned out of band; the operator only checks that a
//! member answers and renders the ProxySQL configuration for it.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{BackendError, INFO_DB_CONN, INFO_DB_PORT, INFO_DB_VERSION, Result};
use crate::crd::{BackendServer, Engine};
use crate::database::{
    AdminCredentials, ConnectionTarget, DatabaseUser, Driver, TlsMode, control_database,
    server_version_query,
};
use crate::templates::{MapSource, Tree, Value};

/// Port ProxySQL listens on for SQL clients
pub const PROXYSQL_SQL_PORT: u16 = 6033;
pub const PROXYSQL_ADMIN_PORT: u16 = 6032;

const WRITER_HOSTGROUP: i64 = 10;
const READER_HOSTGROUP: i64 = 20;

const PROXYSQL_CONFIG: &str = r#"datadir="/var/lib/proxysql"

admin_variables=
{
    admin_credentials="{{ .AdminUser }}:{{ .AdminPassword }}"
    mysql_ifaces="0.0.0.0:{{ .AdminPort }}"
    refresh_interval=2000
}

mysql_variables=
{
    threads=2
    max_connections=2048
    default_query_delay=0
    default_query_timeout=36000000
    poll_timeout=2000
    interfaces="0.0.0.0:{{ .SqlPort }}"
    default_schema="information_schema"
    stacksize=1048576
    connect_timeout_server=10000
    monitor_username="{{ .MonitorUser }}"
    monitor_password="{{ .MonitorPassword }}"
    monitor_history=60000
    monitor_connect_interval=20000
    monitor_ping_interval=10000
    ping_timeout_server=200
    commands_stats=true
    sessions_sort=true
}

mysql_servers=
(
{{- range .Servers }}
    { address="{{ .Host }}", port={{ .Port }}, hostgroup={{ .Hostgroup }}, max_connections={{ .MaxConn }} }{{ if not .Last }},{{ end }}
{{- end }}
)

mysql_users=
(
{{- range .Users }}
    { username="{{ .Username }}", password="{{ .Password }}", default_hostgroup={{ $.WriterHostgroup }}, active=1 }{{ if not .Last }},{{ end }}
{{- end }}
)

mysql_query_rules=
(
    { rule_id=1, active=1, match_pattern="^SELECT .* FOR UPDATE", destination_hostgroup={{ .WriterHostgroup }}, apply=1 },
    { rule_id=2, active=1, match_pattern="^SELECT", destination_hostgroup={{ .ReaderHostgroup }}, apply=1 }
)
"#;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Percona {
    pub engine: Engine,
    pub servers: Vec<BackendServer>,
    pub tls: TlsMode,
}

impl Percona {
    fn member_driver(&self, server: &BackendServer, admin: &AdminCredentials) -> Driver {
        let target = ConnectionTarget {
            host: server.host.clone(),
            port: server.port,
            database: control_database(self.engine).to_string(),
            tls: self.tls,
        };
        Driver::new(self.engine, target, None, &admin.username)
    }

    /// Writable members first, in declaration order
    fn members(&self) -> impl Iterator<Item = &BackendServer> {
        let writable = self.servers.iter().filter(|s| !s.read_only);
        writable.chain(self.servers.iter().filter(|s| s.read_only))
    }

    /// Succeeds as soon as one member accepts the admin credentials
    pub async fn exist(&self, admin: &AdminCredentials) -> Result<()> {
        let mut failures = Vec::new();
        for server in self.members() {
            match self
                .member_driver(server, admin)
                .check_status(&DatabaseUser::from(admin))
                .await
            {
                Ok(()) => {
                    debug!(host = %server.host, port = server.port, "Cluster member reachable");
                    return Ok(());
                }
                Err(e) => {
                    warn!(host = %server.host, port = server.port, error = %e, "Cluster member not reachable");
                    failures.push(format!("{}:{}: {}", server.host, server.port, e));
                }
            }
        }
        Err(unreachable(failures))
    }

    /// Connection details of the first writable member, with the version
    /// reported by the first member that answers
    pub async fn info(&self, admin: &AdminCredentials) -> Result<BTreeMap<String, String>> {
        let mut failures = Vec::new();
        for server in self.members() {
            match self
                .member_driver(server, admin)
                .query_as_user(server_version_query(self.engine), &DatabaseUser::from(admin))
                .await
            {
                Ok(version) => return Ok(self.info_with_version(&version)),
                Err(e) => failures.push(format!("{}:{}: {}", server.host, server.port, e)),
            }
        }
        Err(unreachable(failures))
    }

    pub fn info_with_version(&self, version: &str) -> BTreeMap<String, String> {
        let mut info = BTreeMap::from([(INFO_DB_VERSION.to_string(), version.to_string())]);
        if let Some(server) = self.members().next() {
            info.insert(INFO_DB_CONN.to_string(), server.host.clone());
            info.insert(INFO_DB_PORT.to_string(), server.port.to_string());
        }
        info
    }
}

fn unreachable(failures: Vec<String>) -> BackendError {
    BackendError::Unreachable(if failures.is_empty() {
        "no servers configured".to_string()
    } else {
        failures.join("; ")
    })
}

/// A user ProxySQL forwards to the cluster
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySqlUser {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ProxySqlUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySqlUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn with_last(items: Vec<BTreeMap<String, Value>>) -> Value {
    let count = items.len();
    Value::List(
        items
            .into_iter()
            .enumerate()
            .map(|(i, mut item)| {
                item.insert("Last".to_string(), Value::Bool(i + 1 == count));
                Value::Map(item)
            })
            .collect(),
    )
}

/// Render `proxysql.cnf` for the cluster members and users
pub fn proxysql_config(
    servers: &[BackendServer],
    users: &[ProxySqlUser],
    monitor: &ProxySqlUser,
    admin: &ProxySqlUser,
) -> Result<String> {
    let servers = servers
        .iter()
        .map(|s| {
            BTreeMap::from([
                ("Host".to_string(), Value::from(s.host.as_str())),
                ("Port".to_string(), Value::from(s.port)),
                ("MaxConn".to_string(), Value::Int(i64::from(s.max_conn))),
                (
                    "Hostgroup".to_string(),
                    Value::Int(if s.read_only { READER_HOSTGROUP } else { WRITER_HOSTGROUP }),
                ),
            ])
        })
        .collect();
    let users = users
        .iter()
        .map(|u| {
            BTreeMap::from([
                ("Username".to_string(), Value::from(u.username.as_str())),
                ("Password".to_string(), Value::from(u.password.as_str())),
            ])
        })
        .collect();

    let source = MapSource(BTreeMap::from([
        ("Servers".to_string(), with_last(servers)),
        ("Users".to_string(), with_last(users)),
        ("MonitorUser".to_string(), Value::from(monitor.username.as_str())),
        ("MonitorPassword".to_string(), Value::from(monitor.password.as_str())),
        ("AdminUser".to_string(), Value::from(admin.username.as_str())),
        ("AdminPassword".to_string(), Value::from(admin.password.as_str())),
        ("AdminPort".to_string(), Value::from(PROXYSQL_ADMIN_PORT)),
        ("SqlPort".to_string(), Value::from(PROXYSQL_SQL_PORT)),
        ("WriterHostgroup".to_string(), Value::Int(WRITER_HOSTGROUP)),
        ("ReaderHostgroup".to_string(), Value::Int(READER_HOSTGROUP)),
    ]));

    Tree::parse("proxysql.cnf", PROXYSQL_CONFIG)
        .and_then(|tree| tree.execute(&source))
        .map_err(|e| BackendError::Template(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn server(host: &str, read_only: bool) -> BackendServer {
        BackendServer {
            host: host.to_string(),
            port: 3306,
            max_conn: 100,
            read_only,
        }
    }

    fn user(name: &str) -> ProxySqlUser {
        ProxySqlUser {
            username: name.to_string(),
            password: format!("{}-pw", name),
        }
    }

    #[test]
    fn test_proxysql_config_lists_servers_and_users() {
        let config = proxysql_config(
            &[server("pxc-0", false), server("pxc-1", true)],
            &[user("app_db1")],
            &user("monitor"),
            &user("admin"),
        )
        .unwrap();

        assert!(config.contains(
            r#"{ address="pxc-0", port=3306, hostgroup=10, max_connections=100 },"#
        ));
        assert!(config.contains(
            r#"{ address="pxc-1", port=3306, hostgroup=20, max_connections=100 }"#
        ));
        assert!(!config.contains("max_connections=100 },\n)"));
        assert!(config.contains(
            r#"{ username="app_db1", password="app_db1-pw", default_hostgroup=10, active=1 }"#
        ));
        assert!(config.contains(r#"monitor_username="monitor""#));
        assert!(config.contains(r#"interfaces="0.0.0.0:6033""#));
    }

    #[test]
    fn test_info_prefers_writable_member() {
        let percona = Percona {
            engine: Engine::Mysql,
            servers: vec![server("pxc-ro", true), server("pxc-rw", false)],
            tls: TlsMode::Disabled,
        };
        let info = percona.info_with_version("8.0.36-28.1");
        assert_eq!(info[INFO_DB_CONN], "pxc-rw");
        assert_eq!(info[INFO_DB_VERSION], "8.0.36-28.1");
    }

    #[tokio::test]
    async fn test_exist_without_servers_fails() {
        let percona = Percona {
            engine: Engine::Mysql,
            servers: Vec::new(),
            tls: TlsMode::Disabled,
        };
        let admin = AdminCredentials {
            username: "root".to_string(),
            password: "pw".to_string(),
        };
        assert!(matches!(
            percona.exist(&admin).await,
            Err(BackendError::Unreachable(_))
        ));
    }
}

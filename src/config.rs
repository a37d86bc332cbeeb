//! Operator configuration
//!
//! Static settings come from a YAML file (default `/srv/config/config.yaml`,
//! overridden by `CONFIG_PATH`). Deployment specific settings come from the
//! environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/srv/config/config.yaml";
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "db-operator";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub backup: BackupConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceConfig {
    pub google: GoogleConfig,
    pub percona: PerconaConfig,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleConfig {
    /// Secret in the operator namespace copied next to each cloudsql proxy
    pub client_secret_name: String,
    pub proxy: ProxyConfig,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PerconaConfig {
    pub proxy: ProxyConfig,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub image: String,
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    pub postgres: ImageConfig,
    pub mysql: ImageConfig,
    pub node_selector: BTreeMap<String, String>,
    pub active_deadline_seconds: i64,
    pub backoff_limit: i32,
    pub resource: ResourceConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            postgres: ImageConfig::default(),
            mysql: ImageConfig::default(),
            node_selector: BTreeMap::new(),
            active_deadline_seconds: 600,
            backoff_limit: 3,
            resource: ResourceConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    pub image: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceConfig {
    pub requests: ResourceAmounts,
    pub limits: ResourceAmounts,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceAmounts {
    pub cpu: String,
    pub memory: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    pub postgres: PostgresMonitoringConfig,
    pub node_selector: BTreeMap<String, String>,
    pub prom_push_gateway: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PostgresMonitoringConfig {
    pub image: String,
    pub queries: String,
}

impl Config {
    /// Parse a config document; an empty document yields defaults
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }
}

/// Settings read from the environment at startup
#[derive(Clone, Debug, PartialEq)]
pub struct EnvConfig {
    pub config_path: PathBuf,
    /// Namespaces to watch; empty means cluster wide
    pub watch_namespaces: Vec<String>,
    pub reconcile_interval: Duration,
    pub gcsql_client_credentials: Option<PathBuf>,
    pub google_application_credentials: Option<PathBuf>,
    /// Namespace the operator runs in
    pub operator_namespace: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            watch_namespaces: Vec::new(),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            gcsql_client_credentials: None,
            google_application_credentials: None,
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let reconcile_interval = match non_empty("RECONCILE_INTERVAL") {
            Some(value) => {
                let secs = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidEnv {
                        name: "RECONCILE_INTERVAL",
                        value: value.clone(),
                    })?;
                Duration::from_secs(secs)
            }
            None => defaults.reconcile_interval,
        };

        Ok(Self {
            config_path: non_empty("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            watch_namespaces: non_empty("WATCH_NAMESPACE")
                .map(|v| parse_namespaces(&v))
                .unwrap_or_default(),
            reconcile_interval,
            gcsql_client_credentials: non_empty("GCSQL_CLIENT_CREDENTIALS").map(PathBuf::from),
            google_application_credentials: non_empty("GOOGLE_APPLICATION_CREDENTIALS")
                .map(PathBuf::from),
            operator_namespace: non_empty("POD_NAMESPACE").unwrap_or(defaults.operator_namespace),
        })
    }
}

fn parse_namespaces(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(String::from)
        .collect()
}

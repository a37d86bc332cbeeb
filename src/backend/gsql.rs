//! Cloud SQL instances
//!
//! Talks to the Cloud SQL Admin API (v1beta4). The instance body comes from
//! the `config` key of the ConfigMap referenced by the DbInstance.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{BackendError, INFO_DB_CONN, INFO_DB_PORT, INFO_DB_PUBLIC_IP, INFO_DB_VERSION, Result};
use crate::crd::Engine;
use crate::database::AdminCredentials;

pub const DEFAULT_API_ENDPOINT: &str = "https://sqladmin.googleapis.com";
pub const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// ConfigMap key holding the instance body
pub const CONFIG_KEY: &str = "config";

pub const RUNNABLE: &str = "RUNNABLE";
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const POLL_ATTEMPTS: u32 = 60;

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Deserialize)]
struct ServiceAccountFile {
    project_id: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpMapping {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub ip_address: String,
}

/// The parts of a Cloud SQL instance resource the operator reads
#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub connection_name: String,
    #[serde(default)]
    pub database_version: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpMapping>,
}

impl InstanceResource {
    pub fn info(&self, engine: Engine) -> BTreeMap<String, String> {
        let port = if self.database_version.starts_with("POSTGRES") {
            Engine::Postgres.default_port()
        } else if self.database_version.starts_with("MYSQL") {
            Engine::Mysql.default_port()
        } else {
            engine.default_port()
        };

        let mut info = BTreeMap::from([
            (INFO_DB_CONN.to_string(), self.connection_name.clone()),
            (INFO_DB_PORT.to_string(), port.to_string()),
            (INFO_DB_VERSION.to_string(), self.database_version.clone()),
        ]);
        if let Some(primary) = self.ip_addresses.iter().find(|ip| ip.kind == "PRIMARY") {
            info.insert(INFO_DB_PUBLIC_IP.to_string(), primary.ip_address.clone());
        }
        info
    }
}

/// Instance body submitted on create and update, with `name` forced
pub fn instance_body(config: &str, name: &str) -> Result<Value> {
    let mut body: Value = serde_json::from_str(config)?;
    let object = body
        .as_object_mut()
        .ok_or_else(|| BackendError::Config("instance config must be a JSON object".to_string()))?;
    object.insert("name".to_string(), Value::String(name.to_string()));
    Ok(body)
}

/// Authenticated client of the Cloud SQL Admin API for one project
#[derive(Clone)]
pub struct GsqlApi {
    client: Client,
    pub endpoint: String,
    pub project: String,
    token: String,
}

impl fmt::Debug for GsqlApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GsqlApi")
            .field("endpoint", &self.endpoint)
            .field("project", &self.project)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl GsqlApi {
    pub fn new(endpoint: &str, project: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project: project.into(),
            token: token.into(),
        })
    }

    /// Token from the metadata server; project from the service account file or the metadata server
    pub async fn discover(endpoint: Option<&str>, credentials_path: Option<&str>) -> Result<Self> {
        let client = Client::builder().build()?;

        let token: AccessToken = client
            .get(format!("{}/instance/service-accounts/default/token", METADATA_URL))
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let from_file = match credentials_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => serde_json::from_str::<ServiceAccountFile>(&contents)?.project_id,
                Err(e) => {
                    debug!(path = %path, error = %e, "Cannot read service account file");
                    None
                }
            },
            None => None,
        };
        let project = match from_file {
            Some(project) => project,
            None => {
                client
                    .get(format!("{}/project/project-id", METADATA_URL))
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?
            }
        };

        Ok(Self {
            client,
            endpoint: endpoint
                .unwrap_or(DEFAULT_API_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            project,
            token: token.access_token,
        })
    }

    fn instances_url(&self) -> String {
        format!("{}/sql/v1beta4/projects/{}/instances", self.endpoint, self.project)
    }

    async fn check(response: reqwest::Response, name: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::CONFLICT {
            return Err(BackendError::AlreadyExists(name.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn get_instance(&self, name: &str) -> Result<Option<InstanceResource>> {
        let response = self
            .client
            .get(format!("{}/{}", self.instances_url(), name))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, name).await?;
        Ok(Some(response.json().await?))
    }

    pub async fn insert_instance(&self, name: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.instances_url())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::check(response, name).await?;
        Ok(())
    }

    pub async fn patch_instance(&self, name: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .patch(format!("{}/{}", self.instances_url(), name))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::check(response, name).await?;
        Ok(())
    }

    pub async fn set_user_password(
        &self,
        name: &str,
        engine: Engine,
        admin: &AdminCredentials,
    ) -> Result<()> {
        let mut request = self
            .client
            .put(format!("{}/{}/users", self.instances_url(), name))
            .bearer_auth(&self.token)
            .query(&[("name", admin.username.as_str())]);
        let mut body = json!({ "name": admin.username, "password": admin.password });
        if engine == Engine::Mysql {
            request = request.query(&[("host", "%")]);
            body["host"] = Value::String("%".to_string());
        }
        let response = request.json(&body).send().await?;
        Self::check(response, name).await?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Gsql {
    pub name: String,
    pub engine: Engine,
    /// Contents of the config map's `config` key
    pub config: String,
    pub api: GsqlApi,
}

impl Gsql {
    pub async fn exist(&self) -> Result<()> {
        match self.api.get_instance(&self.name).await? {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(self.name.clone())),
        }
    }

    /// Insert the instance; a 409 from the API maps to `AlreadyExists`
    pub async fn create(&self, admin: &AdminCredentials) -> Result<()> {
        let body = instance_body(&self.config, &self.name)?;
        info!(instance = %self.name, "Creating Cloud SQL instance");
        self.api.insert_instance(&self.name, &body).await?;
        self.wait_runnable().await?;
        self.api.set_user_password(&self.name, self.engine, admin).await
    }

    pub async fn update(&self, admin: &AdminCredentials) -> Result<()> {
        let body = instance_body(&self.config, &self.name)?;
        info!(instance = %self.name, "Updating Cloud SQL instance");
        self.api.patch_instance(&self.name, &body).await?;
        self.wait_runnable().await?;
        self.api.set_user_password(&self.name, self.engine, admin).await
    }

    pub async fn info(&self) -> Result<BTreeMap<String, String>> {
        let instance = self
            .api
            .get_instance(&self.name)
            .await?
            .ok_or_else(|| BackendError::NotFound(self.name.clone()))?;
        Ok(instance.info(self.engine))
    }

    async fn wait_runnable(&self) -> Result<()> {
        for attempt in 1..=POLL_ATTEMPTS {
            let state = self.api.get_instance(&self.name).await?.map(|i| i.state);
            if state.as_deref() == Some(RUNNABLE) {
                return Ok(());
            }
            debug!(instance = %self.name, attempt, "Waiting for Cloud SQL instance");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(BackendError::Timeout {
            name: self.name.clone(),
            state: RUNNABLE.to_string(),
        })
    }
}

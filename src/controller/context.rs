use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::ByteString;
use kube::Client;
use kube::runtime::events::{Recorder, Reporter};

use crate::config::{Config, EnvConfig};
use crate::controller::error::BackoffConfig;
use crate::health::HealthState;
use crate::resources::FIELD_MANAGER;

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: Arc<Config>,
    pub env: EnvConfig,
    pub health: Option<Arc<HealthState>>,
    pub recorder: Recorder,
    /// Contents of `GCSQL_CLIENT_CREDENTIALS`, read at startup
    pub gsql_credentials: Option<ByteString>,
    pub backoff: BackoffConfig,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: Arc<Config>,
        env: EnvConfig,
        health: Option<Arc<HealthState>>,
        gsql_credentials: Option<ByteString>,
    ) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: hostname::get().ok().map(|h| h.to_string_lossy().to_string()),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            config,
            env,
            health,
            gsql_credentials,
            backoff: BackoffConfig::default(),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count a failure of `key`, returning the number of earlier consecutive failures
    pub fn record_failure(&self, key: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                let previous = *count;
                *count = count.saturating_add(1);
                previous
            }
            Err(_) => 0,
        }
    }

    pub fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

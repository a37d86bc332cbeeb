//! Probe and metrics endpoints of the db-operator
//!
//! `/healthz` and `/readyz` are served on the probe address, `/metrics`
//! on the metrics address. Readiness flips to false once shutdown starts.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels of the per Database gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DatabaseLabels {
    pub db_namespace: String,
    pub dbinstance: String,
    pub database: String,
}

impl prometheus_client::encoding::EncodeLabelSet for DatabaseLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("db_namespace", self.db_namespace.as_str()).encode(encoder.encode_label())?;
        ("dbinstance", self.dbinstance.as_str()).encode(encoder.encode_label())?;
        ("database", self.database.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct InstanceLabels {
    pub dbinstance: String,
}

impl prometheus_client::encoding::EncodeLabelSet for InstanceLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("dbinstance", self.dbinstance.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per phase handler metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl prometheus_client::encoding::EncodeLabelSet for PhaseLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

fn handler_histogram() -> Family<PhaseLabels, Histogram> {
    Family::<PhaseLabels, Histogram>::new_with_constructor(|| {
        Histogram::new(exponential_buckets(0.005, 2.0, 15))
    })
}

/// Shared metrics state
pub struct Metrics {
    /// Phase code of each Database
    pub database_phase: Family<DatabaseLabels, Gauge>,
    /// 1 when a Database is ready, 0 otherwise
    pub database_status: Family<DatabaseLabels, Gauge>,
    /// Phase code of each DbInstance
    pub dbinstance_phase: Family<InstanceLabels, Gauge>,
    pub handler_database_seconds: Family<PhaseLabels, Histogram>,
    pub handler_dbinstance_seconds: Family<PhaseLabels, Histogram>,
    pub handler_database_phase_error: Family<PhaseLabels, Counter>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let database_phase = Family::<DatabaseLabels, Gauge>::default();
        registry.register(
            "db_operator_database_phase",
            "Current phase of the database",
            database_phase.clone(),
        );

        let database_status = Family::<DatabaseLabels, Gauge>::default();
        registry.register(
            "db_operator_database_status",
            "Whether the database is ready",
            database_status.clone(),
        );

        let dbinstance_phase = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "db_operator_dbinstance_phase",
            "Current phase of the database instance",
            dbinstance_phase.clone(),
        );

        let handler_database_seconds = handler_histogram();
        registry.register(
            "db_operator_handler_database_seconds",
            "Time spent in each database phase handler",
            handler_database_seconds.clone(),
        );

        let handler_dbinstance_seconds = handler_histogram();
        registry.register(
            "db_operator_handler_dbinstance_seconds",
            "Time spent in each database instance phase handler",
            handler_dbinstance_seconds.clone(),
        );

        let handler_database_phase_error = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "db_operator_handler_database_phase_error",
            "Number of failed database phase handlers",
            handler_database_phase_error.clone(),
        );

        Self {
            database_phase,
            database_status,
            dbinstance_phase,
            handler_database_seconds,
            handler_dbinstance_seconds,
            handler_database_phase_error,
            registry,
        }
    }

    pub fn set_database_phase(
        &self,
        namespace: &str,
        instance: &str,
        database: &str,
        phase_code: i64,
        ready: bool,
    ) {
        let labels = DatabaseLabels {
            db_namespace: namespace.to_string(),
            dbinstance: instance.to_string(),
            database: database.to_string(),
        };
        self.database_phase.get_or_create(&labels).set(phase_code);
        self.database_status
            .get_or_create(&labels)
            .set(i64::from(ready));
    }

    pub fn set_dbinstance_phase(&self, instance: &str, phase_code: i64) {
        let labels = InstanceLabels {
            dbinstance: instance.to_string(),
        };
        self.dbinstance_phase.get_or_create(&labels).set(phase_code);
    }

    /// Drop the gauges of a removed Database
    pub fn forget_database(&self, namespace: &str, instance: &str, database: &str) {
        let labels = DatabaseLabels {
            db_namespace: namespace.to_string(),
            dbinstance: instance.to_string(),
            database: database.to_string(),
        };
        self.database_phase.remove(&labels);
        self.database_status.remove(&labels);
    }

    pub fn forget_dbinstance(&self, instance: &str) {
        self.dbinstance_phase.remove(&InstanceLabels {
            dbinstance: instance.to_string(),
        });
    }

    pub fn observe_database_phase(&self, phase: &str, duration_secs: f64) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.handler_database_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn observe_dbinstance_phase(&self, phase: &str, duration_secs: f64) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.handler_dbinstance_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_database_phase_error(&self, phase: &str) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.handler_database_phase_error
            .get_or_create(&labels)
            .inc();
    }

    /// Render the registry in the text exposition format, empty on failure
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Readiness flag and metric families shared by both listeners
pub struct HealthState {
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the controllers started.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub fn probe_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

pub fn metrics_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Turn a `:port` style flag value into a bindable address
pub fn bind_address(flag: &str) -> String {
    if flag.starts_with(':') {
        format!("0.0.0.0{}", flag)
    } else {
        flag.to_string()
    }
}

async fn serve(router: Router, address: &str, what: &str) -> Result<(), std::io::Error> {
    let address = bind_address(address);
    let listener = TcpListener::bind(&address).await?;
    tracing::info!("{} server listening on {}", what, address);
    axum::serve(listener, router).await
}

pub async fn run_probe_server(state: Arc<HealthState>, address: &str) -> Result<(), std::io::Error> {
    serve(probe_router(state), address, "Health probe").await
}

pub async fn run_metrics_server(
    state: Arc<HealthState>,
    address: &str,
) -> Result<(), std::io::Error> {
    serve(metrics_router(state), address, "Metrics").await
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::ByteString;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use db_operator::health::{HealthState, run_metrics_server, run_probe_server};
use db_operator::{Config, Context, EnvConfig, run_controllers, run_webhook_server};

/// Lease configuration
const LEASE_NAME: &str = "db-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

/// Provisions databases and users on PostgreSQL and MySQL instances
#[derive(Parser, Debug)]
#[command(name = "db-operator", version, about)]
struct Args {
    /// Address the metrics endpoint binds to
    #[arg(long, default_value = ":60000")]
    metrics_bind_address: String,

    /// Address the probe endpoints bind to
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Elect a leader before running the controllers
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Directory with tls.crt and tls.key for the admission webhooks
    #[arg(long, env = "WEBHOOK_CERT_DIR", default_value = db_operator::WEBHOOK_CERT_DIR)]
    webhook_cert_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("db_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting db-operator");

    let env = EnvConfig::from_env()?;
    let config = Arc::new(Config::load(&env.config_path)?);
    info!(path = %env.config_path.display(), "Loaded configuration");

    let gsql_credentials = match &env.gcsql_client_credentials {
        Some(path) => Some(ByteString(std::fs::read(path).map_err(|e| {
            format!("Failed to read GCSQL_CLIENT_CREDENTIALS {}: {}", path.display(), e)
        })?)),
        None => None,
    };

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes and metrics are served even while waiting for leadership
    let probe_handle = {
        let health_state = health_state.clone();
        let address = args.health_probe_bind_address.clone();
        tokio::spawn(async move {
            if let Err(e) = run_probe_server(health_state, &address).await {
                error!("Health probe server error: {}", e);
            }
        })
    };
    let metrics_handle = {
        let health_state = health_state.clone();
        let address = args.metrics_bind_address.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(health_state, &address).await {
                error!("Metrics server error: {}", e);
            }
        })
    };

    let cert_dir = args.webhook_cert_dir.clone();
    let webhook_handle = if cert_dir.join("tls.crt").exists() && cert_dir.join("tls.key").exists() {
        info!("TLS certificates found, starting webhook server");
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(&cert_dir).await {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!(
            "TLS certificates not found in {}, webhook server disabled",
            cert_dir.display()
        );
        None
    };

    let lease_renewal_handle = if args.leader_elect {
        Some(acquire_leadership(&client, &env.operator_namespace).await)
    } else {
        None
    };

    let ctx = Arc::new(Context::new(
        client.clone(),
        config,
        env,
        Some(health_state.clone()),
        gsql_credentials,
    ));
    let controller_handle = tokio::spawn(run_controllers(ctx));

    let webhook_future = async {
        match webhook_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Webhook server task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };
    let lease_future = async {
        match lease_renewal_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Lease renewal task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = probe_handle => {
            if let Err(e) = result {
                error!("Health probe task panicked: {}", e);
            }
        }
        result = metrics_handle => {
            if let Err(e) = result {
                error!("Metrics task panicked: {}", e);
            }
        }
        _ = webhook_future => {}
        _ = lease_future => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn lease_lock(client: &Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until this pod holds the lease, then keep renewing it in the background
///
/// Losing the lease exits the process so Kubernetes restarts it into the election.
async fn acquire_leadership(client: &Client, namespace: &str) -> tokio::task::JoinHandle<()> {
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let lock = lease_lock(client, namespace, &pod_name);
    info!("Waiting to acquire leadership...");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

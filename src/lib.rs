pub mod backend;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod database;
pub mod health;
pub mod resources;
pub mod templates;
pub mod webhooks;

pub use config::{Config, EnvConfig};
pub use controller::{
    BackoffConfig, Context, Error, Result, database_error_policy, dbuser_error_policy,
    instance_error_policy, reconcile_database, reconcile_dbuser, reconcile_instance,
};
pub use crd::{Database, DbInstance, DbUser};
pub use health::{HealthState, Metrics};
pub use webhooks::{WEBHOOK_CERT_DIR, WEBHOOK_PORT, WebhookError, run_webhook_server};

use std::sync::Arc;

use futures::{FutureExt, StreamExt, TryStreamExt, future};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::controller::{GenerationFilter, SecretUpdates, databases_for_secret};

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

type ReconcileResult<K> =
    std::result::Result<(ObjectRef<K>, Action), ControllerError<Error, watcher::Error>>;

async fn log_result<K: Resource>(kind: &'static str, result: ReconcileResult<K>) {
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            // Watch events may still arrive for objects that were just deleted
            let is_not_found = matches!(
                &e,
                ControllerError::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists: {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run every controller, per watched namespace or cluster-wide.
pub async fn run_controllers(ctx: Arc<Context>) {
    if let Some(health) = &ctx.health {
        health.set_ready(true).await;
    }

    let namespaces: Vec<Option<String>> = if ctx.env.watch_namespaces.is_empty() {
        vec![None]
    } else {
        ctx.env.watch_namespaces.iter().cloned().map(Some).collect()
    };

    let mut tasks = vec![run_instance_controller(ctx.clone()).boxed()];
    for namespace in namespaces {
        let database_ctx = ctx.clone();
        let database_ns = namespace.clone();
        tasks.push(
            async move { run_database_controller_scoped(database_ctx, database_ns.as_deref()).await }
                .boxed(),
        );
        let dbuser_ctx = ctx.clone();
        tasks.push(
            async move { run_dbuser_controller_scoped(dbuser_ctx, namespace.as_deref()).await }
                .boxed(),
        );
    }
    future::join_all(tasks).await;
}

/// Run the DbInstance controller. DbInstances are cluster-scoped.
pub async fn run_instance_controller(ctx: Arc<Context>) {
    tracing::info!("Starting controller for DbInstance resources");

    let instances: Api<DbInstance> = Api::all(ctx.client.clone());
    let (reader, writer) = reflector::store();
    let health = ctx.health.clone();
    let instance_stream = watcher(instances, WatcherConfig::default().any_semantic())
        .default_backoff()
        .reflect(writer)
        .inspect_ok(move |event| {
            if let (watcher::Event::Delete(instance), Some(health)) = (event, &health) {
                health.metrics.forget_dbinstance(&instance.name_any());
            }
        })
        .applied_objects();

    Controller::for_stream(instance_stream, reader)
        .run(reconcile_instance, instance_error_policy, ctx)
        .for_each(|result| log_result("DbInstance", result))
        .await;

    tracing::error!("DbInstance controller stream ended unexpectedly");
}

/// Run the Database controller with optional namespace scoping.
///
/// Database events pass through a [`GenerationFilter`] so status updates
/// don't trigger reconciles. Updates of credential secrets are mapped to
/// the Databases named in their annotation.
pub async fn run_database_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for Database resources (scope: {})",
        scope_msg
    );

    let databases: Api<Database> = scoped_api(ctx.client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(ctx.client.clone(), namespace);

    let (reader, writer) = reflector::store();
    let mut filter = GenerationFilter::default();
    let database_stream = watcher(databases, WatcherConfig::default().any_semantic())
        .default_backoff()
        .reflect(writer)
        .try_filter_map(move |event| future::ready(Ok(filter.filter_event(event))));

    let mut updates = SecretUpdates::default();
    let secret_stream = watcher(secrets, WatcherConfig::default())
        .default_backoff()
        .filter_map(move |event| future::ready(updates.on_event(event)));

    Controller::for_stream(database_stream, reader)
        .watches_stream(secret_stream, |secret| databases_for_secret(&secret))
        .run(reconcile_database, database_error_policy, ctx)
        .for_each(|result| log_result("Database", result))
        .await;

    tracing::error!("Database controller stream ended unexpectedly");
}

/// Run the DbUser controller with optional namespace scoping.
///
/// DbUser events pass through the same [`GenerationFilter`] as Databases,
/// so the reconciler's own status writes don't trigger it again.
pub async fn run_dbuser_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for DbUser resources (scope: {})",
        scope_msg
    );

    let users: Api<DbUser> = scoped_api(ctx.client.clone(), namespace);
    let (reader, writer) = reflector::store();
    let mut filter = GenerationFilter::default();
    let user_stream = watcher(users, WatcherConfig::default().any_semantic())
        .default_backoff()
        .reflect(writer)
        .try_filter_map(move |event| future::ready(Ok(filter.filter_event(event))));

    Controller::for_stream(user_stream, reader)
        .run(reconcile_dbuser, dbuser_error_policy, ctx)
        .for_each(|result| log_result("DbUser", result))
        .await;

    tracing::error!("DbUser controller stream ended unexpectedly");
}

//! Reconciler for DbInstance resources
//!
//! Phases: Validating → Creating → Broadcasting → ProxyCreating → Running.
//! The checksum of the instance spec (and for Cloud SQL the checksum of the instance config
//! map) is kept in the status; a mismatch starts over at Validating. A
//! failed Creating phase is not retried until the object changes, since
//! every attempt calls a quota limited API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{self, Backend, INFO_DB_CONN};
use crate::controller::apply::{apply, apply_proxy};
use crate::controller::checksum::{CONFIG_KEY, SPEC_ANNOTATION, SPEC_KEY, config_checksum, spec_checksum};
use crate::controller::connection::{access_credentials, admin_credentials, build_backend, engine};
use crate::controller::context::Context;
use crate::controller::error::{Error, Requeue, Result};
use crate::controller::events;
use crate::crd::{Database, DbInstance, DbInstanceStatus, InstancePhase};
use crate::database::AdminCredentials;
use crate::resources::proxy::{DEFAULT_CLOUDSQL_PROXY_IMAGE, ProxyKind, ProxyPlan};
use crate::resources::{FIELD_MANAGER, instance_access, owner_reference};

/// Checksums the instance status is compared against
async fn current_checksums(instance: &DbInstance, ctx: &Context) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::from([(SPEC_KEY.to_string(), spec_checksum(&instance.spec)?)]);
    if let Some(google) = &instance.spec.google {
        let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &google.config_map_ref.namespace);
        if let Some(config_map) = api.get_opt(&google.config_map_ref.name).await? {
            checksums.insert(
                CONFIG_KEY.to_string(),
                config_checksum(&config_map.data.unwrap_or_default()),
            );
        }
    }
    Ok(checksums)
}

/// Phase that follows `phase` on the way to Running
pub fn next_phase(phase: InstancePhase) -> InstancePhase {
    match phase {
        InstancePhase::Validating => InstancePhase::Creating,
        InstancePhase::Creating => InstancePhase::Broadcasting,
        InstancePhase::Broadcasting => InstancePhase::ProxyCreating,
        InstancePhase::ProxyCreating | InstancePhase::Running => InstancePhase::Running,
    }
}

/// Status to start over from when the checksums moved, None when they match
pub fn restart_on_change(
    status: &DbInstanceStatus,
    checksums: BTreeMap<String, String>,
) -> Option<DbInstanceStatus> {
    if status.checksums == checksums {
        return None;
    }
    Some(DbInstanceStatus {
        phase: InstancePhase::Validating,
        status: false,
        checksums,
        info: status.info.clone(),
    })
}

/// Create the instance, or update it when it is already there, and collect its info
pub async fn provision(
    backend: &Backend,
    admin: &AdminCredentials,
) -> backend::Result<BTreeMap<String, String>> {
    match backend.exist(admin).await {
        Ok(()) => backend.update(admin).await?,
        Err(e) if e.is_not_found() => match backend.create(admin).await {
            Err(e) if e.is_already_exists() => backend.update(admin).await?,
            other => other?,
        },
        Err(e) => return Err(e),
    }
    backend.info(admin).await
}

async fn patch_status(ctx: &Context, name: &str, status: &DbInstanceStatus) -> Result<()> {
    let api: Api<DbInstance> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    if let Some(health) = &ctx.health {
        health.metrics.set_dbinstance_phase(name, status.phase.code());
    }
    Ok(())
}

/// Main reconciliation function
#[instrument(skip(instance, ctx), fields(name = %instance.name_any()))]
pub async fn reconcile_instance(instance: Arc<DbInstance>, ctx: Arc<Context>) -> Result<Action> {
    let name = instance.name_any();
    let mut status = instance.status.clone().unwrap_or_default();

    let checksums = current_checksums(&instance, &ctx).await?;
    if let Some(restarted) = restart_on_change(&status, checksums) {
        if !status.checksums.is_empty() {
            info!("DbInstance changed, starting over");
        }
        status = restarted;
        patch_status(&ctx, &name, &status).await?;
    }

    if status.phase == InstancePhase::Running && status.status {
        debug!("DbInstance is running");
        return Ok(Action::requeue(ctx.env.reconcile_interval));
    }

    info!(phase = %status.phase, "Reconciling DbInstance");

    loop {
        let phase = status.phase;
        if phase == InstancePhase::Running {
            break;
        }

        let started = Instant::now();
        let result = run_phase(&instance, &ctx, &mut status).await;
        if let Some(health) = &ctx.health {
            health
                .metrics
                .observe_dbinstance_phase(&phase.to_string(), started.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                status.phase = next_phase(phase);
                patch_status(&ctx, &name, &status).await?;
            }
            Err(e) => {
                error!(phase = %phase, error = %e, "DbInstance phase failed");
                status.status = false;
                patch_status(&ctx, &name, &status).await?;
                events::phase_failed(&ctx, &instance.object_ref(&()), &phase.to_string(), &e.to_string())
                    .await;
                return Err(e);
            }
        }
    }

    status.status = true;
    patch_status(&ctx, &name, &status).await?;
    events::ready(&ctx, &instance.object_ref(&()), "DbInstance is running").await;
    info!("DbInstance is running");
    Ok(Action::requeue(ctx.env.reconcile_interval))
}

async fn run_phase(
    instance: &DbInstance,
    ctx: &Context,
    status: &mut DbInstanceStatus,
) -> Result<()> {
    let (engine, kind) = instance
        .spec
        .validate()
        .map_err(|e| Error::ValidationError(e.to_string()))?;
    match status.phase {
        InstancePhase::Validating | InstancePhase::Running => Ok(()),
        InstancePhase::Creating => {
            let admin = admin_credentials(ctx, instance, engine).await?;
            let backend = build_backend(ctx, instance, engine, kind).await?;
            status.info = provision(&backend, &admin)
                .await
                .map_err(|e| Error::PermanentError(e.to_string()))?;
            Ok(())
        }
        InstancePhase::Broadcasting => broadcast(instance, ctx).await,
        InstancePhase::ProxyCreating if kind.needs_instance_proxy() => {
            create_instance_proxy(instance, ctx, status).await
        }
        InstancePhase::ProxyCreating => {
            debug!("Backend needs no instance proxy");
            Ok(())
        }
    }
}

/// Clear `checksum/spec` on every Database of this instance so they reconcile again
async fn broadcast(instance: &DbInstance, ctx: &Context) -> Result<()> {
    let name = instance.name_any();
    let apis: Vec<Api<Database>> = if ctx.env.watch_namespaces.is_empty() {
        vec![Api::all(ctx.client.clone())]
    } else {
        ctx.env
            .watch_namespaces
            .iter()
            .map(|ns| Api::namespaced(ctx.client.clone(), ns))
            .collect()
    };

    let patch = serde_json::json!({
        "metadata": { "annotations": { SPEC_ANNOTATION: null } }
    });
    for api in apis {
        for database in api.list(&ListParams::default()).await? {
            if database.spec.instance != name {
                continue;
            }
            let namespace = database.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
            debug!(database = %database.name_any(), namespace = %namespace, "Invalidating Database checksum");
            let namespaced: Api<Database> = Api::namespaced(ctx.client.clone(), &namespace);
            namespaced
                .patch(&database.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
    }
    Ok(())
}

/// The operator reaches Cloud SQL instances through a proxy in its own namespace
async fn create_instance_proxy(
    instance: &DbInstance,
    ctx: &Context,
    status: &DbInstanceStatus,
) -> Result<()> {
    let engine = engine(instance)?;
    let connection_name = status
        .info
        .get(INFO_DB_CONN)
        .cloned()
        .ok_or_else(|| Error::PreconditionFailed(format!("instance info has no {}", INFO_DB_CONN)))?;

    let namespace = ctx.env.operator_namespace.clone();
    let owner = Some(vec![owner_reference(instance)]);
    let credentials = access_credentials(ctx, instance).await?;
    let secret = instance_access::generate_secret(&instance.name_any(), &namespace, credentials, owner.clone());
    apply::<Secret>(&ctx.client, &secret).await?;

    let proxy_config = &ctx.config.instance.google.proxy;
    let plan = ProxyPlan {
        name: instance.name_any(),
        namespace,
        engine,
        kind: ProxyKind::CloudSql {
            connection_name,
            credentials_secret: instance_access::secret_name(&instance.name_any()),
        },
        image: if proxy_config.image.is_empty() {
            DEFAULT_CLOUDSQL_PROXY_IMAGE.to_string()
        } else {
            proxy_config.image.clone()
        },
        node_selector: proxy_config.node_selector.clone(),
        monitoring: instance.spec.monitoring.enabled,
        owner_references: owner,
    };
    let proxy = apply_proxy(&ctx.client, &plan).await?;
    info!(service = %proxy.service_name, port = proxy.sql_port, "Instance proxy ready");
    Ok(())
}

/// Error policy for DbInstance reconciliation
pub fn instance_error_policy(instance: Arc<DbInstance>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!("dbinstance/{}", instance.name_any());
    match error.requeue() {
        Requeue::Never => {
            warn!(name = %instance.name_any(), error = %error, "DbInstance needs a change before it is retried");
            Action::await_change()
        }
        Requeue::After(delay) => Action::requeue(delay),
        Requeue::Backoff => {
            let delay = ctx.backoff.delay_for_attempt(ctx.record_failure(&key));
            warn!(name = %instance.name_any(), error = %error, "Retrying DbInstance in {:?}", delay);
            Action::requeue(delay)
        }
    }
}

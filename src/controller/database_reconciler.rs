//! Reconciler for Database resources
//!
//! A reconcile walks the phases in order, from the one recorded in the
//! status up to Ready. Every phase is idempotent, so a reconcile that fails
//! halfway resumes from the failed phase on the next attempt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{INFO_DB_CONN, INFO_DB_PORT, ProxySqlUser, proxysql_config};
use crate::controller::apply::{apply, apply_proxy, save};
use crate::controller::checksum::{
    SECRET_ANNOTATION, SPEC_ANNOTATION, changed_annotations, secret_checksum, sha256_hex,
    spec_checksum,
};
use crate::controller::connection::{
    access_credentials, admin_credentials, driver_for, endpoint, engine, server_address, tls_mode,
};
use crate::controller::context::Context;
use crate::controller::error::{Error, Requeue, Result};
use crate::controller::events;
use crate::controller::finalizer::{
    database_finalizer, dbuser_finalizers, finalizers_patch, with_finalizer, without_finalizer,
};
use crate::credentials::{self, DatabaseCredentials, annotate_database};
use crate::crd::{Database, DatabasePhase, DatabaseStatus, DbInstance, Engine, InstanceRef, NamespacedName};
use crate::database::{AccessType, AdminCredentials, DatabaseUser, Driver};
use crate::resources::backup::{BackupPlan, generate_cron_job};
use crate::resources::proxy::{DEFAULT_CLOUDSQL_PROXY_IMAGE, DEFAULT_PROXYSQL_IMAGE, ProxyKind, ProxyPlan};
use crate::resources::{FIELD_MANAGER, info, instance_access, owner_references_if};
use crate::templates::{self, Carriers, TemplateSet};

/// Message of the error returned while DbUsers still reference a Database
pub const DEPENDENT_USERS_MESSAGE: &str =
    "database can't be removed, while there are DbUser referencing it";

const PROXYSQL_ADMIN_USER: &str = "proxyadmin";
const PROXYSQL_ADMIN_PASSWORD_LEN: usize = 20;
const MONITOR_USER_KEY: &str = "user";
const MONITOR_PASSWORD_KEY: &str = "password";

/// Phase that follows `phase` on the way to Ready
pub fn next_phase(phase: DatabasePhase) -> DatabasePhase {
    match phase {
        DatabasePhase::Creating => DatabasePhase::InstanceAccessSecretCreating,
        DatabasePhase::InstanceAccessSecretCreating => DatabasePhase::ProxyCreating,
        DatabasePhase::ProxyCreating => DatabasePhase::SecretsTemplating,
        DatabasePhase::SecretsTemplating => DatabasePhase::InfoConfigMapCreating,
        DatabasePhase::InfoConfigMapCreating => DatabasePhase::BackupJobCreating,
        DatabasePhase::BackupJobCreating => DatabasePhase::Finishing,
        DatabasePhase::Finishing => DatabasePhase::Ready,
        DatabasePhase::Ready => DatabasePhase::Ready,
        DatabasePhase::Deleting => DatabasePhase::Deleting,
    }
}

/// ProxySQL admin password, stable for a given main user password
pub fn proxysql_admin_password(main_password: &str) -> String {
    sha256_hex(main_password.as_bytes())
        .chars()
        .take(PROXYSQL_ADMIN_PASSWORD_LEN)
        .collect()
}

/// Host and port the backup job dumps from
pub fn backup_address(
    instance: &DbInstance,
    status: &DatabaseStatus,
    engine: Engine,
) -> Option<(String, u16)> {
    if let Some(generic) = &instance.spec.generic
        && let Some(host) = &generic.backup_host
    {
        return Some((host.clone(), generic.port));
    }
    if let Some(proxy) = status.proxy_status.as_ref().filter(|p| p.status) {
        return Some((proxy.service_name.clone(), proxy.sql_port));
    }
    let info = instance.info();
    let host = info.get(INFO_DB_CONN)?.clone();
    let port = info
        .get(INFO_DB_PORT)
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| engine.default_port());
    Some((host, port))
}

fn object_key(database: &Database) -> String {
    format!(
        "database/{}/{}",
        database.namespace().unwrap_or_default(),
        database.name_any()
    )
}

async fn patch_status(ctx: &Context, database: &Database, status: &DatabaseStatus) -> Result<()> {
    let namespace = database.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let api: Api<Database> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &database.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    if let Some(health) = &ctx.health {
        health.metrics.set_database_phase(
            &namespace,
            &database.spec.instance,
            &database.name_any(),
            status.phase.code(),
            status.status,
        );
    }
    Ok(())
}

async fn patch_finalizers(ctx: &Context, database: &Database, finalizers: Vec<String>) -> Result<()> {
    let namespace = database.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let api: Api<Database> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch(
        &database.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&finalizers_patch(&database.metadata, finalizers)),
    )
    .await?;
    Ok(())
}

/// Everything the phases of one reconcile share
struct Run<'a> {
    ctx: &'a Context,
    database: &'a Database,
    namespace: String,
    instance: DbInstance,
    engine: Engine,
    credentials: DatabaseCredentials,
    secret: Secret,
    owner_references: Option<Vec<OwnerReference>>,
}

impl Run<'_> {
    fn main_user(&self) -> DatabaseUser {
        DatabaseUser {
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            access_type: AccessType::MainUser,
        }
    }

    fn driver(&self) -> Result<Driver> {
        driver_for(
            &self.instance,
            self.engine,
            &self.credentials.name,
            self.database.spec.postgres.as_ref(),
            &self.credentials.username,
            &self.ctx.env.operator_namespace,
        )
    }

    async fn admin(&self) -> Result<AdminCredentials> {
        admin_credentials(self.ctx, &self.instance, self.engine).await
    }

    async fn run_phase(&mut self, status: &mut DatabaseStatus) -> Result<()> {
        match status.phase {
            DatabasePhase::Creating => self.create(status).await,
            DatabasePhase::InstanceAccessSecretCreating => self.create_instance_access().await,
            DatabasePhase::ProxyCreating => self.create_proxy(status).await,
            DatabasePhase::SecretsTemplating => self.render_templates(status).await,
            DatabasePhase::InfoConfigMapCreating => self.publish_info(status).await,
            DatabasePhase::BackupJobCreating => self.create_backup_job(status).await,
            DatabasePhase::Finishing | DatabasePhase::Ready | DatabasePhase::Deleting => Ok(()),
        }
    }

    async fn create(&mut self, status: &mut DatabaseStatus) -> Result<()> {
        let admin = self.admin().await?;
        let driver = self.driver()?;
        driver
            .create_database(&admin)
            .await
            .map_err(|e| Error::PermanentError(e.to_string()))?;
        driver.create_or_update_user(&admin, &self.main_user()).await?;

        let finalizer = database_finalizer(&self.database.name_any());
        if let Some(finalizers) = with_finalizer(&self.database.metadata, &finalizer) {
            patch_finalizers(self.ctx, self.database, finalizers).await?;
        }
        if annotate_database(&mut self.secret, &self.database.name_any()) {
            self.secret = save(&self.ctx.client, &self.secret).await?;
        }

        status.instance_ref = Some(InstanceRef {
            name: self.instance.name_any(),
            engine: self.engine.to_string(),
        });
        status.database = self.credentials.name.clone();
        status.user = self.credentials.username.clone();
        info!(database = %status.database, user = %status.user, "Database and main user are in place");
        Ok(())
    }

    async fn create_instance_access(&self) -> Result<()> {
        if self.instance.spec.google.is_none() {
            return Ok(());
        }
        let credentials = access_credentials(self.ctx, &self.instance).await?;
        let secret = instance_access::generate_secret(
            &self.database.name_any(),
            &self.namespace,
            credentials,
            self.owner_references.clone(),
        );
        apply::<Secret>(&self.ctx.client, &secret).await?;
        Ok(())
    }

    async fn create_proxy(&self, status: &mut DatabaseStatus) -> Result<()> {
        let (kind, proxy_config, default_image) = if self.instance.spec.google.is_some() {
            let connection_name = self.instance.info().get(INFO_DB_CONN).cloned().ok_or_else(|| {
                Error::PreconditionFailed(format!("instance reports no {}", INFO_DB_CONN))
            })?;
            (
                ProxyKind::CloudSql {
                    connection_name,
                    credentials_secret: instance_access::secret_name(&self.database.name_any()),
                },
                &self.ctx.config.instance.google.proxy,
                DEFAULT_CLOUDSQL_PROXY_IMAGE,
            )
        } else if let Some(percona) = &self.instance.spec.percona {
            let config = self.proxysql_config(&percona.servers, &percona.monitor_user_secret).await?;
            (
                ProxyKind::ProxySql { config },
                &self.ctx.config.instance.percona.proxy,
                DEFAULT_PROXYSQL_IMAGE,
            )
        } else {
            debug!("Backend needs no proxy");
            return Ok(());
        };

        let plan = ProxyPlan {
            name: self.database.name_any(),
            namespace: self.namespace.clone(),
            engine: self.engine,
            kind,
            image: if proxy_config.image.is_empty() {
                default_image.to_string()
            } else {
                proxy_config.image.clone()
            },
            node_selector: proxy_config.node_selector.clone(),
            monitoring: self.instance.spec.monitoring.enabled,
            owner_references: self.owner_references.clone(),
        };
        status.proxy_status = Some(apply_proxy(&self.ctx.client, &plan).await?);
        Ok(())
    }

    async fn proxysql_config(
        &self,
        servers: &[crate::crd::BackendServer],
        monitor_secret: &NamespacedName,
    ) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.ctx.client.clone(), &monitor_secret.namespace);
        let secret = api
            .get_opt(&monitor_secret.name)
            .await?
            .ok_or_else(|| Error::PreconditionFailed(format!("secret {} not found", monitor_secret)))?;
        let data = secret.data.unwrap_or_default();
        let read = |key: &str| -> Result<String> {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .ok_or_else(|| {
                    Error::PreconditionFailed(format!("secret {} has no {}", monitor_secret, key))
                })
        };
        let monitor = ProxySqlUser {
            username: read(MONITOR_USER_KEY)?,
            password: read(MONITOR_PASSWORD_KEY)?,
        };
        let users = [ProxySqlUser {
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
        }];
        let admin = ProxySqlUser {
            username: PROXYSQL_ADMIN_USER.to_string(),
            password: proxysql_admin_password(&self.credentials.password),
        };
        Ok(proxysql_config(servers, &users, &monitor, &admin)?)
    }

    async fn info_config_map(&self) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        Ok(api.get_opt(&self.database.spec.secret_name).await?.unwrap_or_else(|| {
            info::generate_config_map(
                &self.database.spec.secret_name,
                &self.namespace,
                self.owner_references.clone(),
            )
        }))
    }

    async fn render_templates(&mut self, status: &DatabaseStatus) -> Result<()> {
        let server = server_address(&self.instance, self.engine, &self.ctx.env.operator_namespace)?;
        let endpoint = endpoint(status.proxy_status.as_ref(), self.engine, &server);
        let set = TemplateSet::new(
            &self.database.spec.templates,
            self.database.spec.secrets_templates.as_ref(),
        );

        let mut config_map = self.info_config_map().await?;
        let carriers = Carriers::from_objects(&self.secret, &config_map);
        let rendered = templates::render(&set, &endpoint, &self.driver()?, &self.main_user(), &carriers).await?;
        if rendered == carriers && config_map.metadata.resource_version.is_some() {
            debug!("Templated keys are up to date");
            return Ok(());
        }

        rendered.apply(&mut self.secret, &mut config_map);
        self.secret = save(&self.ctx.client, &self.secret).await?;
        save(&self.ctx.client, &config_map).await?;
        info!(secret = %self.database.spec.secret_name, "Rendered templates");
        Ok(())
    }

    async fn publish_info(&self, status: &DatabaseStatus) -> Result<()> {
        let server = server_address(&self.instance, self.engine, &self.ctx.env.operator_namespace)?;
        let endpoint = endpoint(status.proxy_status.as_ref(), self.engine, &server);
        let data = info::info_data(
            &self.instance.info(),
            &endpoint.host,
            endpoint.port,
            self.engine,
            tls_mode(&self.instance),
        );

        let mut config_map = self.info_config_map().await?;
        if info::merge_info(&mut config_map, data) {
            save(&self.ctx.client, &config_map).await?;
        }
        Ok(())
    }

    async fn create_backup_job(&self, status: &DatabaseStatus) -> Result<()> {
        let backup = &self.database.spec.backup;
        if !backup.enable {
            return Ok(());
        }
        let (host, port) = backup_address(&self.instance, status, self.engine).ok_or_else(|| {
            Error::PreconditionFailed("no address to take backups from".to_string())
        })?;
        let plan = BackupPlan {
            name: self.database.name_any(),
            namespace: self.namespace.clone(),
            engine: self.engine,
            schedule: backup.cron.clone(),
            host,
            port,
            database: self.credentials.name.clone(),
            bucket: self.instance.spec.backup.bucket.clone(),
            secret_name: self.database.spec.secret_name.clone(),
            push_gateway: self.ctx.config.monitoring.prom_push_gateway.clone(),
            owner_references: self.owner_references.clone(),
        };
        apply::<CronJob>(&self.ctx.client, &generate_cron_job(&plan, &self.ctx.config.backup)).await?;
        Ok(())
    }
}

async fn get_instance(ctx: &Context, name: &str) -> Result<Option<DbInstance>> {
    let api: Api<DbInstance> = Api::all(ctx.client.clone());
    Ok(api.get_opt(name).await?)
}

/// Load the credentials secret, creating it on first use
async fn ensure_secret(
    ctx: &Context,
    database: &Database,
    namespace: &str,
    engine: Engine,
    owner_references: Option<Vec<OwnerReference>>,
) -> Result<Secret> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(secret) = api.get_opt(&database.spec.secret_name).await? {
        return Ok(secret);
    }
    info!(secret = %database.spec.secret_name, "Generating credentials");
    let secret = Secret {
        metadata: kube::core::ObjectMeta {
            name: Some(database.spec.secret_name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references,
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(credentials::generate(&database.metadata, engine, "")?),
        ..Default::default()
    };
    save(&ctx.client, &secret).await
}

/// Main reconciliation function
#[instrument(skip(database, ctx), fields(name = %database.name_any(), namespace = database.namespace()))]
pub async fn reconcile_database(database: Arc<Database>, ctx: Arc<Context>) -> Result<Action> {
    if database.metadata.deletion_timestamp.is_some() {
        return delete_database(&database, &ctx).await;
    }

    let namespace = database.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let mut status = database.status.clone().unwrap_or_default();

    let instance = get_instance(&ctx, &database.spec.instance)
        .await?
        .filter(DbInstance::is_running)
        .ok_or_else(|| {
            Error::PreconditionFailed(format!("DbInstance {} is not running", database.spec.instance))
        })?;
    let engine = engine(&instance)?;
    let owner_references = owner_references_if(&*database, database.spec.cleanup);

    let secret = ensure_secret(&ctx, &database, &namespace, engine, owner_references.clone()).await?;
    let credentials = credentials::parse_secret(engine, &secret)?;

    let expected = BTreeMap::from([
        (SPEC_ANNOTATION.to_string(), spec_checksum(&database.spec)?),
        (SECRET_ANNOTATION.to_string(), secret_checksum(&credentials)),
    ]);
    let changed = changed_annotations(database.metadata.annotations.as_ref(), &expected);
    if let Some(restarted) = restart_on_change(&status, &changed) {
        info!(annotations = ?changed.keys().collect::<Vec<_>>(), "Database changed, starting over");
        let api: Api<Database> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": changed } });
        api.patch(&database.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        status = restarted;
        patch_status(&ctx, &database, &status).await?;
    }

    if status.phase == DatabasePhase::Ready && status.status {
        debug!("Database is ready");
        ctx.reset_failures(&object_key(&database));
        return Ok(Action::requeue(ctx.env.reconcile_interval));
    }

    let mut run = Run {
        ctx: &ctx,
        database: &database,
        namespace,
        instance,
        engine,
        credentials,
        secret,
        owner_references,
    };

    info!(phase = %status.phase, "Reconciling Database");
    while status.phase != DatabasePhase::Ready {
        let phase = status.phase;
        let started = Instant::now();
        let result = run.run_phase(&mut status).await;
        if let Some(health) = &ctx.health {
            health
                .metrics
                .observe_database_phase(&phase.to_string(), started.elapsed().as_secs_f64());
        }

        if let Err(e) = result {
            error!(phase = %phase, error = %e, "Database phase failed");
            status.status = false;
            patch_status(&ctx, &database, &status).await?;
            events::phase_failed(&ctx, &database.object_ref(&()), &phase.to_string(), &e.to_string()).await;
            if let Some(health) = &ctx.health {
                health.metrics.record_database_phase_error(&phase.to_string());
            }
            return Err(e);
        }

        status.phase = next_phase(phase);
        patch_status(&ctx, &database, &status).await?;
    }

    status.status = true;
    patch_status(&ctx, &database, &status).await?;
    events::ready(&ctx, &database.object_ref(&()), "Database is ready").await;
    ctx.reset_failures(&object_key(&database));
    info!("Database is ready");
    Ok(Action::requeue(ctx.env.reconcile_interval))
}

/// What deleting a Database does
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionPlan {
    /// The finalizer is already released
    NothingToDo,
    /// DbUsers still hold finalizers on the Database
    Blocked(Vec<String>),
    /// Release the finalizer and leave database and user on the server
    KeepOnServer,
    /// Drop database and main user, then release the finalizer
    Drop,
}

pub fn plan_deletion(database: &Database) -> DeletionPlan {
    let finalizer = database_finalizer(&database.name_any());
    if without_finalizer(&database.metadata, &finalizer).is_none() {
        return DeletionPlan::NothingToDo;
    }
    let users = dbuser_finalizers(&database.metadata);
    if !users.is_empty() {
        DeletionPlan::Blocked(users)
    } else if database.spec.deletion_protected {
        DeletionPlan::KeepOnServer
    } else {
        DeletionPlan::Drop
    }
}

/// Status to record when the checksums changed, `None` when nothing did
pub fn restart_on_change(
    status: &DatabaseStatus,
    changed: &BTreeMap<String, String>,
) -> Option<DatabaseStatus> {
    if changed.is_empty() {
        return None;
    }
    Some(DatabaseStatus {
        phase: DatabasePhase::Creating,
        status: false,
        ..status.clone()
    })
}

/// Drop the database, then its main user
///
/// A main user that still owns objects elsewhere is left in place.
pub async fn drop_database_and_user(
    driver: &Driver,
    admin: &AdminCredentials,
    user: &DatabaseUser,
) -> crate::database::Result<()> {
    driver.delete_database(admin).await?;
    match driver.delete_user(admin, user).await {
        Err(e) if e.is_dependent_objects() => {
            warn!(user = %user.username, error = %e, "User still owns objects, leaving it");
            Ok(())
        }
        other => other,
    }
}

/// Drop the database and its main user, then release the finalizer
async fn delete_database(database: &Database, ctx: &Context) -> Result<Action> {
    let plan = plan_deletion(database);
    if plan == DeletionPlan::NothingToDo {
        return Ok(Action::await_change());
    }

    let mut status = database.status.clone().unwrap_or_default();
    if status.phase != DatabasePhase::Deleting {
        status.phase = DatabasePhase::Deleting;
        status.status = false;
        patch_status(ctx, database, &status).await?;
    }

    match plan {
        DeletionPlan::NothingToDo => {}
        DeletionPlan::Blocked(users) => {
            warn!(dbusers = ?users, "Deletion blocked by DbUsers");
            let e = Error::DependencyBlocked(DEPENDENT_USERS_MESSAGE.to_string());
            events::phase_failed(ctx, &database.object_ref(&()), &status.phase.to_string(), &e.to_string()).await;
            return Err(e);
        }
        DeletionPlan::KeepOnServer => {
            info!("Database is deletion protected, leaving it on the server");
        }
        DeletionPlan::Drop => drop_from_server(database, ctx).await?,
    }

    let finalizer = database_finalizer(&database.name_any());
    let finalizers = without_finalizer(&database.metadata, &finalizer).unwrap_or_default();
    patch_finalizers(ctx, database, finalizers).await?;
    if let Some(health) = &ctx.health {
        health.metrics.forget_database(
            &database.namespace().unwrap_or_default(),
            &database.spec.instance,
            &database.name_any(),
        );
    }
    info!("Database removed");
    Ok(Action::await_change())
}

async fn drop_from_server(database: &Database, ctx: &Context) -> Result<()> {
    let Some(instance) = get_instance(ctx, &database.spec.instance).await? else {
        warn!(instance = %database.spec.instance, "DbInstance is gone, nothing to drop");
        return Ok(());
    };
    let engine = engine(&instance)?;
    let namespace = database.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let credentials = match api.get_opt(&database.spec.secret_name).await? {
        Some(secret) => credentials::parse_secret(engine, &secret)?,
        None => DatabaseCredentials {
            name: credentials::database_name(engine, &database.metadata)?,
            username: credentials::user_name(engine, &database.metadata)?,
            password: String::new(),
        },
    };

    let admin = admin_credentials(ctx, &instance, engine).await?;
    let driver = driver_for(
        &instance,
        engine,
        &credentials.name,
        database.spec.postgres.as_ref(),
        &credentials.username,
        &ctx.env.operator_namespace,
    )?;
    let user = DatabaseUser {
        username: credentials.username,
        password: credentials.password,
        access_type: AccessType::MainUser,
    };
    drop_database_and_user(&driver, &admin, &user).await?;
    Ok(())
}

/// Error policy for Database reconciliation
pub fn database_error_policy(database: Arc<Database>, error: &Error, ctx: Arc<Context>) -> Action {
    match error.requeue() {
        Requeue::Never => {
            warn!(name = %database.name_any(), error = %error, "Database needs a change before it is retried");
            Action::await_change()
        }
        Requeue::After(delay) => {
            debug!(name = %database.name_any(), error = %error, "Retrying Database in {:?}", delay);
            Action::requeue(delay)
        }
        Requeue::Backoff => {
            let delay = ctx
                .backoff
                .delay_for_attempt(ctx.record_failure(&object_key(&database)));
            warn!(name = %database.name_any(), error = %error, "Retrying Database in {:?}", delay);
            Action::requeue(delay)
        }
    }
}

//! Reconciler for DbUser resources

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::apply::save;
use crate::controller::connection::{admin_credentials, driver_for, endpoint, engine, server_address};
use crate::controller::context::Context;
use crate::controller::error::{Error, Requeue, Result};
use crate::controller::events;
use crate::controller::finalizer::{dbuser_finalizer, finalizers_patch, has_finalizer, with_finalizer, without_finalizer};
use crate::credentials;
use crate::crd::{Database, DbInstance, DbUser, DbUserPhase, DbUserStatus, Engine};
use crate::database::{AccessType, DatabaseUser, Driver};
use crate::resources::{FIELD_MANAGER, info, owner_reference};
use crate::templates::{self, Carriers, TemplateSet};

fn object_key(user: &DbUser) -> String {
    format!("dbuser/{}/{}", user.namespace().unwrap_or_default(), user.name_any())
}

async fn patch_status(ctx: &Context, user: &DbUser, status: &DbUserStatus) -> Result<()> {
    let namespace = user.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let api: Api<DbUser> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&user.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Replace the finalizers of a namespaced object
async fn patch_finalizers<K>(ctx: &Context, obj: &K, finalizers: Vec<String>) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned,
{
    let namespace = obj.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&finalizers_patch(obj.meta(), finalizers)),
    )
    .await?;
    Ok(())
}

/// Parent Database and its instance, both required to be ready
struct Parent {
    database: Database,
    instance: DbInstance,
    engine: Engine,
}

async fn get_database(ctx: &Context, namespace: &str, name: &str) -> Result<Option<Database>> {
    let api: Api<Database> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

impl Parent {
    async fn load(ctx: &Context, database: Database) -> Result<Option<Self>> {
        let instances: Api<DbInstance> = Api::all(ctx.client.clone());
        let Some(instance) = instances.get_opt(&database.spec.instance).await? else {
            return Ok(None);
        };
        let engine = engine(&instance)?;
        Ok(Some(Self {
            database,
            instance,
            engine,
        }))
    }

    fn database_name(&self) -> String {
        self.database
            .status
            .as_ref()
            .map(|s| s.database.clone())
            .unwrap_or_default()
    }

    fn driver(&self, ctx: &Context) -> Result<Driver> {
        let status = self.database.status.clone().unwrap_or_default();
        driver_for(
            &self.instance,
            self.engine,
            &status.database,
            self.database.spec.postgres.as_ref(),
            &status.user,
            &ctx.env.operator_namespace,
        )
    }
}

/// Status to record before rendering templates, `None` for a user that is
/// already ready on the same database
pub fn templating_status(current: &DbUserStatus, database_name: &str) -> Option<DbUserStatus> {
    let ready = current.phase == DbUserPhase::Ready && current.status && current.created;
    if ready && current.database_name == database_name {
        return None;
    }
    Some(DbUserStatus {
        phase: DbUserPhase::SecretsTemplating,
        status: current.status,
        database_name: database_name.to_string(),
        created: true,
    })
}

pub fn ready_status(database_name: &str) -> DbUserStatus {
    DbUserStatus {
        phase: DbUserPhase::Ready,
        status: true,
        database_name: database_name.to_string(),
        created: true,
    }
}

pub fn failed_status(current: &DbUserStatus) -> DbUserStatus {
    DbUserStatus {
        status: false,
        ..current.clone()
    }
}

/// Writes the status only when it differs from the last one written
struct StatusWriter<'a> {
    ctx: &'a Context,
    user: &'a DbUser,
    recorded: Option<DbUserStatus>,
    current: DbUserStatus,
}

impl<'a> StatusWriter<'a> {
    fn new(ctx: &'a Context, user: &'a DbUser) -> Self {
        Self {
            ctx,
            user,
            recorded: user.status.clone(),
            current: user.status.clone().unwrap_or_default(),
        }
    }

    async fn write(&mut self, status: DbUserStatus) -> Result<()> {
        self.current = status;
        if self.recorded.as_ref() == Some(&self.current) {
            return Ok(());
        }
        patch_status(self.ctx, self.user, &self.current).await?;
        self.recorded = Some(self.current.clone());
        Ok(())
    }
}

/// Main reconciliation function
#[instrument(skip(user, ctx), fields(name = %user.name_any(), namespace = user.namespace()))]
pub async fn reconcile_dbuser(user: Arc<DbUser>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = user.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    if user.metadata.deletion_timestamp.is_some() {
        return delete_dbuser(&user, &ctx, &namespace).await;
    }

    let mut writer = StatusWriter::new(&ctx, &user);
    let result = ensure_dbuser(&user, &ctx, &namespace, &mut writer).await;
    if let Err(e) = &result {
        let phase = writer.current.phase;
        warn!(phase = %phase, error = %e, "DbUser phase failed");
        let failed = failed_status(&writer.current);
        writer.write(failed).await?;
        events::phase_failed(&ctx, &user.object_ref(&()), &phase.to_string(), &e.to_string()).await;
    }
    result
}

async fn ensure_dbuser(
    user: &DbUser,
    ctx: &Context,
    namespace: &str,
    writer: &mut StatusWriter<'_>,
) -> Result<Action> {
    let access_type: AccessType = user
        .spec
        .access_type
        .parse()
        .map_err(|e: crate::database::UnsupportedAccessType| Error::ValidationError(e.to_string()))?;

    let not_ready = || Error::PreconditionFailed(format!("Database {} is not ready", user.spec.database_ref));
    let database = get_database(ctx, namespace, &user.spec.database_ref)
        .await?
        .filter(Database::is_ready)
        .ok_or_else(not_ready)?;
    let parent = Parent::load(ctx, database).await?.ok_or_else(not_ready)?;

    let database_name = parent.database_name();
    let secret = ensure_secret(ctx, user, namespace, parent.engine, &database_name).await?;
    let credentials = credentials::parse_secret(parent.engine, &secret)?;
    let db_user = DatabaseUser {
        username: credentials.username,
        password: credentials.password,
        access_type,
    };

    let admin = admin_credentials(ctx, &parent.instance, parent.engine).await?;
    let driver = parent.driver(ctx)?;
    if writer.current.created {
        debug!(user = %db_user.username, "Updating user");
    } else {
        info!(user = %db_user.username, access = %access_type, "Creating user");
    }
    driver.create_or_update_user(&admin, &db_user).await?;

    let finalizer = dbuser_finalizer(&user.name_any());
    if let Some(finalizers) = with_finalizer(&user.metadata, &finalizer) {
        patch_finalizers(ctx, user, finalizers).await?;
    }
    if let Some(finalizers) = with_finalizer(&parent.database.metadata, &finalizer) {
        patch_finalizers(ctx, &parent.database, finalizers).await?;
    }

    if let Some(templating) = templating_status(&writer.current, &database_name) {
        writer.write(templating).await?;
    }
    render_templates(ctx, user, &parent, &driver, &db_user, secret).await?;

    writer.write(ready_status(&database_name)).await?;
    ctx.reset_failures(&object_key(user));
    Ok(Action::requeue(ctx.env.reconcile_interval))
}

async fn ensure_secret(
    ctx: &Context,
    user: &DbUser,
    namespace: &str,
    engine: Engine,
    database_name: &str,
) -> Result<Secret> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(secret) = api.get_opt(&user.spec.secret_name).await? {
        return Ok(secret);
    }
    info!(secret = %user.spec.secret_name, "Generating user credentials");
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(user.spec.secret_name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner_reference(user)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(credentials::generate(&user.metadata, engine, database_name)?),
        ..Default::default()
    };
    save(&ctx.client, &secret).await
}

async fn render_templates(
    ctx: &Context,
    user: &DbUser,
    parent: &Parent,
    driver: &Driver,
    db_user: &DatabaseUser,
    mut secret: Secret,
) -> Result<()> {
    let namespace = user.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let server = server_address(&parent.instance, parent.engine, &ctx.env.operator_namespace)?;
    let endpoint = endpoint(parent.database.ready_proxy(), parent.engine, &server);
    let set = TemplateSet::new(&user.spec.templates, None);

    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut config_map = api.get_opt(&user.spec.secret_name).await?.unwrap_or_else(|| {
        info::generate_config_map(&user.spec.secret_name, &namespace, Some(vec![owner_reference(user)]))
    });

    let carriers = Carriers::from_objects(&secret, &config_map);
    let rendered = templates::render(&set, &endpoint, driver, db_user, &carriers).await?;
    if rendered == carriers && config_map.metadata.resource_version.is_some() {
        return Ok(());
    }
    rendered.apply(&mut secret, &mut config_map);
    save(&ctx.client, &secret).await?;
    save(&ctx.client, &config_map).await?;
    Ok(())
}

/// Drop the user and release both finalizers
async fn delete_dbuser(user: &DbUser, ctx: &Context, namespace: &str) -> Result<Action> {
    let finalizer = dbuser_finalizer(&user.name_any());
    if !has_finalizer(&user.metadata, &finalizer) {
        return Ok(Action::await_change());
    }

    let mut status = user.status.clone().unwrap_or_default();
    status.phase = DbUserPhase::Deleting;
    status.status = false;
    patch_status(ctx, user, &status).await?;

    match get_database(ctx, namespace, &user.spec.database_ref).await? {
        Some(database) => {
            if let Some(finalizers) = without_finalizer(&database.metadata, &finalizer) {
                match Parent::load(ctx, database.clone()).await? {
                    Some(parent) => drop_user(ctx, user, namespace, &parent).await?,
                    None => warn!(instance = %database.spec.instance, "DbInstance is gone, nothing to drop"),
                }
                patch_finalizers(ctx, &database, finalizers).await?;
            }
        }
        None => warn!(database = %user.spec.database_ref, "Database is gone, nothing to drop"),
    }

    if let Some(finalizers) = without_finalizer(&user.metadata, &finalizer) {
        patch_finalizers(ctx, user, finalizers).await?;
    }
    Ok(Action::await_change())
}

async fn drop_user(ctx: &Context, user: &DbUser, namespace: &str, parent: &Parent) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let username = match secrets.get_opt(&user.spec.secret_name).await? {
        Some(secret) => credentials::parse_secret(parent.engine, &secret)?.username,
        None => credentials::user_name(parent.engine, &user.metadata)?,
    };
    let admin = admin_credentials(ctx, &parent.instance, parent.engine).await?;
    let db_user = DatabaseUser {
        username,
        password: String::new(),
        access_type: user.spec.access_type.parse().unwrap_or(AccessType::ReadOnly),
    };
    parent.driver(ctx)?.delete_user(&admin, &db_user).await?;
    info!(user = %db_user.username, "User dropped");
    Ok(())
}

/// Error policy for DbUser reconciliation
pub fn dbuser_error_policy(user: Arc<DbUser>, error: &Error, ctx: Arc<Context>) -> Action {
    match error.requeue() {
        Requeue::Never => Action::await_change(),
        Requeue::After(delay) => Action::requeue(delay),
        Requeue::Backoff => {
            let delay = ctx.backoff.delay_for_attempt(ctx.record_failure(&object_key(&user)));
            warn!(name = %user.name_any(), error = %error, "Retrying DbUser in {:?}", delay);
            Action::requeue(delay)
        }
    }
}

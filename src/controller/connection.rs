//! Resolving how the operator and its clients reach a DbInstance

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, ResourceExt};

use crate::backend::gsql::CONFIG_KEY;
use crate::backend::{Backend, Generic, Gsql, GsqlApi, INFO_DB_CONN, INFO_DB_PORT, Percona};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{BackendKind, DbInstance, Engine, NamespacedName, PostgresOptions, ProxyStatus};
use crate::database::{
    AdminCredentials, Address, ConnectionTarget, Driver, TlsMode, parse_admin_credentials,
};
use crate::resources::instance_access::credentials_from_secret;
use crate::templates::Endpoint;

pub fn tls_mode(instance: &DbInstance) -> TlsMode {
    let ssl = &instance.spec.ssl_connection;
    TlsMode::from_policy(ssl.enabled, ssl.skip_verify)
}

pub fn engine(instance: &DbInstance) -> Result<Engine> {
    instance
        .spec
        .engine()
        .map_err(|e| Error::ValidationError(e.to_string()))
}

/// Name of the proxy a DbInstance runs in the operator namespace
pub fn instance_proxy_service(instance: &DbInstance) -> String {
    format!("{}-proxy", instance.name_any())
}

/// Address the operator uses to reach the server
///
/// Cloud SQL is reached through the instance proxy; Percona through its
/// first writable member.
pub fn server_address(instance: &DbInstance, engine: Engine, operator_namespace: &str) -> Result<Address> {
    if let Some(generic) = &instance.spec.generic {
        return Ok(Address {
            host: generic.host.clone(),
            port: generic.port,
        });
    }
    if instance.spec.google.is_some() {
        return Ok(Address {
            host: format!("{}.{}", instance_proxy_service(instance), operator_namespace),
            port: engine.default_port(),
        });
    }
    let info = instance.info();
    let host = info
        .get(INFO_DB_CONN)
        .cloned()
        .ok_or_else(|| Error::PreconditionFailed(format!("instance {} reports no {}", instance.name_any(), INFO_DB_CONN)))?;
    let port = info
        .get(INFO_DB_PORT)
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| engine.default_port());
    Ok(Address { host, port })
}

pub fn driver_for(
    instance: &DbInstance,
    engine: Engine,
    database: &str,
    options: Option<&PostgresOptions>,
    main_user: &str,
    operator_namespace: &str,
) -> Result<Driver> {
    let address = server_address(instance, engine, operator_namespace)?;
    let target = ConnectionTarget {
        host: address.host,
        port: address.port,
        database: database.to_string(),
        tls: tls_mode(instance),
    };
    Ok(Driver::new(engine, target, options, main_user))
}

/// Where clients of a Database connect
pub fn endpoint(proxy: Option<&ProxyStatus>, engine: Engine, server: &Address) -> Endpoint {
    match proxy.filter(|p| p.status) {
        Some(proxy) => Endpoint {
            engine,
            host: proxy.service_name.clone(),
            port: proxy.sql_port,
        },
        None => Endpoint {
            engine,
            host: server.host.clone(),
            port: server.port,
        },
    }
}

async fn get_secret(ctx: &Context, reference: &NamespacedName) -> Result<Secret> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &reference.namespace);
    api.get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::PreconditionFailed(format!("secret {} not found", reference)))
}

pub async fn admin_credentials(ctx: &Context, instance: &DbInstance, engine: Engine) -> Result<AdminCredentials> {
    let secret = get_secret(ctx, &instance.spec.admin_secret_ref).await?;
    let data = secret.data.unwrap_or_default();
    Ok(parse_admin_credentials(engine, &data)?)
}

/// Credentials file of the cloudsql proxy
///
/// Taken from the instance's client secret, then from the configured secret
/// in the operator namespace, then from the file read at startup.
pub async fn access_credentials(ctx: &Context, instance: &DbInstance) -> Result<ByteString> {
    let reference = instance
        .spec
        .google
        .as_ref()
        .and_then(|g| g.client_secret_ref.clone())
        .or_else(|| {
            let name = &ctx.config.instance.google.client_secret_name;
            (!name.is_empty()).then(|| NamespacedName {
                namespace: ctx.env.operator_namespace.clone(),
                name: name.clone(),
            })
        });

    if let Some(reference) = reference {
        let secret = get_secret(ctx, &reference).await?;
        return credentials_from_secret(&secret).ok_or_else(|| {
            Error::PreconditionFailed(format!("secret {} holds no credentials file", reference))
        });
    }

    ctx.gsql_credentials.clone().ok_or_else(|| {
        Error::PreconditionFailed(
            "no Cloud SQL client credentials configured".to_string(),
        )
    })
}

/// Contents of the config map describing a Cloud SQL instance
pub async fn gsql_config(ctx: &Context, reference: &NamespacedName) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &reference.namespace);
    let config_map = api
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::PreconditionFailed(format!("config map {} not found", reference)))?;
    config_map
        .data
        .and_then(|mut d| d.remove(CONFIG_KEY))
        .ok_or_else(|| Error::ValidationError(format!("config map {} has no {} key", reference, CONFIG_KEY)))
}

pub async fn build_backend(
    ctx: &Context,
    instance: &DbInstance,
    engine: Engine,
    kind: BackendKind,
) -> Result<Backend> {
    let spec = &instance.spec;
    let missing = || Error::ValidationError(format!("backend {:?} is not configured", kind));
    Ok(match kind {
        BackendKind::Generic => {
            let generic = spec.generic.as_ref().ok_or_else(missing)?;
            Backend::Generic(Generic {
                engine,
                host: generic.host.clone(),
                port: generic.port,
                public_ip: generic.public_ip.clone(),
                tls: tls_mode(instance),
            })
        }
        BackendKind::Google => {
            let google = spec.google.as_ref().ok_or_else(missing)?;
            let config = gsql_config(ctx, &google.config_map_ref).await?;
            let credentials_path = ctx
                .env
                .google_application_credentials
                .as_ref()
                .map(|p| p.to_string_lossy().to_string());
            let api = GsqlApi::discover(google.api_endpoint.as_deref(), credentials_path.as_deref()).await?;
            Backend::Gsql(Gsql {
                name: google.instance.clone(),
                engine,
                config,
                api,
            })
        }
        BackendKind::Percona => {
            let percona = spec.percona.as_ref().ok_or_else(missing)?;
            Backend::Percona(Percona {
                engine,
                servers: percona.servers.clone(),
                tls: tls_mode(instance),
            })
        }
    })
}

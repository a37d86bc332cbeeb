//! Server-side apply of generated objects

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::ProxyStatus;
use crate::resources::proxy::{self, SERVICE_MONITOR_CRD, engine_port};
use crate::resources::{FIELD_MANAGER, ProxyPlan};

/// Apply `obj` in its namespace, taking ownership of the fields it sets
pub async fn apply<K>(client: &Client, obj: &K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let namespace = obj.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Applying object");
    Ok(api
        .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
        .await?)
}

/// Write back an object that may have been read from the server
///
/// Objects carrying a resource version are replaced so a concurrent change
/// fails with a conflict; new objects are created.
pub async fn save<K>(client: &Client, obj: &K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let namespace = obj.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    if obj.meta().resource_version.is_some() {
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    } else {
        Ok(api.create(&PostParams::default(), obj).await?)
    }
}

pub async fn service_monitor_available(client: &Client) -> Result<bool> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    Ok(crds.get_opt(SERVICE_MONITOR_CRD).await?.is_some())
}

/// Apply every object of a proxy plan and report where the proxy listens
pub async fn apply_proxy(client: &Client, plan: &ProxyPlan) -> Result<ProxyStatus> {
    let monitors = plan.monitoring && service_monitor_available(client).await?;
    let resources = proxy::generate(plan, monitors);

    if let Some(config_map) = &resources.config_map {
        apply::<ConfigMap>(client, config_map).await?;
    }
    apply::<Deployment>(client, &resources.deployment).await?;
    let service = apply::<Service>(client, &resources.service).await?;

    if let Some(monitor) = &resources.service_monitor {
        let api: Api<DynamicObject> = Api::namespaced_with(
            client.clone(),
            &plan.namespace,
            &proxy::service_monitor_resource(),
        );
        api.patch(
            &monitor.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(monitor),
        )
        .await?;
    }

    let sql_port = engine_port(&service, plan.engine).ok_or_else(|| {
        Error::PreconditionFailed(format!(
            "service {} has no port named {}",
            plan.resource_name(),
            plan.engine
        ))
    })?;

    Ok(ProxyStatus {
        status: true,
        service_name: plan.resource_name(),
        sql_port,
    })
}

mod database;
mod db_instance;
mod db_user;
mod types;
pub mod v1alpha1;

pub use database::*;
pub use db_instance::*;
pub use db_user::*;
pub use types::*;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, ServiceReference, WebhookClientConfig,
    WebhookConversion,
};
use kube::CustomResourceExt;
use kube::core::crd::{MergeError, merge_crds};

/// Version new objects are stored as
pub const STORAGE_VERSION: &str = "v1beta1";

/// Service the API server reaches the conversion webhook through
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionService {
    pub namespace: String,
    pub name: String,
    pub port: i32,
    pub path: String,
}

impl Default for ConversionService {
    fn default() -> Self {
        Self {
            namespace: "db-operator".to_string(),
            name: "db-operator-webhook".to_string(),
            port: 443,
            path: "/convert".to_string(),
        }
    }
}

impl ConversionService {
    pub fn conversion(&self) -> CustomResourceConversion {
        CustomResourceConversion {
            strategy: "Webhook".to_string(),
            webhook: Some(WebhookConversion {
                client_config: Some(WebhookClientConfig {
                    service: Some(ServiceReference {
                        namespace: self.namespace.clone(),
                        name: self.name.clone(),
                        path: Some(self.path.clone()),
                        port: Some(self.port),
                    }),
                    ..Default::default()
                }),
                conversion_review_versions: vec!["v1".to_string()],
            }),
        }
    }
}

/// CRDs of every kind, with all served versions merged
///
/// Kinds served in more than one version convert through `service`.
pub fn crds(service: &ConversionService) -> Result<Vec<CustomResourceDefinition>, MergeError> {
    let mut database = merge_crds(
        vec![v1alpha1::Database::crd(), Database::crd()],
        STORAGE_VERSION,
    )?;
    let mut instance = merge_crds(
        vec![v1alpha1::DbInstance::crd(), DbInstance::crd()],
        STORAGE_VERSION,
    )?;
    database.spec.conversion = Some(service.conversion());
    instance.spec.conversion = Some(service.conversion());
    Ok(vec![database, instance, DbUser::crd()])
}

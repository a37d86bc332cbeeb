//! Backup cron job for a Database
//!
//! One container per job, picked by engine from the controller config. The
//! container reads the database credentials from the mounted credentials
//! secret and uploads the dump to the instance bucket using the bucket
//! credentials secret.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;

use crate::config::{BackupConfig, ResourceAmounts};
use crate::credentials::SecretKeys;
use crate::crd::Engine;
use crate::resources::common::standard_labels;

/// Secret holding the bucket credentials, expected in the Database namespace
pub const BUCKET_SECRET: &str = "google-cloud-storage-bucket-cred";

const BUCKET_MOUNT: &str = "/srv/gcloud";
const DB_CRED_MOUNT: &str = "/srv/k8s/db-cred";

/// Inputs of the backup cron job of one Database
#[derive(Clone, Debug, PartialEq)]
pub struct BackupPlan {
    pub name: String,
    pub namespace: String,
    pub engine: Engine,
    pub schedule: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub bucket: String,
    /// Credentials secret of the Database
    pub secret_name: String,
    pub push_gateway: String,
    pub owner_references: Option<Vec<OwnerReference>>,
}

impl BackupPlan {
    pub fn resource_name(&self) -> String {
        format!("{}-{}-backup", self.namespace, self.name)
    }
}

fn quantities(amounts: &ResourceAmounts) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if !amounts.cpu.is_empty() {
        map.insert("cpu".to_string(), Quantity(amounts.cpu.clone()));
    }
    if !amounts.memory.is_empty() {
        map.insert("memory".to_string(), Quantity(amounts.memory.clone()));
    }
    (!map.is_empty()).then_some(map)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn backup_env(plan: &BackupPlan) -> Vec<EnvVar> {
    let keys = SecretKeys::for_engine(plan.engine);
    let mut vars = vec![
        env("DB_HOST", plan.host.clone()),
        env("DB_PORT", plan.port.to_string()),
        env("DB_NAME", plan.database.clone()),
        env("DB_USERNAME_FILE", format!("{}/{}", DB_CRED_MOUNT, keys.user)),
        env("DB_PASSWORD_FILE", format!("{}/{}", DB_CRED_MOUNT, keys.password)),
        env("GCS_BUCKET", plan.bucket.clone()),
        env(
            "GOOGLE_APPLICATION_CREDENTIALS",
            format!("{}/credentials.json", BUCKET_MOUNT),
        ),
    ];
    if !plan.push_gateway.is_empty() {
        vars.push(env("PROMETHEUS_PUSH_GATEWAY", plan.push_gateway.clone()));
    }
    vars
}

pub fn generate_cron_job(plan: &BackupPlan, config: &BackupConfig) -> CronJob {
    let labels = standard_labels(&plan.name, "backup");
    let image = match plan.engine {
        Engine::Postgres => config.postgres.image.clone(),
        Engine::Mysql => config.mysql.image.clone(),
    };

    let container = Container {
        name: format!("{}-backup", plan.engine),
        image: Some(image),
        image_pull_policy: Some("Always".to_string()),
        env: Some(backup_env(plan)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "gcloud-secret".to_string(),
                mount_path: BUCKET_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "db-cred".to_string(),
                mount_path: DB_CRED_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: quantities(&config.resource.requests),
            limits: quantities(&config.resource.limits),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "gcloud-secret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(BUCKET_SECRET.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "db-cred".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(plan.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    CronJob {
        metadata: ObjectMeta {
            name: Some(plan.resource_name()),
            namespace: Some(plan.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: plan.owner_references.clone(),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: plan.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    active_deadline_seconds: Some(config.active_deadline_seconds),
                    backoff_limit: Some(config.backoff_limit),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![container],
                            volumes: Some(volumes),
                            restart_policy: Some("Never".to_string()),
                            node_selector: (!config.node_selector.is_empty())
                                .then(|| config.node_selector.clone()),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

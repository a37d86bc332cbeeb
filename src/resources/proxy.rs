//! In-cluster proxy resources
//!
//! Cloud SQL instances are reached through the cloudsql proxy, Percona
//! clusters through ProxySQL. Both run as a two replica Deployment behind a
//! Service whose port is named after the engine. Generic backends have no
//! proxy.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, SecretVolumeSource, SecurityContext,
    Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::core::ObjectMeta;
use serde_json::json;

use crate::backend::percona::PROXYSQL_SQL_PORT;
use crate::crd::Engine;
use crate::resources::common::standard_labels;

pub const DEFAULT_CLOUDSQL_PROXY_IMAGE: &str = "gcr.io/cloud-sql-connectors/cloud-sql-proxy:2.14.1";
pub const DEFAULT_PROXYSQL_IMAGE: &str = "proxysql/proxysql:2.7.1";

pub const PROXY_REPLICAS: i32 = 2;
pub const METRICS_PORT: i32 = 9090;
const PROXYSQL_RESTAPI_PORT: i32 = 6070;

/// Key of the credentials file in the instance access secret
pub const CREDENTIALS_FILE: &str = "credentials.json";
const CREDENTIALS_MOUNT: &str = "/srv/gcloud";
const PROXYSQL_CONFIG_FILE: &str = "proxysql.cnf";

/// CRD that has to exist before ServiceMonitors are created
pub const SERVICE_MONITOR_CRD: &str = "servicemonitors.monitoring.coreos.com";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    CloudSql {
        connection_name: String,
        /// Secret holding `credentials.json`
        credentials_secret: String,
    },
    ProxySql {
        /// Rendered `proxysql.cnf`
        config: String,
    },
}

/// Everything needed to generate the proxy of one Database or DbInstance
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyPlan {
    pub name: String,
    pub namespace: String,
    pub engine: Engine,
    pub kind: ProxyKind,
    pub image: String,
    pub node_selector: BTreeMap<String, String>,
    pub monitoring: bool,
    pub owner_references: Option<Vec<OwnerReference>>,
}

#[derive(Clone, Debug)]
pub struct ProxyResources {
    pub deployment: Deployment,
    pub service: Service,
    pub config_map: Option<ConfigMap>,
    pub service_monitor: Option<DynamicObject>,
}

impl ProxyPlan {
    pub fn resource_name(&self) -> String {
        format!("{}-proxy", self.name)
    }

    /// Port clients use on the proxy service
    pub fn sql_port(&self) -> u16 {
        match self.kind {
            ProxyKind::CloudSql { .. } => self.engine.default_port(),
            ProxyKind::ProxySql { .. } => PROXYSQL_SQL_PORT,
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        standard_labels(&self.name, "proxy")
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.resource_name()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: self.owner_references.clone(),
            ..Default::default()
        }
    }
}

/// Generate all proxy resources of a plan
pub fn generate(plan: &ProxyPlan, service_monitor_available: bool) -> ProxyResources {
    ProxyResources {
        deployment: generate_deployment(plan),
        service: generate_service(plan),
        config_map: generate_config_map(plan),
        service_monitor: (plan.monitoring && service_monitor_available)
            .then(|| generate_service_monitor(plan)),
    }
}

/// Required anti-affinity by host, preferred by zone
fn generate_anti_affinity(labels: &BTreeMap<String, String>) -> Affinity {
    let term = |topology_key: &str| PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        }),
        topology_key: topology_key.to_string(),
        ..Default::default()
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![term(
                "kubernetes.io/hostname",
            )]),
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: term("topology.kubernetes.io/zone"),
                },
            ]),
        }),
        ..Default::default()
    }
}

fn proxy_container(plan: &ProxyPlan) -> Container {
    let port = i32::from(plan.sql_port());
    let mut ports = vec![ContainerPort {
        container_port: port,
        name: Some(plan.engine.as_str().to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];

    let (name, args, volume_mounts) = match &plan.kind {
        ProxyKind::CloudSql {
            connection_name, ..
        } => {
            let mut args = vec![
                "--address=0.0.0.0".to_string(),
                format!("--port={}", port),
                format!("--credentials-file={}/{}", CREDENTIALS_MOUNT, CREDENTIALS_FILE),
            ];
            if plan.monitoring {
                args.push("--prometheus".to_string());
                args.push("--http-address=0.0.0.0".to_string());
                args.push(format!("--http-port={}", METRICS_PORT));
            }
            args.push(connection_name.clone());
            (
                "cloudsql-proxy",
                Some(args),
                vec![VolumeMount {
                    name: "credentials".to_string(),
                    mount_path: CREDENTIALS_MOUNT.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }],
            )
        }
        ProxyKind::ProxySql { .. } => (
            "proxysql",
            None,
            vec![VolumeMount {
                name: "config".to_string(),
                mount_path: format!("/etc/{}", PROXYSQL_CONFIG_FILE),
                sub_path: Some(PROXYSQL_CONFIG_FILE.to_string()),
                read_only: Some(true),
                ..Default::default()
            }],
        ),
    };

    if plan.monitoring {
        let metrics_port = match plan.kind {
            ProxyKind::CloudSql { .. } => METRICS_PORT,
            ProxyKind::ProxySql { .. } => PROXYSQL_RESTAPI_PORT,
        };
        ports.push(ContainerPort {
            container_port: metrics_port,
            name: Some("metrics".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    Container {
        name: name.to_string(),
        image: Some(plan.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args,
        ports: Some(ports),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn generate_deployment(plan: &ProxyPlan) -> Deployment {
    let labels = plan.labels();

    let volume = match &plan.kind {
        ProxyKind::CloudSql {
            credentials_secret, ..
        } => Volume {
            name: "credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(credentials_secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ProxyKind::ProxySql { .. } => Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: plan.resource_name(),
                ..Default::default()
            }),
            ..Default::default()
        },
    };

    Deployment {
        metadata: plan.metadata(),
        spec: Some(DeploymentSpec {
            replicas: Some(PROXY_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![proxy_container(plan)],
                    volumes: Some(vec![volume]),
                    node_selector: (!plan.node_selector.is_empty())
                        .then(|| plan.node_selector.clone()),
                    affinity: Some(generate_anti_affinity(&labels)),
                    termination_grace_period_seconds: Some(10),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service exposing the proxy; the SQL port is named after the engine
pub fn generate_service(plan: &ProxyPlan) -> Service {
    let port = i32::from(plan.sql_port());
    let mut ports = vec![ServicePort {
        name: Some(plan.engine.as_str().to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if plan.monitoring {
        ports.push(ServicePort {
            name: Some("metrics".to_string()),
            port: METRICS_PORT,
            target_port: Some(IntOrString::String("metrics".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    Service {
        metadata: plan.metadata(),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(plan.labels()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn generate_config_map(plan: &ProxyPlan) -> Option<ConfigMap> {
    match &plan.kind {
        ProxyKind::CloudSql { .. } => None,
        ProxyKind::ProxySql { config } => Some(ConfigMap {
            metadata: plan.metadata(),
            data: Some(BTreeMap::from([(
                PROXYSQL_CONFIG_FILE.to_string(),
                config.clone(),
            )])),
            ..Default::default()
        }),
    }
}

pub fn service_monitor_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "monitoring.coreos.com",
        "v1",
        "ServiceMonitor",
    ))
}

pub fn generate_service_monitor(plan: &ProxyPlan) -> DynamicObject {
    let mut monitor = DynamicObject::new(&plan.resource_name(), &service_monitor_resource())
        .within(&plan.namespace);
    monitor.metadata.labels = Some(plan.labels());
    monitor.metadata.owner_references = plan.owner_references.clone();
    monitor.data = json!({
        "spec": {
            "selector": { "matchLabels": plan.labels() },
            "endpoints": [{ "port": "metrics", "path": "/metrics", "interval": "30s" }],
        }
    });
    monitor
}

/// Find the service port named after `engine`
pub fn engine_port(service: &Service, engine: Engine) -> Option<u16> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some(engine.as_str()))
        .and_then(|p| u16::try_from(p.port).ok())
}

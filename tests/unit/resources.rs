//! Unit tests for the proxy, backup, info and instance-access generators

use std::collections::BTreeMap;

use db_operator::backend::percona::PROXYSQL_SQL_PORT;
use db_operator::config::Config;
use db_operator::crd::Engine;
use db_operator::resources::backup::{BUCKET_SECRET, BackupPlan, generate_cron_job};
use db_operator::resources::info::{generate_config_map, merge_info};
use db_operator::resources::instance_access::{credentials_from_secret, generate_secret, secret_name};
use db_operator::resources::proxy::{self, CREDENTIALS_FILE, ProxyKind, ProxyPlan, engine_port};
use db_operator::resources::owner_reference;
use k8s_openapi::api::core::v1::Secret;

use crate::common::*;

fn cloudsql_plan(monitoring: bool) -> ProxyPlan {
    ProxyPlan {
        name: "db1".to_string(),
        namespace: "app".to_string(),
        engine: Engine::Postgres,
        kind: ProxyKind::CloudSql {
            connection_name: "project:region:gsql-pg".to_string(),
            credentials_secret: secret_name("db1"),
        },
        image: proxy::DEFAULT_CLOUDSQL_PROXY_IMAGE.to_string(),
        node_selector: BTreeMap::new(),
        monitoring,
        owner_references: None,
    }
}

fn proxysql_plan() -> ProxyPlan {
    ProxyPlan {
        name: "db1".to_string(),
        namespace: "app".to_string(),
        engine: Engine::Mysql,
        kind: ProxyKind::ProxySql {
            config: "datadir=\"/var/lib/proxysql\"".to_string(),
        },
        image: proxy::DEFAULT_PROXYSQL_IMAGE.to_string(),
        node_selector: BTreeMap::from([("pool".to_string(), "db".to_string())]),
        monitoring: false,
        owner_references: None,
    }
}

#[test]
fn test_cloudsql_proxy_resources() {
    let plan = cloudsql_plan(false);
    let resources = proxy::generate(&plan, true);

    assert_eq!(plan.resource_name(), "db1-proxy");
    assert_eq!(resources.deployment.metadata.name.as_deref(), Some("db1-proxy"));
    assert!(resources.config_map.is_none());
    assert!(resources.service_monitor.is_none());

    let pod = resources.deployment.spec.unwrap().template.spec.unwrap();
    let args = pod.containers[0].args.clone().unwrap();
    assert_eq!(args.last().map(String::as_str), Some("project:region:gsql-pg"));
    assert!(args.iter().any(|a| a.starts_with("--credentials-file=") && a.ends_with(CREDENTIALS_FILE)));

    assert_eq!(engine_port(&resources.service, Engine::Postgres), Some(5432));
    assert_eq!(engine_port(&resources.service, Engine::Mysql), None);
}

#[test]
fn test_service_monitor_needs_crd_and_monitoring() {
    assert!(proxy::generate(&cloudsql_plan(true), true).service_monitor.is_some());
    assert!(proxy::generate(&cloudsql_plan(true), false).service_monitor.is_none());

    let monitored = proxy::generate(&cloudsql_plan(true), false);
    let ports = monitored.service.spec.unwrap().ports.unwrap();
    assert!(ports.iter().any(|p| p.name.as_deref() == Some("metrics")));
}

#[test]
fn test_proxysql_resources() {
    let plan = proxysql_plan();
    assert_eq!(plan.sql_port(), PROXYSQL_SQL_PORT);

    let resources = proxy::generate(&plan, false);
    let config_map = resources.config_map.unwrap();
    assert_eq!(config_map.metadata.name.as_deref(), Some("db1-proxy"));
    assert!(config_map.data.unwrap().values().any(|v| v.contains("proxysql")));

    assert_eq!(
        engine_port(&resources.service, Engine::Mysql),
        Some(PROXYSQL_SQL_PORT)
    );
    let pod = resources.deployment.spec.unwrap().template.spec.unwrap();
    assert_eq!(pod.node_selector.unwrap()["pool"], "db");
}

#[test]
fn test_backup_cron_job() {
    let database = DatabaseBuilder::new("db1", "app", "gen-pg").build();
    let plan = BackupPlan {
        name: "db1".to_string(),
        namespace: "app".to_string(),
        engine: Engine::Postgres,
        schedule: "0 3 * * *".to_string(),
        host: "gen-pg-backup.db.svc".to_string(),
        port: 5432,
        database: "app-db1".to_string(),
        bucket: "backups".to_string(),
        secret_name: "db1-creds".to_string(),
        push_gateway: String::new(),
        owner_references: Some(vec![owner_reference(&database)]),
    };
    let config = Config::default();
    let cron_job = generate_cron_job(&plan, &config.backup);

    assert_eq!(cron_job.metadata.name.as_deref(), Some("app-db1-backup"));
    assert_eq!(cron_job.metadata.owner_references.as_ref().map(Vec::len), Some(1));

    let spec = cron_job.spec.unwrap();
    assert_eq!(spec.schedule, "0 3 * * *");
    let job = spec.job_template.spec.unwrap();
    assert_eq!(job.backoff_limit, Some(config.backup.backoff_limit));

    let pod = job.template.spec.unwrap();
    let container = &pod.containers[0];
    assert_eq!(container.image.as_deref(), Some(config.backup.postgres.image.as_str()));
    let env = container.env.clone().unwrap();
    let var = |name: &str| {
        env.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.clone())
    };
    assert_eq!(var("DB_HOST").as_deref(), Some("gen-pg-backup.db.svc"));
    assert_eq!(var("DB_NAME").as_deref(), Some("app-db1"));
    assert_eq!(var("GCS_BUCKET").as_deref(), Some("backups"));
    assert_eq!(var("PROMETHEUS_PUSH_GATEWAY"), None);

    let volumes = pod.volumes.unwrap();
    let secret_names: Vec<_> = volumes
        .iter()
        .filter_map(|v| v.secret.as_ref().and_then(|s| s.secret_name.clone()))
        .collect();
    assert_eq!(secret_names, vec![BUCKET_SECRET.to_string(), "db1-creds".to_string()]);
}

#[test]
fn test_info_config_map_merge_keeps_foreign_keys() {
    let mut config_map = generate_config_map("db1-creds", "app", None);
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert("APP_SETTING".to_string(), "x".to_string());

    let info = BTreeMap::from([("DB_HOST".to_string(), "gen-pg.db.svc".to_string())]);
    assert!(merge_info(&mut config_map, info.clone()));
    assert!(!merge_info(&mut config_map, info));

    let data = config_map.data.unwrap();
    assert_eq!(data["APP_SETTING"], "x");
    assert_eq!(data["DB_HOST"], "gen-pg.db.svc");
}

#[test]
fn test_instance_access_secret() {
    let source = Secret {
        data: Some(string_data(&[("key.json", "{\"type\":\"service_account\"}")])),
        ..Default::default()
    };
    let credentials = credentials_from_secret(&source).unwrap();
    let secret = generate_secret("db1", "app", credentials.clone(), None);

    assert_eq!(secret.metadata.name.as_deref(), Some("db1-instance-access"));
    assert_eq!(secret.data.unwrap()[CREDENTIALS_FILE], credentials);

    let ambiguous = Secret {
        data: Some(string_data(&[("a", "1"), ("b", "2")])),
        ..Default::default()
    };
    assert!(credentials_from_secret(&ambiguous).is_none());
}

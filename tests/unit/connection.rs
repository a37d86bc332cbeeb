//! Unit tests for endpoint resolution and the TLS policy

use std::collections::BTreeMap;

use db_operator::backend::{INFO_DB_CONN, INFO_DB_PORT};
use db_operator::controller::connection::{endpoint, server_address, tls_mode};
use db_operator::crd::{Engine, PerconaCluster};
use db_operator::database::{Address, TlsMode};
use db_operator::resources::info::{DB_HOST, DB_PORT, SSL_MODE, info_data};

use crate::common::*;

fn server() -> Address {
    Address {
        host: "gen-pg.db.svc".to_string(),
        port: 5432,
    }
}

#[test]
fn test_endpoint_uses_ready_proxy() {
    let database = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_proxy("db1-proxy", 6033, true)
        .build();
    let ep = endpoint(database.ready_proxy(), Engine::Postgres, &server());
    assert_eq!(ep.host, "db1-proxy");
    assert_eq!(ep.port, 6033);
}

#[test]
fn test_endpoint_falls_back_to_server() {
    let database = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_proxy("db1-proxy", 6033, false)
        .build();
    let ep = endpoint(database.ready_proxy(), Engine::Postgres, &server());
    assert_eq!(ep.host, "gen-pg.db.svc");
    assert_eq!(ep.port, 5432);

    let no_status = DatabaseBuilder::new("db1", "app", "gen-pg").build();
    assert_eq!(endpoint(no_status.ready_proxy(), Engine::Postgres, &server()), ep);
}

#[test]
fn test_tls_mode_follows_instance_policy() {
    let plain = DbInstanceBuilder::generic("gen-pg", "postgres").build();
    assert_eq!(tls_mode(&plain), TlsMode::Disabled);

    let verified = DbInstanceBuilder::generic("gen-pg", "postgres")
        .with_ssl(true, false)
        .build();
    assert_eq!(tls_mode(&verified), TlsMode::VerifyCa);

    let unverified = DbInstanceBuilder::generic("gen-pg", "postgres")
        .with_ssl(true, true)
        .build();
    assert_eq!(tls_mode(&unverified), TlsMode::Required);

    // skipVerify alone does not enable TLS
    let skip_only = DbInstanceBuilder::generic("gen-pg", "postgres")
        .with_ssl(false, true)
        .build();
    assert_eq!(tls_mode(&skip_only), TlsMode::Disabled);
}

#[test]
fn test_tls_engine_tokens() {
    assert_eq!(TlsMode::Required.engine_token(Engine::Postgres), "require");
    assert_eq!(TlsMode::Required.engine_token(Engine::Mysql), "required");
    assert_eq!(TlsMode::VerifyCa.engine_token(Engine::Postgres), "verify-ca");
    assert_eq!(TlsMode::VerifyCa.engine_token(Engine::Mysql), "verify_ca");
    assert_eq!(TlsMode::Disabled.engine_token(Engine::Mysql), "disabled");
}

#[test]
fn test_server_address_generic() {
    let instance = DbInstanceBuilder::generic("gen-my", "mysql").build();
    let address = server_address(&instance, Engine::Mysql, "db-operator").unwrap();
    assert_eq!(address.host, "gen-my.db.svc");
    assert_eq!(address.port, 3306);
}

#[test]
fn test_server_address_google_goes_through_instance_proxy() {
    let instance = DbInstanceBuilder::google("gsql-pg", "postgres").build();
    let address = server_address(&instance, Engine::Postgres, "db-operator").unwrap();
    assert_eq!(address.host, "gsql-pg-proxy.db-operator");
    assert_eq!(address.port, 5432);
}

#[test]
fn test_server_address_percona_needs_reported_info() {
    let mut instance = DbInstanceBuilder::generic("pxc", "mysql")
        .without_backend()
        .running()
        .build();
    instance.spec.percona = Some(PerconaCluster::default());
    assert!(server_address(&instance, Engine::Mysql, "db-operator").is_err());

    instance.status.as_mut().unwrap().info = BTreeMap::from([
        (INFO_DB_CONN.to_string(), "pxc-0.db.svc".to_string()),
        (INFO_DB_PORT.to_string(), "3307".to_string()),
    ]);
    let address = server_address(&instance, Engine::Mysql, "db-operator").unwrap();
    assert_eq!(address.host, "pxc-0.db.svc");
    assert_eq!(address.port, 3307);
}

#[test]
fn test_info_data_overrides_instance_address() {
    let instance_info = BTreeMap::from([
        (DB_HOST.to_string(), "10.0.0.5".to_string()),
        ("DB_VERSION".to_string(), "15".to_string()),
    ]);
    let data = info_data(&instance_info, "db1-proxy", 6033, Engine::Mysql, TlsMode::Required);

    assert_eq!(data[DB_HOST], "db1-proxy");
    assert_eq!(data[DB_PORT], "6033");
    assert_eq!(data[SSL_MODE], "required");
    assert_eq!(data["DB_VERSION"], "15");
}

//! Unit tests for credential generation and secret bookkeeping

use db_operator::credentials::{
    self, CredentialsError, DATABASE_ANNOTATION, MYSQL_MAX_USER_LEN, PASSWORD_LENGTH, annotate_database,
    databases_from_annotation, parse_secret,
};
use db_operator::crd::Engine;
use k8s_openapi::api::core::v1::Secret;

use crate::common::*;

#[test]
fn test_generate_postgres_database_credentials() {
    let data = credentials::generate(&meta("db1", "app"), Engine::Postgres, "").unwrap();

    assert_eq!(data["POSTGRES_DB"], bytes("app-db1"));
    assert_eq!(data["POSTGRES_USER"], bytes("app-db1"));
    assert_eq!(data["POSTGRES_PASSWORD"].0.len(), PASSWORD_LENGTH);
    assert_eq!(data.len(), 3);
}

#[test]
fn test_generate_mysql_names_are_sanitised() {
    let data = credentials::generate(&meta("Orders.DB", "shop-team"), Engine::Mysql, "").unwrap();

    assert_eq!(data["DB"], bytes("shop_team_orders_db"));
    assert_eq!(data["USER"], bytes("shop_team_orders_db"));
}

#[test]
fn test_generate_mysql_long_user_is_shortened() {
    let name = "a-very-long-database-name-for-reporting";
    let data = credentials::generate(&meta(name, "analytics"), Engine::Mysql, "").unwrap();

    let user = String::from_utf8(data["USER"].0.clone()).unwrap();
    assert_eq!(user.len(), MYSQL_MAX_USER_LEN);
    let (_, suffix) = user.rsplit_once('_').unwrap();
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

    // The database name limit is larger, so it stays intact
    assert_eq!(
        data["DB"],
        bytes("analytics_a_very_long_database_name_for_reporting")
    );
}

#[test]
fn test_generate_for_dbuser_uses_parent_database() {
    let data = credentials::generate(&meta("reporter", "app"), Engine::Postgres, "app-db1").unwrap();

    assert_eq!(data["POSTGRES_DB"], bytes("app-db1"));
    assert_eq!(data["POSTGRES_USER"], bytes("app-reporter"));
}

#[test]
fn test_generate_requires_namespace() {
    let mut meta = meta("db1", "app");
    meta.namespace = None;
    assert!(matches!(
        credentials::generate(&meta, Engine::Postgres, ""),
        Err(CredentialsError::MissingNamespace)
    ));
}

#[test]
fn test_passwords_differ() {
    let a = credentials::generate(&meta("db1", "app"), Engine::Postgres, "").unwrap();
    let b = credentials::generate(&meta("db1", "app"), Engine::Postgres, "").unwrap();
    assert_ne!(a["POSTGRES_PASSWORD"], b["POSTGRES_PASSWORD"]);
}

#[test]
fn test_parse_secret_reports_missing_key() {
    let mut secret = postgres_secret("db1-creds", "app", "app-db1", "app-db1", "pw");
    secret.data.as_mut().unwrap().remove("POSTGRES_PASSWORD");

    assert!(matches!(
        parse_secret(Engine::Postgres, &secret),
        Err(CredentialsError::MissingKey("POSTGRES_PASSWORD"))
    ));
    assert!(matches!(
        parse_secret(Engine::Postgres, &Secret::default()),
        Err(CredentialsError::EmptySecret)
    ));
}

#[test]
fn test_parse_secret_uses_engine_keys() {
    let secret = postgres_secret("db1-creds", "app", "app-db1", "app-db1", "pw");
    let parsed = parse_secret(Engine::Postgres, &secret).unwrap();
    assert_eq!(parsed.name, "app-db1");
    assert_eq!(parsed.password, "pw");

    // A PostgreSQL secret is missing the MySQL keys
    assert!(parse_secret(Engine::Mysql, &secret).is_err());
}

#[test]
fn test_annotate_database_appends_once() {
    let mut secret = postgres_secret("shared", "app", "app-db1", "app-db1", "pw");

    assert!(annotate_database(&mut secret, "db1"));
    assert!(annotate_database(&mut secret, "db2"));
    assert!(!annotate_database(&mut secret, "db1"));

    let annotation = &secret.metadata.annotations.as_ref().unwrap()[DATABASE_ANNOTATION];
    assert_eq!(annotation, "db1,db2");
}

#[test]
fn test_databases_from_annotation_ignores_blanks() {
    assert_eq!(databases_from_annotation(" db1, ,db2,"), vec!["db1", "db2"]);
    assert!(databases_from_annotation("").is_empty());
}

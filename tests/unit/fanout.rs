//! Unit tests for Database event filtering and secret fan-out

use std::collections::BTreeMap;

use db_operator::controller::checksum::SPEC_ANNOTATION;
use db_operator::controller::{DEPENDENT_USERS_MESSAGE, GenerationFilter, databases_for_secret};
use db_operator::credentials::{DATABASE_ANNOTATION, annotate_database};
use db_operator::crd::{Database, DatabasePhase, DatabaseStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::common::*;

fn database(generation: i64) -> Database {
    let mut db = DatabaseBuilder::new("db1", "app", "gen-pg").build();
    db.metadata.generation = Some(generation);
    db
}

#[test]
fn test_status_updates_do_not_pass() {
    let mut filter = GenerationFilter::default();
    let mut db = database(1);
    assert!(filter.admit(&db));

    db.status = Some(DatabaseStatus {
        phase: DatabasePhase::Ready,
        status: true,
        ..Default::default()
    });
    db.metadata.resource_version = Some("42".to_string());
    assert!(!filter.admit(&db));
}

#[test]
fn test_spec_changes_pass() {
    let mut filter = GenerationFilter::default();
    assert!(filter.admit(&database(1)));
    assert!(filter.admit(&database(2)));
    assert!(!filter.admit(&database(2)));
}

#[test]
fn test_cleared_spec_checksum_passes() {
    let mut filter = GenerationFilter::default();
    let mut db = database(3);
    db.metadata.annotations = Some(BTreeMap::from([(
        SPEC_ANNOTATION.to_string(),
        "abc".to_string(),
    )]));
    assert!(filter.admit(&db));

    // A DbInstance broadcast removes the annotation without a new generation
    db.metadata.annotations = Some(BTreeMap::new());
    assert!(filter.admit(&db));
}

#[test]
fn test_deletion_passes() {
    let mut filter = GenerationFilter::default();
    let mut db = database(1);
    assert!(filter.admit(&db));

    db.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    assert!(filter.admit(&db));
}

#[test]
fn test_databases_are_tracked_separately() {
    let mut filter = GenerationFilter::default();
    let db1 = database(1);
    let mut db2 = database(1);
    db2.metadata.name = Some("db2".to_string());

    assert!(filter.admit(&db1));
    assert!(filter.admit(&db2));
    assert!(!filter.admit(&db1));
}

#[test]
fn test_secret_maps_to_annotated_databases() {
    let mut secret = postgres_secret("shared-creds", "app", "app-db1", "app-db1", "pw");
    assert!(databases_for_secret(&secret).is_empty());

    annotate_database(&mut secret, "db1");
    annotate_database(&mut secret, "db2");
    assert_eq!(
        secret.metadata.annotations.as_ref().unwrap()[DATABASE_ANNOTATION],
        "db1,db2"
    );

    let refs = databases_for_secret(&secret);
    let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["db1", "db2"]);
    assert!(refs.iter().all(|r| r.namespace.as_deref() == Some("app")));
}

#[test]
fn test_secret_without_namespace_maps_nowhere() {
    let mut secret = postgres_secret("shared-creds", "app", "app-db1", "app-db1", "pw");
    annotate_database(&mut secret, "db1");
    secret.metadata.namespace = None;
    assert!(databases_for_secret(&secret).is_empty());
}

#[test]
fn test_dependent_users_message() {
    assert_eq!(
        DEPENDENT_USERS_MESSAGE,
        "database can't be removed, while there are DbUser referencing it"
    );
}

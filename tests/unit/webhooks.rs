//! Unit tests for admission webhook validation
//!
//! These go through the public `admit` entry point the HTTP handlers use,
//! with objects serialized the way the API server sends them.
//!
//! Note: Policy internals are tested in src/webhooks/policies/*.rs

use axum::http::StatusCode;
use db_operator::crd::{Database, DbInstance, DbUser};
use db_operator::webhooks::policies::{validate_database, validate_db_instance, validate_db_user};
use db_operator::webhooks::{AdmissionReview, AdmissionReviewResponse, admit};
use serde::Serialize;
use serde_json::json;

use crate::common::*;

fn review<T: Serialize>(operation: &str, object: &T, old: Option<&T>) -> AdmissionReview {
    serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "uid-1",
            "operation": operation,
            "object": serde_json::to_value(object).unwrap(),
            "oldObject": old.map(|o| serde_json::to_value(o).unwrap()),
        }
    }))
    .unwrap()
}

fn reason(resp: &AdmissionReviewResponse) -> Option<String> {
    resp.response.status.as_ref().and_then(|s| s.reason.clone())
}

fn admit_database(operation: &str, db: &Database, old: Option<&Database>) -> AdmissionReviewResponse {
    let (code, axum::Json(resp)) = admit::<Database>(review(operation, db, old), "Database", validate_database);
    assert_eq!(code, StatusCode::OK);
    assert_eq!(resp.response.uid, "uid-1");
    resp
}

fn admit_instance(operation: &str, i: &DbInstance, old: Option<&DbInstance>) -> AdmissionReviewResponse {
    admit::<DbInstance>(review(operation, i, old), "DbInstance", validate_db_instance).1.0
}

fn admit_user(operation: &str, u: &DbUser, old: Option<&DbUser>) -> AdmissionReviewResponse {
    admit::<DbUser>(review(operation, u, old), "DbUser", validate_db_user).1.0
}

#[test]
fn test_valid_database_is_allowed() {
    let db = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_template("URL", "{{ .Protocol }}://{{ .Hostname }}:{{ .Port }}", true)
        .with_template("WHO", "{{ .Query \"SELECT current_user\" }}", false)
        .build();
    let resp = admit_database("CREATE", &db, None);
    assert!(resp.response.allowed);
    assert!(resp.response.status.is_none());
}

#[test]
fn test_legacy_and_new_templates_conflict() {
    let db = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_legacy_template("DSN", "{{ .UserName }}")
        .with_template("URL", "{{ .Hostname }}", true)
        .build();
    let resp = admit_database("CREATE", &db, None);
    assert!(!resp.response.allowed);
    assert_eq!(reason(&resp).as_deref(), Some("TemplatesConflict"));
}

#[test]
fn test_unknown_template_field_is_denied() {
    let db = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_template("URL", "{{ .Nope }}", true)
        .build();
    assert_eq!(
        reason(&admit_database("CREATE", &db, None)).as_deref(),
        Some("InvalidTemplate")
    );

    let legacy = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_legacy_template("DSN", "{{ .UserName | printf \"%s\" }}")
        .build();
    assert_eq!(
        reason(&admit_database("CREATE", &legacy, None)).as_deref(),
        Some("InvalidTemplate")
    );
}

#[test]
fn test_reserved_template_name_is_denied() {
    let db = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_template("PASSWORD", "{{ .Password }}", true)
        .build();
    assert_eq!(
        reason(&admit_database("CREATE", &db, None)).as_deref(),
        Some("ReservedTemplateName")
    );
}

#[test]
fn test_database_instance_is_immutable() {
    let old = DatabaseBuilder::new("db1", "app", "gen-pg").build();
    let moved = DatabaseBuilder::new("db1", "app", "gen-my").build();
    assert_eq!(
        reason(&admit_database("UPDATE", &moved, Some(&old))).as_deref(),
        Some("InstanceImmutable")
    );

    let same = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_template("URL", "{{ .Host }}", false)
        .build();
    assert!(admit_database("UPDATE", &same, Some(&old)).response.allowed);
}

#[test]
fn test_postgres_template_is_immutable() {
    let old = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_postgres_template("template_postgis")
        .build();
    let changed = DatabaseBuilder::new("db1", "app", "gen-pg").build();
    assert_eq!(
        reason(&admit_database("UPDATE", &changed, Some(&old))).as_deref(),
        Some("PostgresTemplateImmutable")
    );
}

#[test]
fn test_delete_is_always_allowed() {
    let db = DatabaseBuilder::new("db1", "app", "gen-pg")
        .with_template("PASSWORD", "{{ .Nope }}", true)
        .build();
    assert!(admit_database("DELETE", &db, None).response.allowed);
}

#[test]
fn test_instance_needs_engine_and_backend() {
    let valid = DbInstanceBuilder::generic("gen-pg", "postgres").build();
    assert!(admit_instance("CREATE", &valid, None).response.allowed);

    let no_backend = DbInstanceBuilder::generic("gen-pg", "postgres")
        .without_backend()
        .build();
    assert_eq!(
        reason(&admit_instance("CREATE", &no_backend, None)).as_deref(),
        Some("InvalidSpec")
    );

    let oracle = DbInstanceBuilder::generic("gen-ora", "oracle").build();
    assert_eq!(
        reason(&admit_instance("CREATE", &oracle, None)).as_deref(),
        Some("InvalidSpec")
    );
}

#[test]
fn test_instance_engine_is_immutable() {
    let old = DbInstanceBuilder::generic("gen", "postgres").build();
    let new = DbInstanceBuilder::generic("gen", "mysql").build();
    assert!(!admit_instance("UPDATE", &new, Some(&old)).response.allowed);
}

#[test]
fn test_dbuser_access_types() {
    for access in ["readOnly", "readWrite"] {
        let user = dbuser("reporter", "app", "db1", access);
        assert!(admit_user("CREATE", &user, None).response.allowed, "{}", access);
    }
    for access in ["mainUser", "admin", ""] {
        let user = dbuser("reporter", "app", "db1", access);
        assert_eq!(
            reason(&admit_user("CREATE", &user, None)).as_deref(),
            Some("UnsupportedAccessType"),
            "{}",
            access
        );
    }
}

#[test]
fn test_dbuser_database_ref_is_immutable() {
    let old = dbuser("reporter", "app", "db1", "readOnly");
    let new = dbuser("reporter", "app", "db2", "readOnly");
    assert_eq!(
        reason(&admit_user("UPDATE", &new, Some(&old))).as_deref(),
        Some("DatabaseRefImmutable")
    );

    let access_changed = dbuser("reporter", "app", "db1", "readWrite");
    assert!(admit_user("UPDATE", &access_changed, Some(&old)).response.allowed);
}

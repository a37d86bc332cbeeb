//! Unit tests for the reconcile state machines
//!
//! Deletion planning, restarts on change and status transitions are plain
//! functions; server side effects run against the in-memory driver.

use std::collections::BTreeMap;

use db_operator::controller::checksum::{CONFIG_KEY, SPEC_ANNOTATION, SPEC_KEY};
use db_operator::controller::database_reconciler::{
    self, DeletionPlan, drop_database_and_user, plan_deletion,
};
use db_operator::controller::dbuser_reconciler::{failed_status, ready_status, templating_status};
use db_operator::controller::finalizer::{database_finalizer, dbuser_finalizer};
use db_operator::controller::instance_reconciler::{self, next_phase};
use db_operator::controller::{DEPENDENT_USERS_MESSAGE, Error, SecretUpdates, databases_for_secret};
use db_operator::credentials::annotate_database;
use db_operator::crd::{
    Database, DatabasePhase, DatabaseStatus, DbInstanceStatus, DbUserPhase, DbUserStatus, Engine,
    InstancePhase,
};
use db_operator::database::{AccessType, AdminCredentials, DatabaseUser, Driver, DriverCall, Dummy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::watcher::Event;

use crate::common::*;

fn admin() -> AdminCredentials {
    AdminCredentials {
        username: "postgres".to_string(),
        password: "admin".to_string(),
    }
}

fn main_user() -> DatabaseUser {
    DatabaseUser {
        username: "app-db1".to_string(),
        password: "pw".to_string(),
        access_type: AccessType::MainUser,
    }
}

fn deleted_database(finalizers: &[String]) -> Database {
    let mut db = DatabaseBuilder::new("db1", "app", "gen-pg").build();
    db.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    db.metadata.finalizers = Some(finalizers.to_vec());
    db
}

#[test]
fn test_deletion_blocked_by_dbusers() {
    let db = deleted_database(&[database_finalizer("db1"), dbuser_finalizer("reader")]);
    assert_eq!(
        plan_deletion(&db),
        DeletionPlan::Blocked(vec![dbuser_finalizer("reader")])
    );

    let e = Error::DependencyBlocked(DEPENDENT_USERS_MESSAGE.to_string());
    assert!(e.to_string().contains(DEPENDENT_USERS_MESSAGE));
}

#[test]
fn test_blocked_deletion_ignores_protection() {
    let mut db = deleted_database(&[database_finalizer("db1"), dbuser_finalizer("reader")]);
    db.spec.deletion_protected = true;
    assert!(matches!(plan_deletion(&db), DeletionPlan::Blocked(_)));
}

#[test]
fn test_deletion_protected_keeps_server_objects() {
    let mut db = deleted_database(&[database_finalizer("db1")]);
    db.spec.deletion_protected = true;
    assert_eq!(plan_deletion(&db), DeletionPlan::KeepOnServer);

    db.spec.deletion_protected = false;
    assert_eq!(plan_deletion(&db), DeletionPlan::Drop);
}

#[test]
fn test_deletion_without_finalizer_is_done() {
    assert_eq!(plan_deletion(&deleted_database(&[])), DeletionPlan::NothingToDo);
    // finalizers of other controllers are left alone
    let db = deleted_database(&["example.com/other".to_string()]);
    assert_eq!(plan_deletion(&db), DeletionPlan::NothingToDo);
}

#[tokio::test]
async fn test_drop_database_then_user() {
    let dummy = Dummy::new(Engine::Postgres, "app-db1", "pg", 5432);
    let driver = Driver::Dummy(dummy.clone());

    drop_database_and_user(&driver, &admin(), &main_user()).await.unwrap();
    assert_eq!(
        dummy.calls(),
        vec![
            DriverCall::DeleteDatabase {
                database: "app-db1".to_string()
            },
            DriverCall::DeleteUser {
                username: "app-db1".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_user_owning_objects_is_left_in_place() {
    let dummy = Dummy::new(Engine::Postgres, "app-db1", "pg", 5432).owning_objects();
    let driver = Driver::Dummy(dummy.clone());

    drop_database_and_user(&driver, &admin(), &main_user()).await.unwrap();
    assert_eq!(dummy.calls().len(), 2);
}

#[tokio::test]
async fn test_failed_drop_keeps_the_user() {
    let dummy = Dummy::new(Engine::Mysql, "app_db1", "my", 3306).failing_on("delete_database");
    let driver = Driver::Dummy(dummy.clone());

    let err = drop_database_and_user(&driver, &admin(), &main_user()).await.unwrap_err();
    assert!(!err.is_dependent_objects());
    assert_eq!(
        dummy.calls(),
        vec![DriverCall::DeleteDatabase {
            database: "app_db1".to_string()
        }]
    );
}

#[test]
fn test_database_change_starts_over() {
    let status = DatabaseStatus {
        phase: DatabasePhase::Ready,
        status: true,
        database: "app-db1".to_string(),
        user: "app-db1".to_string(),
        ..Default::default()
    };
    assert!(database_reconciler::restart_on_change(&status, &BTreeMap::new()).is_none());

    let changed = BTreeMap::from([(SPEC_ANNOTATION.to_string(), "new".to_string())]);
    let restarted = database_reconciler::restart_on_change(&status, &changed).unwrap();
    assert_eq!(restarted.phase, DatabasePhase::Creating);
    assert!(!restarted.status);
    assert_eq!(restarted.database, "app-db1");
}

#[test]
fn test_dbuser_lifecycle() {
    let fresh = DbUserStatus::default();
    let templating = templating_status(&fresh, "app-db1").unwrap();
    assert_eq!(templating.phase, DbUserPhase::SecretsTemplating);
    assert!(templating.created);
    assert!(!templating.status);

    let ready = ready_status("app-db1");
    assert_eq!(ready.phase, DbUserPhase::Ready);
    assert!(ready.status);

    // a ready user writes no status on the next reconcile
    assert!(templating_status(&ready, "app-db1").is_none());
    assert_eq!(ready_status("app-db1"), ready);

    // the parent database was recreated under another name
    let moved = templating_status(&ready, "app-db2").unwrap();
    assert_eq!(moved.database_name, "app-db2");

    let failed = failed_status(&templating);
    assert_eq!(failed.phase, DbUserPhase::SecretsTemplating);
    assert!(!failed.status);
    assert_eq!(failed_status(&failed), failed);
}

#[tokio::test]
async fn test_dbuser_calls_against_the_driver() {
    let dummy = Dummy::new(Engine::Postgres, "app-db1", "pg", 5432);
    let driver = Driver::Dummy(dummy.clone());
    let reader = DatabaseUser {
        username: "app-reader".to_string(),
        password: "pw".to_string(),
        access_type: AccessType::ReadOnly,
    };

    driver.create_or_update_user(&admin(), &reader).await.unwrap();
    let rotated = DatabaseUser {
        password: "rotated".to_string(),
        ..reader.clone()
    };
    driver.create_or_update_user(&admin(), &rotated).await.unwrap();
    driver.delete_user(&admin(), &reader).await.unwrap();

    let calls = dummy.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(
        calls[1],
        DriverCall::CreateOrUpdateUser {
            username: "app-reader".to_string(),
            password: "rotated".to_string(),
            access_type: AccessType::ReadOnly,
        }
    );
    assert_eq!(
        calls[2],
        DriverCall::DeleteUser {
            username: "app-reader".to_string()
        }
    );
}

#[test]
fn test_secret_update_fans_out_to_databases() {
    let mut secret = postgres_secret("shared-creds", "app", "app-db1", "app-db1", "pw");
    annotate_database(&mut secret, "db1");
    annotate_database(&mut secret, "db2");

    let mut updates = SecretUpdates::default();
    // creation
    assert!(updates.filter_event(Event::Apply(secret.clone())).is_none());
    // password rotation
    let updated = updates.filter_event(Event::Apply(secret.clone())).unwrap();
    let names: Vec<_> = databases_for_secret(&updated)
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["db1", "db2"]);

    let plain = postgres_secret("other", "app", "x", "x", "pw");
    assert!(updates.filter_event(Event::Apply(plain.clone())).is_none());
    assert!(updates.filter_event(Event::Apply(plain)).is_none());
}

#[test]
fn test_instance_phases_end_at_running() {
    let mut phase = InstancePhase::Validating;
    let mut visited = vec![phase];
    while phase != InstancePhase::Running {
        phase = next_phase(phase);
        visited.push(phase);
    }
    assert_eq!(
        visited,
        vec![
            InstancePhase::Validating,
            InstancePhase::Creating,
            InstancePhase::Broadcasting,
            InstancePhase::ProxyCreating,
            InstancePhase::Running,
        ]
    );
    assert_eq!(next_phase(InstancePhase::Running), InstancePhase::Running);
}

#[test]
fn test_instance_change_starts_over() {
    let checksums = BTreeMap::from([(SPEC_KEY.to_string(), "a".to_string())]);
    let status = DbInstanceStatus {
        phase: InstancePhase::Running,
        status: true,
        info: BTreeMap::from([("DB_CONN".to_string(), "pg".to_string())]),
        checksums: checksums.clone(),
    };
    assert!(instance_reconciler::restart_on_change(&status, checksums).is_none());

    let moved = BTreeMap::from([
        (SPEC_KEY.to_string(), "b".to_string()),
        (CONFIG_KEY.to_string(), "c".to_string()),
    ]);
    let restarted = instance_reconciler::restart_on_change(&status, moved.clone()).unwrap();
    assert_eq!(restarted.phase, InstancePhase::Validating);
    assert!(!restarted.status);
    assert_eq!(restarted.checksums, moved);
    assert_eq!(restarted.info, status.info);
}

//! In-memory driver
//!
//! Records every call and answers queries from a fixed table. Used to
//! exercise reconcile and template logic without a database server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{AccessType, Address, AdminCredentials, DatabaseUser, DriverError, Result};
use crate::crd::Engine;

/// A call received by the dummy driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    CreateDatabase {
        database: String,
    },
    CreateOrUpdateUser {
        username: String,
        password: String,
        access_type: AccessType,
    },
    DeleteUser {
        username: String,
    },
    DeleteDatabase {
        database: String,
    },
    CheckStatus {
        username: String,
    },
    Query {
        query: String,
        username: String,
    },
}

#[derive(Clone, Debug)]
pub struct Dummy {
    pub engine: Engine,
    pub database: String,
    pub address: Address,
    /// Canned answers for `query_as_user`, keyed by statement
    pub query_results: BTreeMap<String, String>,
    /// Operation name that fails with an injected error
    pub fail_on: Option<&'static str>,
    /// `delete_user` reports objects still owned by the user
    pub owns_objects: bool,
    calls: Arc<Mutex<Vec<DriverCall>>>,
}

impl Dummy {
    pub fn new(engine: Engine, database: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            engine,
            database: database.into(),
            address: Address {
                host: host.into(),
                port,
            },
            query_results: BTreeMap::new(),
            fail_on: None,
            owns_objects: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_query_result(mut self, query: impl Into<String>, result: impl Into<String>) -> Self {
        self.query_results.insert(query.into(), result.into());
        self
    }

    pub fn failing_on(mut self, operation: &'static str) -> Self {
        self.fail_on = Some(operation);
        self
    }

    pub fn owning_objects(mut self) -> Self {
        self.owns_objects = true;
        self
    }

    /// Calls received so far, shared between clones
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, operation: &'static str, call: DriverCall) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if self.fail_on == Some(operation) {
            return Err(DriverError::Injected(format!("{} failed", operation)));
        }
        Ok(())
    }

    pub fn create_database(&self, _admin: &AdminCredentials) -> Result<()> {
        self.record(
            "create_database",
            DriverCall::CreateDatabase {
                database: self.database.clone(),
            },
        )
    }

    pub fn create_or_update_user(&self, _admin: &AdminCredentials, user: &DatabaseUser) -> Result<()> {
        self.record(
            "create_or_update_user",
            DriverCall::CreateOrUpdateUser {
                username: user.username.clone(),
                password: user.password.clone(),
                access_type: user.access_type,
            },
        )
    }

    pub fn delete_user(&self, _admin: &AdminCredentials, user: &DatabaseUser) -> Result<()> {
        self.record(
            "delete_user",
            DriverCall::DeleteUser {
                username: user.username.clone(),
            },
        )?;
        if self.owns_objects {
            return Err(DriverError::DependentObjects(user.username.clone()));
        }
        Ok(())
    }

    pub fn delete_database(&self, _admin: &AdminCredentials) -> Result<()> {
        self.record(
            "delete_database",
            DriverCall::DeleteDatabase {
                database: self.database.clone(),
            },
        )
    }

    pub fn check_status(&self, user: &DatabaseUser) -> Result<()> {
        self.record(
            "check_status",
            DriverCall::CheckStatus {
                username: user.username.clone(),
            },
        )
    }

    pub fn query_as_user(&self, query: &str, user: &DatabaseUser) -> Result<String> {
        self.record(
            "query_as_user",
            DriverCall::Query {
                query: query.to_string(),
                username: user.username.clone(),
            },
        )?;
        self.query_results
            .get(query)
            .cloned()
            .ok_or(DriverError::EmptyResult)
    }
}

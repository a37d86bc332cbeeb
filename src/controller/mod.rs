pub mod apply;
pub mod checksum;
pub mod connection;
pub mod context;
pub mod database_reconciler;
pub mod dbuser_reconciler;
pub mod error;
pub mod events;
pub mod fanout;
pub mod finalizer;
pub mod instance_reconciler;

pub use context::Context;
pub use database_reconciler::{DEPENDENT_USERS_MESSAGE, database_error_policy, reconcile_database};
pub use dbuser_reconciler::{dbuser_error_policy, reconcile_dbuser};
pub use error::{BackoffConfig, Error, Requeue, Result};
pub use fanout::{GenerationFilter, SecretUpdates, databases_for_secret};
pub use instance_reconciler::{instance_error_policy, reconcile_instance};

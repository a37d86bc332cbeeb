//! Generators for the objects the operator creates next to its resources

pub mod backup;
pub mod common;
pub mod info;
pub mod instance_access;
pub mod proxy;

pub use common::{FIELD_MANAGER, owner_reference, owner_references_if, standard_labels};
pub use proxy::{ProxyKind, ProxyPlan, ProxyResources};

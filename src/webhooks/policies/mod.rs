//! Admission webhook policies
//!
//! One module per kind; each exports a `validate` function taking the new
//! object and, on UPDATE, the old one.

pub mod database;
pub mod db_instance;
pub mod db_user;

pub use database::validate_database;
pub use db_instance::validate_db_instance;
pub use db_user::validate_db_user;

/// Result of a policy validation
#[derive(Debug, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// First denial of `results`, or allowed
pub fn first_denial(results: impl IntoIterator<Item = ValidationResult>) -> ValidationResult {
    results
        .into_iter()
        .find(|r| !r.allowed)
        .unwrap_or_else(ValidationResult::allowed)
}

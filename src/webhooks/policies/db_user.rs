//! DbUser policies

use crate::credentials::BLOCKED_KEYS;
use crate::crd::DbUser;
use crate::database::AccessType;
use crate::templates::validate_template;

use super::ValidationResult;

pub fn validate_db_user(user: &DbUser, old: Option<&DbUser>) -> ValidationResult {
    if let Err(e) = user.spec.access_type.parse::<AccessType>() {
        return ValidationResult::denied("UnsupportedAccessType", &e.to_string());
    }
    if let Some(old) = old
        && old.spec.database_ref != user.spec.database_ref
    {
        return ValidationResult::denied("DatabaseRefImmutable", "databaseRef cannot be changed");
    }
    for template in &user.spec.templates {
        if BLOCKED_KEYS.contains(&template.name.as_str()) {
            return ValidationResult::denied(
                "ReservedTemplateName",
                &format!("template name {} is reserved for credentials", template.name),
            );
        }
        if let Err(e) = validate_template(&template.name, &template.template) {
            return ValidationResult::denied(
                "InvalidTemplate",
                &format!("templates.{}: {}", template.name, e),
            );
        }
    }
    ValidationResult::allowed()
}

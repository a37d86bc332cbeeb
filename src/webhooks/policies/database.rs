//! Database policies
//!
//! - `secretsTemplates` and `templates` are mutually exclusive
//! - template bodies must parse and only use known fields and functions
//! - template names may not shadow credential keys
//! - `instance` and `postgres.template` cannot change after creation

use crate::credentials::BLOCKED_KEYS;
use crate::crd::Database;
use crate::templates::{validate_legacy_template, validate_template};

use super::{ValidationResult, first_denial};

pub fn validate_database(database: &Database, old: Option<&Database>) -> ValidationResult {
    first_denial([
        validate_exclusive_templates(database),
        validate_templates(database),
        validate_immutable(database, old),
    ])
}

fn validate_exclusive_templates(database: &Database) -> ValidationResult {
    let legacy = database
        .spec
        .secrets_templates
        .as_ref()
        .is_some_and(|t| !t.is_empty());
    if legacy && !database.spec.templates.is_empty() {
        return ValidationResult::denied(
            "TemplatesConflict",
            "secretsTemplates and templates can't be combined, use only templates",
        );
    }
    ValidationResult::allowed()
}

fn validate_templates(database: &Database) -> ValidationResult {
    for (name, body) in database.spec.secrets_templates.iter().flatten() {
        if let Err(e) = validate_legacy_template(name, body) {
            return ValidationResult::denied("InvalidTemplate", &format!("secretsTemplates.{}: {}", name, e));
        }
    }
    for template in &database.spec.templates {
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

fn validate_immutable(database: &Database, old: Option<&Database>) -> ValidationResult {
    let Some(old) = old else {
        return ValidationResult::allowed();
    };
    if old.spec.instance != database.spec.instance {
        return ValidationResult::denied(
            "InstanceImmutable",
            &format!(
                "instance cannot be changed, it was {} and is now {}",
                old.spec.instance, database.spec.instance
            ),
        );
    }
    let template = |d: &Database| d.spec.postgres.as_ref().and_then(|p| p.template.clone());
    if template(old) != template(database) {
        return ValidationResult::denied(
            "PostgresTemplateImmutable",
            "postgres.template cannot be changed after the database is created",
        );
    }
    ValidationResult::allowed()
}

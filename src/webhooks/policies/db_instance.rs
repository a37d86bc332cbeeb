//! DbInstance policies
//!
//! - the engine must be supported and cannot change
//! - exactly one backend block is set

use crate::crd::DbInstance;

use super::ValidationResult;

pub fn validate_db_instance(instance: &DbInstance, old: Option<&DbInstance>) -> ValidationResult {
    if let Err(e) = instance.spec.validate() {
        return ValidationResult::denied("InvalidSpec", &e.to_string());
    }
    if let Some(old) = old
        && old.spec.engine != instance.spec.engine
    {
        return ValidationResult::denied(
            "EngineImmutable",
            &format!(
                "engine cannot be changed, it was {} and is now {}",
                old.spec.engine, instance.spec.engine
            ),
        );
    }
    ValidationResult::allowed()
}

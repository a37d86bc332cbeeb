//! Admission webhooks for Database, DbInstance and DbUser validation
//!
//! Objects are checked before they are persisted: template syntax,
//! supported engines and access types, and fields that cannot change once
//! the operator acted on them. The same server converts Database and
//! DbInstance objects between `v1alpha1` and `v1beta1`.

pub mod conversion;
pub mod policies;
mod server;

pub use policies::ValidationResult;
pub use server::{
    AdmissionReview, AdmissionReviewResponse, CONVERSION_PATH, WEBHOOK_CERT_DIR, WEBHOOK_PORT, WebhookError,
    admit, create_webhook_router, run_webhook_server,
};

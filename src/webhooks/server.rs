//! Webhook HTTP server handlers
//!
//! Implements the ValidatingAdmissionWebhook HTTP endpoints for Database,
//! DbInstance and DbUser resources, and the CRD conversion endpoint.

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info, warn};

use super::conversion::{ConversionReview, convert};
use super::policies::{ValidationResult, validate_database, validate_db_instance, validate_db_user};
use crate::crd::{Database, DbInstance, DbUser};

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub object: Option<serde_json::Value>,
    pub old_object: Option<serde_json::Value>,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Create the webhook router
pub fn create_webhook_router() -> Router {
    Router::new()
        .route("/validate-database", post(validate_database_review))
        .route("/validate-dbinstance", post(validate_db_instance_review))
        .route("/validate-dbuser", post(validate_db_user_review))
        .route(CONVERSION_PATH, post(convert_review))
}

/// Path the API server posts ConversionReviews to
pub const CONVERSION_PATH: &str = "/convert";

async fn convert_review(Json(review): Json<ConversionReview>) -> impl IntoResponse {
    convert(review)
}

async fn validate_database_review(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    admit::<Database>(review, "Database", validate_database)
}

async fn validate_db_instance_review(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    admit::<DbInstance>(review, "DbInstance", validate_db_instance)
}

async fn validate_db_user_review(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    admit::<DbUser>(review, "DbUser", validate_db_user)
}

/// Decode the objects of a review and run `policy` over them
pub fn admit<K: DeserializeOwned>(
    review: AdmissionReview,
    kind: &str,
    policy: fn(&K, Option<&K>) -> ValidationResult,
) -> (StatusCode, Json<AdmissionReviewResponse>) {
    let Some(request) = review.request else {
        error!("Admission review missing request");
        return (
            StatusCode::BAD_REQUEST,
            Json(create_response("", false, "Missing request in AdmissionReview", None)),
        );
    };

    let uid = request.uid.clone();
    info!(
        uid = %uid,
        kind = %kind,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    if request.operation == "DELETE" {
        return (StatusCode::OK, Json(create_response(&uid, true, "", None)));
    }

    let object: K = match request.object.map(serde_json::from_value) {
        Some(Ok(obj)) => obj,
        Some(Err(e)) => {
            error!(error = %e, kind = %kind, "Failed to parse object");
            return (
                StatusCode::OK,
                Json(create_response(&uid, false, &format!("Failed to parse object: {}", e), None)),
            );
        }
        None => {
            return (
                StatusCode::OK,
                Json(create_response(&uid, false, "Missing object in request", None)),
            );
        }
    };

    let old: Option<K> = match request.old_object.map(serde_json::from_value) {
        Some(Ok(obj)) => Some(obj),
        Some(Err(e)) => {
            warn!(error = %e, kind = %kind, "Failed to parse old object, treating as CREATE");
            None
        }
        None => None,
    };

    let result = policy(&object, old.as_ref());
    if !result.allowed {
        let reason = result.reason.unwrap_or_else(|| "ValidationFailed".to_string());
        let message = result.message.unwrap_or_else(|| "Validation failed".to_string());
        warn!(uid = %uid, reason = %reason, message = %message, "Admission request denied");
        return (
            StatusCode::OK,
            Json(create_response(&uid, false, &message, Some(&reason))),
        );
    }

    info!(uid = %uid, "Admission request allowed");
    (StatusCode::OK, Json(create_response(&uid, true, "", None)))
}

/// Create an AdmissionReview response
fn create_response(
    uid: &str,
    allowed: bool,
    message: &str,
    reason: Option<&str>,
) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: 403,
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
        },
    }
}

/// Default directory holding `tls.crt` and `tls.key`
pub const WEBHOOK_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:9443. The certificate and key are read from
/// `tls.crt` and `tls.key` in `cert_dir`.
pub async fn run_webhook_server(cert_dir: &Path) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;

    let app = create_webhook_router();

    let config = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}

//! CRD conversion webhook
//!
//! The API server stores Database and DbInstance as `v1beta1` and calls
//! `/convert` whenever a client reads or writes them as `v1alpha1`.

use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::crd::v1alpha1::{self, PRESERVED_SPEC_ANNOTATION};
use crate::crd::{DatabaseSpec, DbInstanceSpec};

pub const V1ALPHA1: &str = "kinda.rocks/v1alpha1";
pub const V1BETA1: &str = "kinda.rocks/v1beta1";

/// Kubernetes ConversionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<ConversionRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// ConversionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: ConversionResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub uid: String,
    pub converted_objects: Vec<Value>,
    pub result: ConversionResult,
}

#[derive(Debug, Serialize)]
pub struct ConversionResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("object has no {0}")]
    MissingField(&'static str),
    #[error("cannot convert {kind} from {from} to {to}")]
    Unsupported { kind: String, from: String, to: String },
    #[error("malformed {kind} spec: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },
}

type Result<T, E = ConversionError> = std::result::Result<T, E>;

fn str_field(object: &Value, field: &'static str) -> Result<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or(ConversionError::MissingField(field))
}

fn annotations_mut(object: &mut Value) -> Option<&mut Map<String, Value>> {
    let metadata = object.as_object_mut()?.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
    let annotations = metadata
        .as_object_mut()?
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    annotations.as_object_mut()
}

fn take_preserved(object: &mut Value) -> Option<String> {
    let annotations = annotations_mut(object)?;
    let preserved = annotations.remove(PRESERVED_SPEC_ANNOTATION);
    if annotations.is_empty()
        && let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut)
    {
        metadata.remove("annotations");
    }
    preserved.and_then(|v| v.as_str().map(String::from))
}

fn set_preserved(object: &mut Value, spec: String) {
    if let Some(annotations) = annotations_mut(object) {
        annotations.insert(PRESERVED_SPEC_ANNOTATION.to_string(), Value::String(spec));
    }
}

fn parse<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| ConversionError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

fn encode<T: Serialize>(kind: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|source| ConversionError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

/// A preserved spec that fails to parse is dropped
fn preserved_spec<T: serde::de::DeserializeOwned>(kind: &str, preserved: Option<String>) -> Option<T> {
    let preserved = preserved?;
    match serde_json::from_str(&preserved) {
        Ok(spec) => Some(spec),
        Err(e) => {
            warn!(kind = %kind, error = %e, "Ignoring unreadable preserved spec");
            None
        }
    }
}

/// Convert one object to `desired` API version
///
/// Status is copied as is. Objects already at `desired` are returned unchanged.
pub fn convert_object(mut object: Value, desired: &str) -> Result<Value> {
    let from = str_field(&object, "apiVersion")?;
    if from == desired {
        return Ok(object);
    }
    let kind = str_field(&object, "kind")?;
    let spec = object.get("spec").cloned().unwrap_or_else(|| Value::Object(Map::new()));

    let spec = match (kind.as_str(), from.as_str(), desired) {
        ("Database", V1ALPHA1, V1BETA1) => {
            let preserved = take_preserved(&mut object);
            let mut new = DatabaseSpec::from(parse::<v1alpha1::DatabaseSpec>(&kind, spec)?);
            if let Some(preserved) = preserved_spec(&kind, preserved) {
                v1alpha1::restore_database(&mut new, &preserved);
            }
            encode(&kind, &new)?
        }
        ("Database", V1BETA1, V1ALPHA1) => {
            let new: DatabaseSpec = parse(&kind, spec)?;
            set_preserved(&mut object, encode(&kind, &new)?.to_string());
            encode(&kind, &v1alpha1::DatabaseSpec::from(new))?
        }
        ("DbInstance", V1ALPHA1, V1BETA1) => {
            let preserved = take_preserved(&mut object);
            let mut new = DbInstanceSpec::from(parse::<v1alpha1::DbInstanceSpec>(&kind, spec)?);
            if let Some(preserved) = preserved_spec(&kind, preserved) {
                v1alpha1::restore_db_instance(&mut new, &preserved);
            }
            encode(&kind, &new)?
        }
        ("DbInstance", V1BETA1, V1ALPHA1) => {
            let new: DbInstanceSpec = parse(&kind, spec)?;
            set_preserved(&mut object, encode(&kind, &new)?.to_string());
            encode(&kind, &v1alpha1::DbInstanceSpec::from(new))?
        }
        _ => {
            return Err(ConversionError::Unsupported {
                kind,
                from,
                to: desired.to_string(),
            });
        }
    };

    if let Some(fields) = object.as_object_mut() {
        fields.insert("apiVersion".to_string(), Value::String(desired.to_string()));
        fields.insert("spec".to_string(), spec);
    }
    debug!(kind = %kind, from = %from, to = %desired, "Converted object");
    Ok(object)
}

/// Convert every object of a review; one failure fails the whole review
pub fn convert(review: ConversionReview) -> (StatusCode, Json<ConversionReviewResponse>) {
    let Some(request) = review.request else {
        error!("Conversion review missing request");
        return (
            StatusCode::BAD_REQUEST,
            Json(create_response("", Vec::new(), Some("Missing request in ConversionReview"))),
        );
    };

    info!(
        uid = %request.uid,
        desired = %request.desired_api_version,
        objects = request.objects.len(),
        "Processing conversion request"
    );

    let converted: Result<Vec<Value>> = request
        .objects
        .into_iter()
        .map(|object| convert_object(object, &request.desired_api_version))
        .collect();
    match converted {
        Ok(objects) => (StatusCode::OK, Json(create_response(&request.uid, objects, None))),
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Conversion failed");
            (
                StatusCode::OK,
                Json(create_response(&request.uid, Vec::new(), Some(&e.to_string()))),
            )
        }
    }
}

fn create_response(uid: &str, objects: Vec<Value>, failure: Option<&str>) -> ConversionReviewResponse {
    ConversionReviewResponse {
        api_version: "apiextensions.k8s.io/v1".to_string(),
        kind: "ConversionReview".to_string(),
        response: ConversionResponse {
            uid: uid.to_string(),
            converted_objects: objects,
            result: ConversionResult {
                status: (if failure.is_some() { "Failure" } else { "Success" }).to_string(),
                message: failure.map(String::from),
            },
        },
    }
}

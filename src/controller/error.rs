//! Error types shared by the reconcilers

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::credentials::CredentialsError;
use crate::database::DriverError;
use crate::templates::TemplateError;

/// Delay used for failures the operator retries at a fixed pace
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Reconcile failures, classified by `is_retryable` and `retry_delay`
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    DependencyBlocked(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),

    #[error("Database error: {0}")]
    DriverError(#[from] DriverError),

    #[error("Backend error: {0}")]
    BackendError(#[from] BackendError),

    #[error("Template error: {0}")]
    TemplateError(#[from] TemplateError),

    #[error("Credentials error: {0}")]
    CredentialsError(#[from] CredentialsError),
}

/// What the controller does after a failed reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the user to edit the object
    Never,
    /// Try again after a fixed delay
    After(Duration),
    /// Hand the error to the framework's exponential backoff
    Backoff,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.requeue() != Requeue::Never
    }

    pub fn requeue(&self) -> Requeue {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    // 4xx errors other than 409 Conflict and 429 TooManyRequests need a change
                    if (400..500).contains(&code) && code != 409 && code != 429 {
                        Requeue::After(RETRY_DELAY)
                    } else {
                        Requeue::Backoff
                    }
                }
                _ => Requeue::Backoff,
            },
            Error::SerializationError(_) | Error::MissingObjectKey(_) => Requeue::Backoff,
            Error::ValidationError(_) | Error::PermanentError(_) => Requeue::Never,
            Error::TemplateError(e) if e.is_authoring() => Requeue::Never,
            Error::PreconditionFailed(_)
            | Error::DependencyBlocked(_)
            | Error::DriverError(_)
            | Error::BackendError(_)
            | Error::TemplateError(_)
            | Error::CredentialsError(_) => Requeue::After(RETRY_DELAY),
        }
    }

    /// Whether the error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_delay)
    }
}

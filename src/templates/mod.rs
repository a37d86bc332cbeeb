//! Credential templates
//!
//! A small evaluator for the Go `text/template` dialect users write in
//! `templates` and `secretsTemplates`. Templates only see the typed data
//! source they are executed against; there is no environment or
//! filesystem access.

mod exec;
mod lex;
mod parse;
mod render;
mod source;
mod validate;

pub use exec::{BUILTINS, DataSource, MapSource, Value};
pub use parse::Tree;
pub use render::{
    Carriers, DEFAULT_TEMPLATE, DEFAULT_TEMPLATE_NAME, TEMPLATED_KEYS_ANNOTATION, TemplateSet,
    collect_queries, prepare_queries, render, render_carriers, templated_keys,
};
pub use source::{DatabaseSource, Endpoint, FIELDS, LEGACY_FIELDS, LegacySource, METHODS};
pub use validate::{validate_legacy_template, validate_template};

use thiserror::Error;

use crate::credentials::CredentialsError;
use crate::database::DriverError;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template: {name}:{line}: {message}")]
    Parse {
        name: String,
        line: usize,
        message: String,
    },

    #[error("template: {name}:{line}: executing: {message}")]
    Exec {
        name: String,
        line: usize,
        message: String,
    },

    #[error("{0} is a reserved credential key and can't be templated")]
    BlockedKey(String),

    #[error("{key} already exists in the {carrier} and is not managed by the operator")]
    KeyExists { key: String, carrier: &'static str },

    #[error("query {query:?} failed: {source}")]
    Query {
        query: String,
        #[source]
        source: DriverError,
    },

    #[error("credentials are not readable: {0}")]
    Credentials(#[from] CredentialsError),
}

impl TemplateError {
    /// Errors the user has to fix by editing the templates
    pub fn is_authoring(&self) -> bool {
        !matches!(self, TemplateError::Query { .. } | TemplateError::Credentials(_))
    }
}

//! Credential secrets
//!
//! Every Database and DbUser owns a secret carrying the database name, the
//! user name and the password under engine specific keys. Names derive from
//! `<namespace>-<name>` and are shortened to what the engine accepts.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crd::Engine;

/// Secret annotation listing the Databases that use a secret
pub const DATABASE_ANNOTATION: &str = "db-operator/database";

pub const POSTGRES_KEYS: SecretKeys = SecretKeys {
    database: "POSTGRES_DB",
    user: "POSTGRES_USER",
    password: "POSTGRES_PASSWORD",
};

pub const MYSQL_KEYS: SecretKeys = SecretKeys {
    database: "DB",
    user: "USER",
    password: "PASSWORD",
};

/// Credential keys of both engines; templates may never write them
pub const BLOCKED_KEYS: [&str; 6] = [
    "POSTGRES_DB",
    "POSTGRES_USER",
    "POSTGRES_PASSWORD",
    "DB",
    "USER",
    "PASSWORD",
];

pub const PASSWORD_LENGTH: usize = 20;
const PASSWORD_LETTERS: usize = 10;
const PASSWORD_DIGITS: usize = 8;
const PASSWORD_SYMBOLS: usize = 2;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
/// Unreserved URI characters
pub const URL_SAFE_SYMBOLS: &[u8] = b"-._~";

pub const MYSQL_MAX_DATABASE_LEN: usize = 63;
pub const MYSQL_MAX_USER_LEN: usize = 32;
pub const POSTGRES_MAX_IDENTIFIER_LEN: usize = 63;

/// Length of the `_<8 hex>` suffix appended when a name is truncated
const HASH_SUFFIX_LEN: usize = 9;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("object has no namespace")]
    MissingNamespace,

    #[error("object has no name")]
    MissingName,

    #[error("secret has no data")]
    EmptySecret,

    #[error("secret is missing key {0}")]
    MissingKey(&'static str),

    #[error("secret value for {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

pub type Result<T, E = CredentialsError> = std::result::Result<T, E>;

/// Key names of an engine's credential secret
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecretKeys {
    pub database: &'static str,
    pub user: &'static str,
    pub password: &'static str,
}

impl SecretKeys {
    pub fn for_engine(engine: Engine) -> Self {
        match engine {
            Engine::Postgres => POSTGRES_KEYS,
            Engine::Mysql => MYSQL_KEYS,
        }
    }
}

/// Credentials read from a Database or DbUser secret
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub name: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Generate a password of 10 letters, 8 digits and 2 URL-safe symbols
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    loop {
        let mut chars: Vec<u8> = Vec::with_capacity(PASSWORD_LENGTH);
        for (set, count) in [
            (LETTERS, PASSWORD_LETTERS),
            (DIGITS, PASSWORD_DIGITS),
            (URL_SAFE_SYMBOLS, PASSWORD_SYMBOLS),
        ] {
            for _ in 0..count {
                if let Some(&c) = set.get(rng.random_range(0..set.len())) {
                    chars.push(c);
                }
            }
        }
        chars.shuffle(&mut rng);

        let password: String = chars.into_iter().map(char::from).collect();
        if !password.contains("--") {
            return password;
        }
    }
}

/// Make `s` a valid MySQL name of at most `max_len` characters
///
/// Lowercases, replaces anything outside `[0-9a-z$_]` with `_` and, when too
/// long, keeps a prefix followed by `_` and 8 hex characters of its SHA-256.
pub fn sanitise(s: &str, max_len: usize) -> String {
    let mapped: String = s
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_digit() || c.is_ascii_lowercase() || c == '$' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if mapped.len() <= max_len {
        return mapped;
    }
    let keep = max_len.saturating_sub(HASH_SUFFIX_LEN);
    format!("{}_{}", &mapped[..keep], short_hash(s))
}

/// Shorten a PostgreSQL identifier that exceeds `max_len` bytes, keeping it otherwise
pub fn truncate_identifier(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(HASH_SUFFIX_LEN);
    let mut end = keep;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{}", &s[..end], short_hash(s))
}

fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    hex::encode(&digest[..4])
}

fn base_name(meta: &ObjectMeta) -> Result<String> {
    let namespace = meta
        .namespace
        .as_deref()
        .ok_or(CredentialsError::MissingNamespace)?;
    let name = meta.name.as_deref().ok_or(CredentialsError::MissingName)?;
    Ok(format!("{}-{}", namespace, name))
}

/// Database name derived from the object's namespace and name
pub fn database_name(engine: Engine, meta: &ObjectMeta) -> Result<String> {
    let base = base_name(meta)?;
    Ok(match engine {
        Engine::Postgres => truncate_identifier(&base, POSTGRES_MAX_IDENTIFIER_LEN),
        Engine::Mysql => sanitise(&base, MYSQL_MAX_DATABASE_LEN),
    })
}

/// User name derived from the object's namespace and name
pub fn user_name(engine: Engine, meta: &ObjectMeta) -> Result<String> {
    let base = base_name(meta)?;
    Ok(match engine {
        Engine::Postgres => truncate_identifier(&base, POSTGRES_MAX_IDENTIFIER_LEN),
        Engine::Mysql => sanitise(&base, MYSQL_MAX_USER_LEN),
    })
}

/// Fresh credential data for an object
///
/// An empty `database` derives the database name from `meta`; DbUsers pass
/// their parent's database name instead.
pub fn generate(
    meta: &ObjectMeta,
    engine: Engine,
    database: &str,
) -> Result<BTreeMap<String, ByteString>> {
    let database = if database.is_empty() {
        database_name(engine, meta)?
    } else {
        database.to_string()
    };
    let credentials = DatabaseCredentials {
        name: database,
        username: user_name(engine, meta)?,
        password: generate_password(),
    };
    Ok(secret_data(engine, &credentials))
}

pub fn secret_data(engine: Engine, credentials: &DatabaseCredentials) -> BTreeMap<String, ByteString> {
    let keys = SecretKeys::for_engine(engine);
    BTreeMap::from([
        (
            keys.database.to_string(),
            ByteString(credentials.name.as_bytes().to_vec()),
        ),
        (
            keys.user.to_string(),
            ByteString(credentials.username.as_bytes().to_vec()),
        ),
        (
            keys.password.to_string(),
            ByteString(credentials.password.as_bytes().to_vec()),
        ),
    ])
}

/// Read credentials from secret data
pub fn parse_database_secret_data(
    engine: Engine,
    data: &BTreeMap<String, ByteString>,
) -> Result<DatabaseCredentials> {
    let keys = SecretKeys::for_engine(engine);
    let read = |key: &'static str| -> Result<String> {
        let value = data.get(key).ok_or(CredentialsError::MissingKey(key))?;
        String::from_utf8(value.0.clone()).map_err(|_| CredentialsError::InvalidUtf8(key))
    };
    Ok(DatabaseCredentials {
        name: read(keys.database)?,
        username: read(keys.user)?,
        password: read(keys.password)?,
    })
}

/// Credentials of an existing secret
pub fn parse_secret(engine: Engine, secret: &Secret) -> Result<DatabaseCredentials> {
    let data = secret.data.as_ref().ok_or(CredentialsError::EmptySecret)?;
    parse_database_secret_data(engine, data)
}

/// Database names listed in a `db-operator/database` annotation value
pub fn databases_from_annotation(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Add `database` to the secret's annotation; returns whether it changed
pub fn annotate_database(secret: &mut Secret, database: &str) -> bool {
    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let mut names = annotations
        .get(DATABASE_ANNOTATION)
        .map(|v| databases_from_annotation(v))
        .unwrap_or_default();
    if names.iter().any(|n| n == database) {
        return false;
    }
    names.push(database.to_string());
    annotations.insert(DATABASE_ANNOTATION.to_string(), names.join(","));
    true
}

// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for credentials, quoting and template rendering
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Generated passwords always follow the password policy
//! 2. Derived names always fit the engine's identifier rules
//! 3. Quoting never lets a value escape its literal or identifier
//! 4. Rendering is idempotent and never touches keys the operator didn't write

use std::collections::BTreeMap;

use proptest::prelude::*;

use db_operator::credentials::{
    BLOCKED_KEYS, MYSQL_MAX_USER_LEN, PASSWORD_LENGTH, POSTGRES_MAX_IDENTIFIER_LEN,
    URL_SAFE_SYMBOLS, generate_password, sanitise, truncate_identifier,
};
use db_operator::crd::{Engine, Template};
use db_operator::database::{TlsMode, mysql, postgres};
use db_operator::templates::{Carriers, Endpoint, TemplateSet, render_carriers};
use k8s_openapi::ByteString;

// =============================================================================
// Strategies
// =============================================================================

/// Kubernetes style namespace-name pairs, joined with `-`
fn object_name() -> impl Strategy<Value = String> {
    ("[a-z][a-z0-9-]{0,40}", "[a-z][a-zA-Z0-9.-]{0,60}").prop_map(|(ns, name)| format!("{}-{}", ns, name))
}

fn template_key() -> impl Strategy<Value = String> {
    "[A-Z][A-Z_]{0,12}".prop_filter("credential keys are reserved", |k| {
        !BLOCKED_KEYS.contains(&k.as_str())
    })
}

fn field_template() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "{{ .Protocol }}://{{ .Hostname }}:{{ .Port }}",
        "{{ .Username }}",
        "{{ .Database }}",
        "{{ if .Password }}set{{ end }}",
        "{{ printf \"%s@%s\" .Username .Host }}",
        "plain text",
    ])
    .prop_map(String::from)
}

fn credentials() -> Carriers {
    Carriers {
        secret: [
            ("POSTGRES_DB", "app-db1"),
            ("POSTGRES_USER", "app-db1"),
            ("POSTGRES_PASSWORD", "pw"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect(),
        ..Default::default()
    }
}

fn endpoint() -> Endpoint {
    Endpoint {
        engine: Engine::Postgres,
        host: "gen-pg.db.svc".to_string(),
        port: 5432,
    }
}

// =============================================================================
// Credentials
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn password_follows_policy(_seed in any::<u8>()) {
        let password = generate_password();
        prop_assert_eq!(password.len(), PASSWORD_LENGTH);
        prop_assert!(password.bytes().all(|b| b.is_ascii_alphanumeric() || URL_SAFE_SYMBOLS.contains(&b)));
        prop_assert_eq!(password.bytes().filter(u8::is_ascii_digit).count(), 8);
        prop_assert_eq!(password.bytes().filter(u8::is_ascii_alphabetic).count(), 10);
        prop_assert!(!password.contains("--"));
    }
}

proptest! {
    #[test]
    fn sanitised_names_are_valid_mysql_names(name in object_name()) {
        let user = sanitise(&name, MYSQL_MAX_USER_LEN);
        prop_assert!(user.len() <= MYSQL_MAX_USER_LEN);
        prop_assert!(user.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || c == '_' || c == '$'));
        prop_assert!(mysql::quote_account(&user).is_ok());
    }

    #[test]
    fn sanitise_is_deterministic_and_keeps_short_names(name in object_name()) {
        let once = sanitise(&name, MYSQL_MAX_USER_LEN);
        prop_assert_eq!(&once, &sanitise(&name, MYSQL_MAX_USER_LEN));
        if name.len() <= MYSQL_MAX_USER_LEN {
            prop_assert_eq!(once.len(), name.len());
        }
    }

    #[test]
    fn postgres_identifiers_fit(name in object_name()) {
        let id = truncate_identifier(&name, POSTGRES_MAX_IDENTIFIER_LEN);
        prop_assert!(id.len() <= POSTGRES_MAX_IDENTIFIER_LEN);
        if name.len() <= POSTGRES_MAX_IDENTIFIER_LEN {
            prop_assert_eq!(&id, &name);
        }
        prop_assert!(postgres::quote_identifier(&id).is_ok());
    }

    #[test]
    fn distinct_long_names_stay_distinct(a in object_name(), b in object_name()) {
        prop_assume!(a != b);
        prop_assert_ne!(
            truncate_identifier(&a, POSTGRES_MAX_IDENTIFIER_LEN),
            truncate_identifier(&b, POSTGRES_MAX_IDENTIFIER_LEN)
        );
    }
}

// =============================================================================
// Quoting
// =============================================================================

/// Undo quoting by doubling; None when a quote is left unescaped
fn unquote(quoted: &str, quote: char) -> Option<String> {
    let inner = quoted.strip_prefix(quote)?.strip_suffix(quote)?;
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == quote {
            if chars.next() != Some(quote) {
                return None;
            }
        }
        out.push(c);
    }
    Some(out)
}

proptest! {
    #[test]
    fn postgres_identifier_quoting_is_reversible(name in "[\x01-\x7e]{1,63}") {
        let quoted = postgres::quote_identifier(&name).unwrap();
        prop_assert_eq!(unquote(&quoted, '"'), Some(name));
    }

    #[test]
    fn mysql_identifier_quoting_is_reversible(name in "[\x01-\x7e]{0,40}[\x21-\x7e]") {
        let quoted = mysql::quote_identifier(&name).unwrap();
        prop_assert_eq!(unquote(&quoted, '`'), Some(name));
    }

    #[test]
    fn postgres_literal_quoting_is_closed(value in "[\x01-\x7e]{0,40}") {
        let quoted = postgres::quote_literal(&value).unwrap();
        let body = quoted.strip_prefix("E'").or_else(|| quoted.strip_prefix('\'')).unwrap();
        let body = body.strip_suffix('\'').unwrap();
        // Every quote inside the literal is doubled
        prop_assert_eq!(unquote(&format!("'{}'", body), '\''), Some(body.replace("''", "'")));
    }

    #[test]
    fn nul_bytes_are_rejected(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
        let value = format!("{}\0{}", prefix, suffix);
        prop_assert!(postgres::quote_identifier(&value).is_err());
        prop_assert!(postgres::quote_literal(&value).is_err());
        prop_assert!(mysql::quote_literal(&value).is_err());
    }
}

// =============================================================================
// TLS policy
// =============================================================================

proptest! {
    #[test]
    fn tls_disabled_unless_enabled(skip_verify in any::<bool>()) {
        prop_assert_eq!(TlsMode::from_policy(false, skip_verify), TlsMode::Disabled);
        let enabled = TlsMode::from_policy(true, skip_verify);
        prop_assert_ne!(enabled, TlsMode::Disabled);
        prop_assert_eq!(enabled == TlsMode::VerifyCa, !skip_verify);
    }
}

// =============================================================================
// Template rendering
// =============================================================================

proptest! {
    #[test]
    fn rendering_is_idempotent(
        templates in prop::collection::btree_map(template_key(), (field_template(), any::<bool>()), 0..5),
    ) {
        let templates: Vec<Template> = templates
            .into_iter()
            .map(|(name, (template, secret))| Template { name, template, secret })
            .collect();
        let set = TemplateSet::new(&templates, None);

        let once = render_carriers(&set, &endpoint(), &BTreeMap::new(), &credentials()).unwrap();
        let twice = render_carriers(&set, &endpoint(), &BTreeMap::new(), &once).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn rendering_leaves_foreign_keys_alone(
        templates in prop::collection::btree_map(template_key(), field_template(), 1..4),
        foreign in prop::collection::btree_map("[a-z][a-z_]{0,8}", "[a-z]{0,8}", 0..4),
    ) {
        let templates: Vec<Template> = templates
            .into_iter()
            .map(|(name, template)| Template { name, template, secret: false })
            .collect();
        let set = TemplateSet::new(&templates, None);

        let mut carriers = credentials();
        carriers.configmap = foreign.clone();
        let out = render_carriers(&set, &endpoint(), &BTreeMap::new(), &carriers).unwrap();

        for (key, value) in &foreign {
            prop_assert_eq!(out.configmap.get(key), Some(value));
        }
        prop_assert_eq!(&out.secret, &carriers.secret);

        // Dropping every template removes exactly the rendered keys
        let cleared = render_carriers(&TemplateSet::new(&[], None), &endpoint(), &BTreeMap::new(), &out).unwrap();
        prop_assert_eq!(cleared.configmap, foreign);
    }
}

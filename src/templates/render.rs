//! Rendering templates into a secret and a config map
//!
//! Rendering works on a copy of the carrier data and only returns it when
//! every template succeeded, so a failed render leaves both objects as they
//! were. Keys written by a previous render are listed in an annotation on
//! each carrier; keys that are no longer rendered are removed, keys the
//! operator never wrote are never touched.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use super::TemplateError;
use super::parse::{Arg, Tree};
use super::source::{DatabaseSource, Endpoint, LegacySource};
use crate::credentials::{BLOCKED_KEYS, parse_database_secret_data};
use crate::crd::Template;
use crate::database::{DatabaseUser, Driver};

/// Annotation listing the keys written by the last render
pub const TEMPLATED_KEYS_ANNOTATION: &str = "kinda.rocks/db-operator-templated-keys";

pub const DEFAULT_TEMPLATE_NAME: &str = "CONNECTION_STRING";
pub const DEFAULT_TEMPLATE: &str =
    "{{ .Protocol }}://{{ .Username }}:{{ .Password }}@{{ .Hostname }}:{{ .Port }}/{{ .Database }}";

/// Templates to render, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateSet {
    pub templates: Vec<Template>,
    /// Rendered from `secretsTemplates` with the legacy data source
    pub legacy: bool,
}

impl TemplateSet {
    /// Legacy templates win when present; without any template the
    /// connection string is rendered into the secret
    pub fn new(templates: &[Template], secrets_templates: Option<&BTreeMap<String, String>>) -> Self {
        if let Some(legacy) = secrets_templates.filter(|t| !t.is_empty()) {
            return Self {
                templates: legacy
                    .iter()
                    .map(|(name, template)| Template {
                        name: name.clone(),
                        template: template.clone(),
                        secret: true,
                    })
                    .collect(),
                legacy: true,
            };
        }
        if !templates.is_empty() {
            return Self {
                templates: templates.to_vec(),
                legacy: false,
            };
        }
        Self {
            templates: vec![Template {
                name: DEFAULT_TEMPLATE_NAME.to_string(),
                template: DEFAULT_TEMPLATE.to_string(),
                secret: true,
            }],
            legacy: false,
        }
    }

    fn parse(&self) -> Result<Vec<(&Template, Tree)>, TemplateError> {
        self.templates
            .iter()
            .map(|t| Ok((t, Tree::parse(&t.name, &t.template)?)))
            .collect()
    }
}

/// Data of the two carrier objects and the keys last rendered into them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Carriers {
    pub secret: BTreeMap<String, ByteString>,
    pub secret_templated: Vec<String>,
    pub configmap: BTreeMap<String, String>,
    pub configmap_templated: Vec<String>,
}

impl Carriers {
    pub fn from_objects(secret: &Secret, configmap: &ConfigMap) -> Self {
        Self {
            secret: secret.data.clone().unwrap_or_default(),
            secret_templated: templated_keys(&secret.metadata),
            configmap: configmap.data.clone().unwrap_or_default(),
            configmap_templated: templated_keys(&configmap.metadata),
        }
    }

    /// Write data and annotations back into the objects
    pub fn apply(self, secret: &mut Secret, configmap: &mut ConfigMap) {
        secret.data = Some(self.secret);
        set_templated_keys(&mut secret.metadata, &self.secret_templated);
        configmap.data = Some(self.configmap);
        set_templated_keys(&mut configmap.metadata, &self.configmap_templated);
    }
}

pub fn templated_keys(meta: &ObjectMeta) -> Vec<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATED_KEYS_ANNOTATION))
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn set_templated_keys(meta: &mut ObjectMeta, keys: &[String]) {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    if keys.is_empty() {
        annotations.remove(TEMPLATED_KEYS_ANNOTATION);
    } else {
        annotations.insert(TEMPLATED_KEYS_ANNOTATION.to_string(), keys.join(","));
    }
}

/// Statements passed to `.Query`, which must be string literals
pub fn collect_queries(tree: &Tree) -> Result<Vec<String>, TemplateError> {
    let mut queries = Vec::new();
    for command in tree.commands() {
        let is_query = match command.args.first() {
            Some(Arg::Field(chain)) | Some(Arg::Root(chain)) => {
                matches!(chain.as_slice(), [name] if name == "Query")
            }
            _ => false,
        };
        if !is_query {
            continue;
        }
        match command.args.as_slice() {
            [_, literal] if literal.as_str_literal().is_some() => {
                if let Some(query) = literal.as_str_literal() {
                    queries.push(query.to_string());
                }
            }
            _ => {
                return Err(TemplateError::Exec {
                    name: tree.name.clone(),
                    line: 0,
                    message: "Query takes exactly one string literal".to_string(),
                });
            }
        }
    }
    Ok(queries)
}

/// Run every `Query` of the set as `user` and return the results by statement
pub async fn prepare_queries(
    set: &TemplateSet,
    driver: &Driver,
    user: &DatabaseUser,
) -> Result<BTreeMap<String, String>, TemplateError> {
    let mut results = BTreeMap::new();
    if set.legacy {
        return Ok(results);
    }
    for (_, tree) in set.parse()? {
        for query in collect_queries(&tree)? {
            if results.contains_key(&query) {
                continue;
            }
            debug!(template = %tree.name, query = %query, "Running template query");
            let value = driver
                .query_as_user(&query, user)
                .await
                .map_err(|source| TemplateError::Query {
                    query: query.clone(),
                    source,
                })?;
            results.insert(query, value);
        }
    }
    Ok(results)
}

/// Render the set against already prepared query results
pub fn render_carriers(
    set: &TemplateSet,
    endpoint: &Endpoint,
    queries: &BTreeMap<String, String>,
    carriers: &Carriers,
) -> Result<Carriers, TemplateError> {
    let mut next = carriers.clone();
    let mut rendered_secret: Vec<String> = Vec::new();
    let mut rendered_configmap: Vec<String> = Vec::new();

    for (template, tree) in set.parse()? {
        let value = if set.legacy {
            let credentials = parse_database_secret_data(endpoint.engine, &next.secret)?;
            let source = LegacySource {
                protocol: endpoint.engine.protocol().to_string(),
                host: endpoint.host.clone(),
                port: endpoint.port,
                username: credentials.username,
                password: credentials.password,
                database: credentials.name,
            };
            tree.execute(&source)?
        } else {
            let source = DatabaseSource {
                endpoint,
                secret: &next.secret,
                configmap: &next.configmap,
                queries,
            };
            tree.execute(&source)?
        };

        let key = template.name.clone();
        if template.secret {
            if BLOCKED_KEYS.contains(&key.as_str()) {
                if set.legacy {
                    debug!(key = %key, "Skipping reserved key in legacy template");
                    continue;
                }
                return Err(TemplateError::BlockedKey(key));
            }
            if next.secret.contains_key(&key)
                && !carriers.secret_templated.contains(&key)
                && !rendered_secret.contains(&key)
            {
                return Err(TemplateError::KeyExists {
                    key,
                    carrier: "secret",
                });
            }
            next.secret.insert(key.clone(), ByteString(value.into_bytes()));
            if !rendered_secret.contains(&key) {
                rendered_secret.push(key);
            }
        } else {
            if next.configmap.contains_key(&key)
                && !carriers.configmap_templated.contains(&key)
                && !rendered_configmap.contains(&key)
            {
                return Err(TemplateError::KeyExists {
                    key,
                    carrier: "configmap",
                });
            }
            next.configmap.insert(key.clone(), value);
            if !rendered_configmap.contains(&key) {
                rendered_configmap.push(key);
            }
        }
    }

    for obsolete in carriers
        .secret_templated
        .iter()
        .filter(|k| !rendered_secret.contains(k) && !BLOCKED_KEYS.contains(&k.as_str()))
    {
        debug!(key = %obsolete, "Removing key no longer templated from secret");
        next.secret.remove(obsolete);
    }
    for obsolete in carriers
        .configmap_templated
        .iter()
        .filter(|k| !rendered_configmap.contains(k))
    {
        debug!(key = %obsolete, "Removing key no longer templated from configmap");
        next.configmap.remove(obsolete);
    }

    next.secret_templated = rendered_secret;
    next.configmap_templated = rendered_configmap;
    Ok(next)
}

/// Prepare queries and render in one step
pub async fn render(
    set: &TemplateSet,
    endpoint: &Endpoint,
    driver: &Driver,
    user: &DatabaseUser,
    carriers: &Carriers,
) -> Result<Carriers, TemplateError> {
    let queries = prepare_queries(set, driver, user).await?;
    render_carriers(set, endpoint, &queries, carriers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::Engine;
    use crate::database::{AccessType, Dummy};

    fn endpoint() -> Endpoint {
        Endpoint {
            engine: Engine::Postgres,
            host: "pg".to_string(),
            port: 5432,
        }
    }

    fn carriers() -> Carriers {
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

    fn template(name: &str, body: &str, secret: bool) -> Template {
        Template {
            name: name.to_string(),
            template: body.to_string(),
            secret,
        }
    }

    fn secret_str(c: &Carriers, key: &str) -> String {
        String::from_utf8(c.secret[key].0.clone()).unwrap()
    }

    #[test]
    fn test_default_connection_string() {
        let set = TemplateSet::new(&[], None);
        let out = render_carriers(&set, &endpoint(), &BTreeMap::new(), &carriers()).unwrap();
        assert_eq!(
            secret_str(&out, "CONNECTION_STRING"),
            "postgresql://app-db1:pw@pg:5432/app-db1"
        );
        assert_eq!(out.secret_templated, vec!["CONNECTION_STRING"]);
    }

    #[test]
    fn test_blocked_key_is_an_error() {
        let set = TemplateSet::new(&[template("POSTGRES_PASSWORD", "x", true)], None);
        let err = render_carriers(&set, &endpoint(), &BTreeMap::new(), &carriers()).unwrap_err();
        assert!(err.to_string().contains("POSTGRES_PASSWORD"));
    }

    #[test]
    fn test_blocked_key_skipped_for_legacy() {
        let legacy = BTreeMap::from([
            ("POSTGRES_PASSWORD".to_string(), "x".to_string()),
            ("URI".to_string(), "{{ .Protocol }}://{{ .DatabaseHost }}".to_string()),
        ]);
        let set = TemplateSet::new(&[], Some(&legacy));
        assert!(set.legacy);
        let out = render_carriers(&set, &endpoint(), &BTreeMap::new(), &carriers()).unwrap();
        assert_eq!(secret_str(&out, "POSTGRES_PASSWORD"), "pw");
        assert_eq!(secret_str(&out, "URI"), "postgresql://pg");
    }

    #[test]
    fn test_user_key_is_never_overwritten() {
        let mut input = carriers();
        input
            .configmap
            .insert("OWNED".to_string(), "mine".to_string());
        let set = TemplateSet::new(&[template("OWNED", "x", false)], None);
        let err = render_carriers(&set, &endpoint(), &BTreeMap::new(), &input).unwrap_err();
        assert!(err.to_string().contains("already exists in the configmap"));
    }

    #[test]
    fn test_obsolete_keys_removed_user_keys_kept() {
        let two = TemplateSet::new(
            &[template("A", "a", true), template("B", "b", false)],
            None,
        );
        let mut input = carriers();
        input.secret.insert("USER_KEY".to_string(), ByteString(b"u".to_vec()));
        let first = render_carriers(&two, &endpoint(), &BTreeMap::new(), &input).unwrap();
        assert_eq!(first.configmap["B"], "b");

        let one = TemplateSet::new(&[template("A", "a2", true)], None);
        let second = render_carriers(&one, &endpoint(), &BTreeMap::new(), &first).unwrap();
        assert_eq!(secret_str(&second, "A"), "a2");
        assert!(!second.configmap.contains_key("B"));
        assert!(second.configmap_templated.is_empty());
        assert_eq!(secret_str(&second, "USER_KEY"), "u");
    }

    #[test]
    fn test_templates_see_earlier_templates() {
        let set = TemplateSet::new(
            &[
                template("HOST", "{{ .Hostname }}", false),
                template("URL", r#"http://{{ .ConfigMap "HOST" }}"#, true),
            ],
            None,
        );
        let out = render_carriers(&set, &endpoint(), &BTreeMap::new(), &carriers()).unwrap();
        assert_eq!(secret_str(&out, "URL"), "http://pg");
    }

    #[test]
    fn test_failed_render_returns_no_partial_state() {
        let set = TemplateSet::new(
            &[template("A", "a", true), template("B", "{{ .Nope }}", true)],
            None,
        );
        let input = carriers();
        assert!(render_carriers(&set, &endpoint(), &BTreeMap::new(), &input).is_err());
        assert!(!input.secret.contains_key("A"));
    }

    #[test]
    fn test_collect_queries_requires_literal() {
        let tree = Tree::parse("t", r#"{{ .Query "SELECT 1" }}{{ .Query "SELECT 2" }}"#).unwrap();
        assert_eq!(collect_queries(&tree).unwrap(), vec!["SELECT 1", "SELECT 2"]);

        let tree = Tree::parse("t", r#"{{ .Query .Database }}"#).unwrap();
        assert!(collect_queries(&tree).is_err());
    }

    #[test]
    fn test_annotation_round_trip() {
        let mut secret = Secret::default();
        let mut configmap = ConfigMap::default();
        let set = TemplateSet::new(&[], None);
        let out = render_carriers(&set, &endpoint(), &BTreeMap::new(), &carriers()).unwrap();
        out.apply(&mut secret, &mut configmap);
        assert_eq!(templated_keys(&secret.metadata), vec!["CONNECTION_STRING"]);
        assert!(templated_keys(&configmap.metadata).is_empty());
    }

    #[tokio::test]
    async fn test_render_runs_queries_as_user() {
        let dummy = Dummy::new(Engine::Postgres, "app-db1", "pg", 5432)
            .with_query_result("SELECT version()", "PostgreSQL 16");
        let driver = Driver::Dummy(dummy.clone());
        let user = DatabaseUser {
            username: "app-db1".to_string(),
            password: "pw".to_string(),
            access_type: AccessType::MainUser,
        };
        let set = TemplateSet::new(
            &[template("VERSION", r#"{{ .Query "SELECT version()" }}"#, false)],
            None,
        );
        let out = render(&set, &endpoint(), &driver, &user, &carriers()).await.unwrap();
        assert_eq!(out.configmap["VERSION"], "PostgreSQL 16");
        assert_eq!(dummy.calls().len(), 1);
    }
}

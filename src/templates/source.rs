//! Data sources for credential templates

use std::collections::BTreeMap;

use k8s_openapi::ByteString;

use super::exec::{DataSource, Value};
use crate::credentials::SecretKeys;
use crate::crd::Engine;

/// Fields available to `templates`
pub const FIELDS: [&str; 7] = [
    "Protocol", "Hostname", "Host", "Port", "Username", "Password", "Database",
];

/// Methods available to `templates`; each takes one string literal
pub const METHODS: [&str; 3] = ["Secret", "ConfigMap", "Query"];

/// Fields available to legacy `secretsTemplates`
pub const LEGACY_FIELDS: [&str; 6] = [
    "Protocol",
    "DatabaseHost",
    "DatabasePort",
    "UserName",
    "Password",
    "DatabaseName",
];

/// Where clients connect: the proxy when it is ready, the server otherwise
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
}

/// Data source of `templates`
///
/// Credentials are read from the secret as it stands during rendering, so
/// a template sees keys written by the templates before it.
pub struct DatabaseSource<'a> {
    pub endpoint: &'a Endpoint,
    pub secret: &'a BTreeMap<String, ByteString>,
    pub configmap: &'a BTreeMap<String, String>,
    /// Results of `Query` calls, collected before execution
    pub queries: &'a BTreeMap<String, String>,
}

impl DatabaseSource<'_> {
    fn secret_value(&self, key: &str) -> Result<Value, String> {
        let value = self
            .secret
            .get(key)
            .ok_or_else(|| format!("key {} is not found in the secret", key))?;
        String::from_utf8(value.0.clone())
            .map(Value::Str)
            .map_err(|_| format!("secret value of {} is not valid UTF-8", key))
    }
}

fn single_string<'v>(name: &str, args: &'v [Value]) -> Result<&'v str, String> {
    match args {
        [Value::Str(s)] => Ok(s),
        _ => Err(format!("{} takes exactly one string argument", name)),
    }
}

impl DataSource for DatabaseSource<'_> {
    fn field(&self, name: &str) -> Result<Value, String> {
        let keys = SecretKeys::for_engine(self.endpoint.engine);
        match name {
            "Protocol" => Ok(Value::from(self.endpoint.engine.protocol())),
            "Hostname" | "Host" => Ok(Value::from(self.endpoint.host.as_str())),
            "Port" => Ok(Value::from(self.endpoint.port)),
            "Username" => self.secret_value(keys.user),
            "Password" => self.secret_value(keys.password),
            "Database" => self.secret_value(keys.database),
            other if METHODS.contains(&other) => {
                Err(format!("{} needs a double-quoted argument", other))
            }
            other => Err(format!("can't evaluate field {}", other)),
        }
    }

    fn method(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        match name {
            "Secret" => self.secret_value(single_string(name, args)?),
            "ConfigMap" => {
                let key = single_string(name, args)?;
                self.configmap
                    .get(key)
                    .cloned()
                    .map(Value::Str)
                    .ok_or_else(|| format!("key {} is not found in the configmap", key))
            }
            "Query" => {
                let query = single_string(name, args)?;
                self.queries
                    .get(query)
                    .cloned()
                    .map(Value::Str)
                    .ok_or_else(|| format!("Query {:?} must be called with a string literal", query))
            }
            other => Err(format!("can't give argument to non-function .{}", other)),
        }
    }
}

/// Data source of legacy `secretsTemplates`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacySource {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DataSource for LegacySource {
    fn field(&self, name: &str) -> Result<Value, String> {
        Ok(match name {
            "Protocol" => Value::from(self.protocol.as_str()),
            "DatabaseHost" => Value::from(self.host.as_str()),
            "DatabasePort" => Value::from(self.port),
            "UserName" => Value::from(self.username.as_str()),
            "Password" => Value::from(self.password.as_str()),
            "DatabaseName" => Value::from(self.database.as_str()),
            other => return Err(format!("can't evaluate field {} in legacy template", other)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::templates::Tree;

    fn secret() -> BTreeMap<String, ByteString> {
        [
            ("POSTGRES_DB", "app-db1"),
            ("POSTGRES_USER", "app-db1"),
            ("POSTGRES_PASSWORD", "pw"),
            ("EXTRA", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect()
    }

    fn render(body: &str) -> Result<String, crate::templates::TemplateError> {
        let endpoint = Endpoint {
            engine: Engine::Postgres,
            host: "pg".to_string(),
            port: 5432,
        };
        let secret = secret();
        let configmap = BTreeMap::from([("DB_HOST".to_string(), "pg".to_string())]);
        let queries = BTreeMap::from([("SELECT 1".to_string(), "1".to_string())]);
        let source = DatabaseSource {
            endpoint: &endpoint,
            secret: &secret,
            configmap: &configmap,
            queries: &queries,
        };
        Tree::parse("t", body)?.execute(&source)
    }

    #[test]
    fn test_connection_fields() {
        assert_eq!(
            render("{{ .Protocol }}://{{ .Username }}:{{ .Password }}@{{ .Hostname }}:{{ .Port }}/{{ .Database }}")
                .unwrap(),
            "postgresql://app-db1:pw@pg:5432/app-db1"
        );
        assert_eq!(render("{{ .Host }}").unwrap(), "pg");
    }

    #[test]
    fn test_methods() {
        assert_eq!(render(r#"{{ .Secret "EXTRA" }}"#).unwrap(), "x");
        assert_eq!(render(r#"{{ .ConfigMap "DB_HOST" }}"#).unwrap(), "pg");
        assert_eq!(render(r#"{{ .Query "SELECT 1" }}"#).unwrap(), "1");
    }

    #[test]
    fn test_missing_keys_fail() {
        assert!(render(r#"{{ .Secret "NOPE" }}"#).is_err());
        assert!(render(r#"{{ .Query "SELECT 2" }}"#).is_err());
        assert!(render("{{ .Secret }}").is_err());
    }

    #[test]
    fn test_legacy_fields_only() {
        let source = LegacySource {
            protocol: "mysql".to_string(),
            host: "my".to_string(),
            port: 3306,
            username: "u".to_string(),
            password: "p".to_string(),
            database: "d".to_string(),
        };
        let out = Tree::parse("t", "{{ .Protocol }}://{{ .UserName }}@{{ .DatabaseHost }}:{{ .DatabasePort }}/{{ .DatabaseName }}")
            .unwrap()
            .execute(&source)
            .unwrap();
        assert_eq!(out, "mysql://u@my:3306/d");
        assert!(Tree::parse("t", "{{ .Hostname }}").unwrap().execute(&source).is_err());
    }
}

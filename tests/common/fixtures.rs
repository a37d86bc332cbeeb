//! Builders for Database, DbInstance and DbUser resources
//!
//! ```rust,ignore
//! let instance = DbInstanceBuilder::generic("gen-pg", "postgres").running().build();
//! let database = DatabaseBuilder::new("db1", "app", "gen-pg")
//!     .with_template("URL", "{{ .Hostname }}", false)
//!     .build();
//! ```

use std::collections::BTreeMap;

use db_operator::crd::{
    Database, DatabaseSpec, DatabaseStatus, DbInstance, DbInstanceSpec, DbInstanceStatus, DbUser,
    DbUserSpec, GenericInstance, GoogleInstance, InstancePhase, NamespacedName, PostgresOptions,
    ProxyStatus, Template,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::core::ObjectMeta;

pub fn bytes(value: &str) -> ByteString {
    ByteString(value.as_bytes().to_vec())
}

pub fn string_data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
    pairs.iter().map(|(k, v)| (k.to_string(), bytes(v))).collect()
}

pub fn template(name: &str, body: &str, secret: bool) -> Template {
    Template {
        name: name.to_string(),
        template: body.to_string(),
        secret,
    }
}

pub fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("{}-uid", name)),
        ..Default::default()
    }
}

/// Credentials secret of a PostgreSQL Database
pub fn postgres_secret(name: &str, namespace: &str, database: &str, user: &str, password: &str) -> Secret {
    Secret {
        metadata: meta(name, namespace),
        data: Some(string_data(&[
            ("POSTGRES_DB", database),
            ("POSTGRES_USER", user),
            ("POSTGRES_PASSWORD", password),
        ])),
        ..Default::default()
    }
}

pub fn empty_config_map(name: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: meta(name, namespace),
        ..Default::default()
    }
}

pub struct DbInstanceBuilder {
    name: String,
    spec: DbInstanceSpec,
    status: Option<DbInstanceStatus>,
}

impl DbInstanceBuilder {
    /// A generic instance at `<name>.db.svc:<default port>`
    pub fn generic(name: &str, engine: &str) -> Self {
        let port = if engine == "mysql" { 3306 } else { 5432 };
        Self {
            name: name.to_string(),
            spec: DbInstanceSpec {
                engine: engine.to_string(),
                admin_secret_ref: NamespacedName {
                    namespace: "db-operator".to_string(),
                    name: format!("{}-admin", name),
                },
                backup: Default::default(),
                monitoring: Default::default(),
                ssl_connection: Default::default(),
                google: None,
                generic: Some(GenericInstance {
                    host: format!("{}.db.svc", name),
                    port,
                    ..Default::default()
                }),
                percona: None,
            },
            status: None,
        }
    }

    pub fn google(name: &str, engine: &str) -> Self {
        let mut builder = Self::generic(name, engine);
        builder.spec.generic = None;
        builder.spec.google = Some(GoogleInstance {
            instance: name.to_string(),
            config_map_ref: NamespacedName {
                namespace: "db-operator".to_string(),
                name: format!("{}-config", name),
            },
            ..Default::default()
        });
        builder
    }

    pub fn with_ssl(mut self, enabled: bool, skip_verify: bool) -> Self {
        self.spec.ssl_connection.enabled = enabled;
        self.spec.ssl_connection.skip_verify = skip_verify;
        self
    }

    pub fn without_backend(mut self) -> Self {
        self.spec.generic = None;
        self.spec.google = None;
        self.spec.percona = None;
        self
    }

    pub fn running(mut self) -> Self {
        self.status = Some(DbInstanceStatus {
            phase: InstancePhase::Running,
            status: true,
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> DbInstance {
        let mut instance = DbInstance::new(&self.name, self.spec);
        instance.metadata.uid = Some(format!("{}-uid", self.name));
        instance.status = self.status;
        instance
    }
}

pub struct DatabaseBuilder {
    name: String,
    namespace: String,
    spec: DatabaseSpec,
    status: Option<DatabaseStatus>,
}

impl DatabaseBuilder {
    pub fn new(name: &str, namespace: &str, instance: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: DatabaseSpec {
                secret_name: format!("{}-creds", name),
                instance: instance.to_string(),
                deletion_protected: false,
                backup: Default::default(),
                postgres: None,
                secrets_templates: None,
                templates: Vec::new(),
                cleanup: false,
            },
            status: None,
        }
    }

    pub fn with_template(mut self, name: &str, body: &str, secret: bool) -> Self {
        self.spec.templates.push(template(name, body, secret));
        self
    }

    pub fn with_legacy_template(mut self, name: &str, body: &str) -> Self {
        self.spec
            .secrets_templates
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), body.to_string());
        self
    }

    pub fn with_postgres_template(mut self, template: &str) -> Self {
        self.spec.postgres = Some(PostgresOptions {
            template: Some(template.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn with_proxy(mut self, service_name: &str, sql_port: u16, ready: bool) -> Self {
        let status = self.status.get_or_insert_with(DatabaseStatus::default);
        status.proxy_status = Some(ProxyStatus {
            status: ready,
            service_name: service_name.to_string(),
            sql_port,
        });
        self
    }

    pub fn build(self) -> Database {
        let mut database = Database::new(&self.name, self.spec);
        database.metadata.namespace = Some(self.namespace);
        database.metadata.uid = Some(format!("{}-uid", self.name));
        database.status = self.status;
        database
    }
}

pub fn dbuser(name: &str, namespace: &str, database: &str, access_type: &str) -> DbUser {
    let mut user = DbUser::new(
        name,
        DbUserSpec {
            database_ref: database.to_string(),
            access_type: access_type.to_string(),
            secret_name: format!("{}-creds", name),
            templates: Vec::new(),
        },
    );
    user.metadata.namespace = Some(namespace.to_string());
    user
}

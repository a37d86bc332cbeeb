//! Event filtering and secret fan-out for the controllers
//!
//! Database and DbUser events pass only when something the reconcilers
//! care about changed. Updates of credential secrets are mapped back to the
//! Databases listed in their `db-operator/database` annotation.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};

use crate::controller::checksum::{SECRET_ANNOTATION, SPEC_ANNOTATION};
use crate::credentials::{DATABASE_ANNOTATION, databases_from_annotation};
use crate::crd::Database;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Admitted {
    generation: Option<i64>,
    checksums: BTreeMap<String, String>,
    deleting: bool,
}

impl Admitted {
    fn of<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        let annotations = meta.annotations.as_ref();
        Self {
            generation: meta.generation,
            checksums: [SPEC_ANNOTATION, SECRET_ANNOTATION]
                .into_iter()
                .filter_map(|key| {
                    annotations
                        .and_then(|a| a.get(key))
                        .map(|v| (key.to_string(), v.clone()))
                })
                .collect(),
            deleting: meta.deletion_timestamp.is_some(),
        }
    }
}

/// Admits an object when its generation, its checksum annotations or its
/// deletion marker changed since it was last admitted
///
/// Status updates alone never pass. Checksum annotations are compared
/// because a DbInstance clears `checksum/spec` to force its Databases to
/// reconcile without touching their generation. Deleted objects are
/// forgotten, and a relist keeps only the objects it lists.
#[derive(Debug)]
pub struct GenerationFilter<K: Resource<DynamicType = ()>> {
    seen: HashMap<ObjectRef<K>, Admitted>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K: Resource<DynamicType = ()>> Default for GenerationFilter<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K: Resource<DynamicType = ()>> GenerationFilter<K> {
    pub fn admit(&mut self, obj: &K) -> bool {
        let key = ObjectRef::from_obj(obj);
        let state = Admitted::of(obj);
        match self.seen.get(&key) {
            Some(previous) if *previous == state => false,
            _ => {
                self.seen.insert(key, state);
                true
            }
        }
    }

    pub fn forget(&mut self, obj: &K) {
        self.seen.remove(&ObjectRef::from_obj(obj));
    }

    /// Number of objects currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// The object to reconcile for a watch event, if any
    pub fn filter_event(&mut self, event: Event<K>) -> Option<K> {
        match event {
            Event::Apply(obj) => self.admit(&obj).then_some(obj),
            Event::InitApply(obj) => {
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(ObjectRef::from_obj(&obj));
                }
                self.admit(&obj).then_some(obj)
            }
            Event::Delete(obj) => {
                self.forget(&obj);
                None
            }
            Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.seen.retain(|key, _| relisted.contains(key));
                }
                None
            }
        }
    }
}

/// Databases to reconcile after a secret changed
pub fn databases_for_secret(secret: &Secret) -> Vec<ObjectRef<Database>> {
    let Some(namespace) = secret.namespace() else {
        return Vec::new();
    };
    secret
        .annotations()
        .get(DATABASE_ANNOTATION)
        .map(|value| {
            databases_from_annotation(value)
                .into_iter()
                .map(|name| ObjectRef::new(&name).within(&namespace))
                .collect()
        })
        .unwrap_or_default()
}

/// Passes updates of annotated secrets
///
/// A watch reports creations and updates alike as `Apply`, so the first
/// sighting of an annotated secret only records it. Secrets seen during the
/// initial list count as known. Deletions are dropped.
#[derive(Debug, Default)]
pub struct SecretUpdates {
    known: HashSet<ObjectRef<Secret>>,
    relisted: Option<HashSet<ObjectRef<Secret>>>,
}

impl SecretUpdates {
    fn annotated(secret: &Secret) -> bool {
        secret.annotations().contains_key(DATABASE_ANNOTATION)
    }

    pub fn filter_event(&mut self, event: Event<Secret>) -> Option<Secret> {
        match event {
            Event::Apply(secret) => {
                if !Self::annotated(&secret) {
                    self.known.remove(&ObjectRef::from_obj(&secret));
                    return None;
                }
                let known = !self.known.insert(ObjectRef::from_obj(&secret));
                known.then_some(secret)
            }
            Event::InitApply(secret) => {
                if Self::annotated(&secret)
                    && let Some(relisted) = &mut self.relisted
                {
                    relisted.insert(ObjectRef::from_obj(&secret));
                }
                None
            }
            Event::Delete(secret) => {
                self.known.remove(&ObjectRef::from_obj(&secret));
                None
            }
            Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.known = relisted;
                }
                None
            }
        }
    }

    /// Stream adapter; watch errors pass through
    pub fn on_event(
        &mut self,
        event: Result<Event<Secret>, watcher::Error>,
    ) -> Option<Result<Secret, watcher::Error>> {
        match event {
            Ok(event) => self.filter_event(event).map(Ok),
            Err(e) => Some(Err(e)),
        }
    }
}

//! In-memory [`ClusterStore`]
//!
//! Mirrors the API server rules the reconcile engine depends on:
//! `resourceVersion` optimistic concurrency, status written only through the
//! status subresource, `generation` bumped on non-status changes, and
//! owner-reference cascading delete.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use tokio::sync::Mutex;

use super::ClusterStore;
use crate::error::{Error, Result};

type Key = (String, String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    version: u64,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Cluster store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key(ar: &ApiResource, namespace: &str, name: &str) -> Key {
    (
        ar.api_version.clone(),
        ar.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(ar: &ApiResource, name: &str) -> Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", ar.kind, name))
}

/// Everything except status, the part of an object whose change bumps `generation`
fn without_status(obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

/// Equality-based label selector matching (`a=b,c=d` or bare `key` for existence)
fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let inner = self.inner.lock().await;
        Ok(inner.objects.get(&key(ar, namespace, name)).cloned())
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();

        let name = match (&obj.metadata.name, &obj.metadata.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{prefix}{version:0>5}"),
            (None, None) => return Err(Error::MissingObjectKey(".metadata.name")),
        };
        let k = key(ar, namespace, &name);
        if inner.objects.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", ar.kind, name),
            ));
        }

        let mut created = obj.clone();
        created.metadata.name = Some(name);
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("uid-{version}"));
        created.metadata.resource_version = Some(version);
        created.metadata.generation = Some(1);
        inner.objects.insert(k, created.clone());
        Ok(created)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let mut inner = self.inner.lock().await;
        let k = key(ar, namespace, &name);
        let stored = inner
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(ar, &name))?;

        if obj.metadata.resource_version != stored.metadata.resource_version {
            return Err(Error::Conflict {
                kind: ar.kind.clone(),
                name,
            });
        }

        let mut replaced = obj.clone();
        if let Some(map) = replaced.data.as_object_mut() {
            map.remove("status");
            if let Some(status) = stored.data.get("status") {
                map.insert("status".to_string(), status.clone());
            }
        }
        replaced.metadata.uid = stored.metadata.uid.clone();
        replaced.metadata.namespace = Some(namespace.to_string());
        let generation = stored.metadata.generation.unwrap_or(1);
        replaced.metadata.generation = Some(if without_status(&replaced) != without_status(&stored) {
            generation + 1
        } else {
            generation
        });
        replaced.metadata.resource_version = Some(inner.next_version());
        inner.objects.insert(k, replaced.clone());
        Ok(replaced)
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let mut inner = self.inner.lock().await;
        let k = key(ar, namespace, &name);
        let mut stored = inner
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(ar, &name))?;

        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(Error::Conflict {
                kind: ar.kind.clone(),
                name,
            });
        }

        if let Some(map) = stored.data.as_object_mut() {
            match obj.data.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        stored.metadata.resource_version = Some(inner.next_version());
        inner.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(removed) = inner.objects.remove(&key(ar, namespace, name)) else {
            return Ok(());
        };

        // Cascade to dependents, transitively.
        let mut orphaned_uids: Vec<String> = removed.metadata.uid.into_iter().collect();
        while let Some(uid) = orphaned_uids.pop() {
            let dependents: Vec<Key> = inner
                .objects
                .iter()
                .filter(|(_, o)| {
                    o.metadata
                        .owner_references
                        .as_ref()
                        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
                })
                .map(|(k, _)| k.clone())
                .collect();
            for k in dependents {
                if let Some(dependent) = inner.objects.remove(&k) {
                    orphaned_uids.extend(dependent.metadata.uid);
                }
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .iter()
            .filter(|((api_version, kind, ns, _), _)| {
                *api_version == ar.api_version && *kind == ar.kind && ns == namespace
            })
            .map(|(_, obj)| obj)
            .filter(|obj| matches_selector(obj, label_selector))
            .cloned()
            .collect())
    }
}

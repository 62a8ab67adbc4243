//! Cluster object store
//!
//! The reconcile engine talks to the API server only through the
//! [`ClusterStore`] trait. Objects cross the trait as [`DynamicObject`]s so
//! the trait stays object safe; the typed helpers in this module convert any
//! `kube::Resource` on the way in and out.
//!
//! - [`KubeStore`] is backed by a live `kube::Client`.
//! - [`MemoryStore`] keeps objects in memory with the same optimistic
//!   concurrency rules and is used by the test suite.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use kube::api::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// CRUD access to namespaced cluster objects keyed by (kind, namespace, name)
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object. `metadata.generateName` is honoured when `name` is unset.
    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace an object. Fails with [`Error::Conflict`] when the carried
    /// `resourceVersion` is stale.
    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace only the status subresource of an object
    async fn replace_status(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    /// List objects matching a label selector (`""` matches everything)
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;
}

/// Build the `ApiResource` for a statically typed kind
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Convert a typed object into its dynamic representation
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object back into a typed one
///
/// List responses may omit `apiVersion`/`kind` on items, so they are filled
/// in from the `ApiResource` before deserializing.
pub fn from_dynamic<K: DeserializeOwned>(ar: &ApiResource, mut obj: DynamicObject) -> Result<K> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

/// Fetch a typed object
pub async fn get<K>(store: &dyn ClusterStore, namespace: &str, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let ar = api_resource::<K>();
    match store.get(&ar, namespace, name).await? {
        Some(obj) => Ok(Some(from_dynamic(&ar, obj)?)),
        None => Ok(None),
    }
}

/// Create a typed object in the namespace carried by its metadata
pub async fn create<K>(store: &dyn ClusterStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let ar = api_resource::<K>();
    let namespace = namespace_of(obj)?;
    let created = store.create(&ar, &namespace, &to_dynamic(obj)?).await?;
    from_dynamic(&ar, created)
}

/// Replace a typed object, guarded by its `resourceVersion`
pub async fn replace<K>(store: &dyn ClusterStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let ar = api_resource::<K>();
    let namespace = namespace_of(obj)?;
    let replaced = store.replace(&ar, &namespace, &to_dynamic(obj)?).await?;
    from_dynamic(&ar, replaced)
}

/// Replace the status subresource of a typed object
pub async fn replace_status<K>(store: &dyn ClusterStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let ar = api_resource::<K>();
    let namespace = namespace_of(obj)?;
    let replaced = store
        .replace_status(&ar, &namespace, &to_dynamic(obj)?)
        .await?;
    from_dynamic(&ar, replaced)
}

/// Delete a typed object
pub async fn delete<K>(store: &dyn ClusterStore, namespace: &str, name: &str) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    store.delete(&api_resource::<K>(), namespace, name).await
}

/// List typed objects by label selector
pub async fn list<K>(store: &dyn ClusterStore, namespace: &str, label_selector: &str) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let ar = api_resource::<K>();
    store
        .list(&ar, namespace, label_selector)
        .await?
        .into_iter()
        .map(|obj| from_dynamic(&ar, obj))
        .collect()
}

//! [`ClusterStore`] backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use super::ClusterStore;
use crate::error::{Error, Result};

/// Live cluster store using a `kube::Client`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

/// Map a 409 from the API server onto [`Error::Conflict`]
fn map_write_error(ar: &ApiResource, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 409 => Error::Conflict {
            kind: ar.kind.clone(),
            name: name.to_string(),
        },
        e => Error::KubeError(e),
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(ar, namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .clone()
            .or_else(|| obj.metadata.generate_name.clone())
            .unwrap_or_default();
        debug!("Creating {} {}/{}", ar.kind, namespace, name);
        self.api(ar, namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(ar, &name, e))
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object_name(obj)?;
        debug!("Replacing {} {}/{}", ar.kind, namespace, name);
        self.api(ar, namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(ar, name, e))
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object_name(obj)?;
        debug!("Replacing status of {} {}/{}", ar.kind, namespace, name);
        self.api(ar, namespace)
            .replace_status(name, &PostParams::default(), serde_json::to_vec(obj)?)
            .await
            .map_err(|e| map_write_error(ar, name, e))
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(ar, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(self.api(ar, namespace).list(&params).await?.items)
    }
}

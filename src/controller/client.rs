//! Kubernetes client seam for the CodeServer controller

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Pod, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::CodeServer;
use crate::error::{is_conflict, is_not_found};
use crate::Error;

/// Field manager recorded on every write the controller makes
pub const FIELD_MANAGER: &str = "codeserver-controller";

/// Trait abstracting Kubernetes client operations for CodeServer
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Getters map NotFound to `Ok(None)` and
/// deletes map it to `Ok(false)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a CodeServer
    async fn get_code_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CodeServer>, Error>;

    /// Replace the status subresource of a CodeServer
    ///
    /// The write carries the object's resourceVersion, so a stale copy fails
    /// with [`Error::Conflict`].
    async fn replace_code_server_status(&self, code_server: &CodeServer) -> Result<(), Error>;

    /// Fetch a Deployment
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Replace the pod-template containers of a Deployment, leaving the rest untouched
    async fn patch_deployment_containers(
        &self,
        namespace: &str,
        name: &str,
        containers: &[Container],
    ) -> Result<(), Error>;

    /// Delete a Deployment; returns false if it did not exist
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Fetch a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<(), Error>;

    /// Replace the containers of a Pod, leaving the rest untouched
    async fn patch_pod_containers(
        &self,
        namespace: &str,
        name: &str,
        containers: &[Container],
    ) -> Result<(), Error>;

    /// Delete a Pod; returns false if it did not exist
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Fetch a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    /// Apply a routing merge patch (ports and selector) to a Service
    ///
    /// The body comes from [`crate::workload::service_routing_patch`]; fields
    /// it does not mention, such as clusterIP, are left untouched.
    async fn patch_service_routing(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Delete a Service; returns false if it did not exist
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::validation(format!("{} has no namespace", obj.name_any())))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api::<K>(&namespace).create(&params, obj).await?;
        Ok(())
    }

    async fn merge_patch<K>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<bool, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(namespace, name, "already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_code_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CodeServer>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn replace_code_server_status(&self, code_server: &CodeServer) -> Result<(), Error> {
        let namespace = code_server.namespace().ok_or_else(|| {
            Error::validation(format!("CodeServer {} has no namespace", code_server.name_any()))
        })?;
        let data =
            serde_json::to_vec(code_server).map_err(|e| Error::serialization(e.to_string()))?;

        match self
            .api::<CodeServer>(&namespace)
            .replace_status(&code_server.name_any(), &PostParams::default(), data)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(Error::conflict(format!(
                "status of {}/{} changed since it was read",
                namespace,
                code_server.name_any()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.create(deployment).await
    }

    async fn patch_deployment_containers(
        &self,
        namespace: &str,
        name: &str,
        containers: &[Container],
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": { "template": { "spec": { "containers": containers } } }
        });
        self.merge_patch::<Deployment>(namespace, name, &patch).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        self.delete::<Deployment>(namespace, name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        self.create(pod).await
    }

    async fn patch_pod_containers(
        &self,
        namespace: &str,
        name: &str,
        containers: &[Container],
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "spec": { "containers": containers } });
        self.merge_patch::<Pod>(namespace, name, &patch).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        self.delete::<Pod>(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.create(service).await
    }

    async fn patch_service_routing(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        self.merge_patch::<Service>(namespace, name, patch).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        self.delete::<Service>(namespace, name).await
    }
}

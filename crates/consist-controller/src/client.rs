//! Kubernetes access used by the finalizer lifecycle manager.
//!
//! The framework only ever touches finalizers and annotations of employers
//! and employees, so the client surface is exactly those reads and patches.
//! Finalizer writes carry the `resourceVersion` they were computed from, so
//! a concurrent change turns into a 409 instead of a lost update.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use consist_common::Result;

use crate::cluster::{ClusterClients, ClusterRoute};
use crate::naming::FIELD_MANAGER;

/// Identity of an employer object
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EmployerKey {
    /// Resource kind, e.g. `Service`
    pub kind: String,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl fmt::Display for EmployerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of an employee pod on a specific cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EmployeeKey {
    /// Cluster holding the pod
    pub route: ClusterRoute,
    /// Namespace (always the employer's)
    pub namespace: String,
    /// Pod name on that cluster
    pub name: String,
}

impl fmt::Display for EmployeeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.route)
    }
}

/// Reads and patches of employer and employee objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsistKubeClient: Send + Sync {
    /// Latest metadata of an employer, `None` if it no longer exists
    async fn get_employer_meta(&self, key: &EmployerKey) -> Result<Option<ObjectMeta>>;

    /// Replace the employer's finalizers, guarded by `resource_version`
    async fn replace_employer_finalizers(
        &self,
        key: &EmployerKey,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()>;

    /// Set one employer annotation
    async fn patch_employer_annotation(
        &self,
        key: &EmployerKey,
        annotation: &str,
        value: &str,
    ) -> Result<()>;

    /// Fetch an employee pod, `None` if it does not exist
    async fn get_employee(&self, key: &EmployeeKey) -> Result<Option<Pod>>;

    /// Replace the pod's finalizers, guarded by `resource_version`
    async fn replace_employee_finalizers(
        &self,
        key: &EmployeeKey,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()>;

    /// Set one pod annotation
    async fn patch_employee_annotation(
        &self,
        key: &EmployeeKey,
        annotation: &str,
        value: &str,
    ) -> Result<()>;
}

/// Production client, generic over the employer resource type
pub struct KubeConsistClient<K> {
    clusters: ClusterClients,
    _employer: PhantomData<fn() -> K>,
}

impl<K> KubeConsistClient<K> {
    /// Create a client over the given clusters
    pub fn new(clusters: ClusterClients) -> Self {
        Self {
            clusters,
            _employer: PhantomData,
        }
    }
}

impl<K> KubeConsistClient<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + fmt::Debug,
{
    fn employers(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.clusters.hub().clone(), namespace)
    }

    fn pods(&self, key: &EmployeeKey) -> Result<Api<Pod>> {
        let client = self.clusters.client_for(&key.route)?;
        Ok(Api::namespaced(client, &key.namespace))
    }
}

fn finalizers_patch(finalizers: Vec<String>, resource_version: Option<String>) -> serde_json::Value {
    match resource_version {
        Some(rv) => json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": rv,
            }
        }),
        None => json!({
            "metadata": {
                "finalizers": finalizers,
            }
        }),
    }
}

fn annotation_patch(annotation: &str, value: &str) -> serde_json::Value {
    json!({
        "metadata": {
            "annotations": {
                annotation: value,
            }
        }
    })
}

#[async_trait]
impl<K> ConsistKubeClient for KubeConsistClient<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static,
{
    async fn get_employer_meta(&self, key: &EmployerKey) -> Result<Option<ObjectMeta>> {
        let employer = self.employers(&key.namespace).get_opt(&key.name).await?;
        Ok(employer.map(|e| e.meta().clone()))
    }

    async fn replace_employer_finalizers(
        &self,
        key: &EmployerKey,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let patch = finalizers_patch(finalizers, resource_version);
        self.employers(&key.namespace)
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_employer_annotation(
        &self,
        key: &EmployerKey,
        annotation: &str,
        value: &str,
    ) -> Result<()> {
        let patch = annotation_patch(annotation, value);
        self.employers(&key.namespace)
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_employee(&self, key: &EmployeeKey) -> Result<Option<Pod>> {
        Ok(self.pods(key)?.get_opt(&key.name).await?)
    }

    async fn replace_employee_finalizers(
        &self,
        key: &EmployeeKey,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let patch = finalizers_patch(finalizers, resource_version);
        self.pods(key)?
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_employee_annotation(
        &self,
        key: &EmployeeKey,
        annotation: &str,
        value: &str,
    ) -> Result<()> {
        let patch = annotation_patch(annotation, value);
        self.pods(key)?
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

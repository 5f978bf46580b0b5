//! Wrapper over the kube client for the object reads and writes shared by
//! the controllers and providers. Writes that race other writers carry the
//! observed `resourceVersion` and retry on conflict.

use crate::error::{Error, Result};
use crate::metrics::K8sApiMetrics;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use eniop_api::cninode::{CNINode, CNINodeSpec, Feature};
use eniop_api::security_group_policy::SecurityGroupPolicy;
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use tracing::{debug, info};

fn conflict_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default().with_max_times(4)
}

/// Kubernetes operations consumed by the rest of the system. The janitor
/// and controller tests substitute a scripted fake.
#[async_trait]
pub trait K8sApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount>;

    /// Pods scheduled on the node, from the API server's view.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Write the extended resource capacity on the node status unless it
    /// is already advertised with the same value.
    async fn advertise_capacity_if_not_set(
        &self,
        node_name: &str,
        resource_name: &str,
        capacity: usize,
    ) -> Result<()>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn get_cninode(&self, name: &str) -> Result<CNINode>;

    async fn create_cninode(&self, node: &Node, features: Vec<Feature>) -> Result<CNINode>;

    /// Compare and swap status update over the paired copies; the new
    /// object must derive from the old one.
    async fn update_cninode_status(&self, old: &CNINode, new: &CNINode) -> Result<CNINode>;

    async fn delete_cninode(&self, name: &str) -> Result<()>;

    async fn list_cninodes(&self) -> Result<Vec<CNINode>>;

    async fn list_security_group_policies(
        &self,
        namespace: &str,
    ) -> Result<Vec<SecurityGroupPolicy>>;
}

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    metrics: K8sApiMetrics,
}

impl K8sClient {
    pub fn new(client: Client, meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            client,
            metrics: K8sApiMetrics::new(meter),
        }
    }
}

#[async_trait]
impl K8sApi for K8sClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(|e| Error::kube(format!("failed to get pod {namespace}/{name}"), e))
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(|e| {
                Error::kube(format!("failed to get service account {namespace}/{name}"), e)
            })
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&params)
            .await
            .map_err(|e| Error::kube(format!("failed to list pods on node {node_name}"), e))?;
        Ok(pods.items)
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.metrics.annotate_pod_inc(key);
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        (|| async {
            let pod = api
                .get(name)
                .await
                .map_err(|e| Error::kube(format!("failed to get pod {namespace}/{name}"), e))?;
            let patch = serde_json::json!({
                "metadata": {
                    "resourceVersion": pod.metadata.resource_version,
                    "annotations": annotations,
                }
            });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| {
                    Error::kube(format!("failed to annotate pod {namespace}/{name}"), e)
                })?;
            Ok(())
        })
        .retry(conflict_backoff())
        .when(Error::is_conflict)
        .await
        .inspect_err(|_| self.metrics.annotate_pod_error_inc(key))?;
        debug!(msg = "annotated pod", namespace, name, key);
        Ok(())
    }

    async fn advertise_capacity_if_not_set(
        &self,
        node_name: &str,
        resource_name: &str,
        capacity: usize,
    ) -> Result<()> {
        let api = Api::<Node>::all(self.client.clone());
        let mut capacity_patch = serde_json::Map::new();
        capacity_patch.insert(
            resource_name.to_string(),
            serde_json::Value::String(capacity.to_string()),
        );
        (|| async {
            let node = api
                .get(node_name)
                .await
                .map_err(|e| Error::kube(format!("failed to get node {node_name}"), e))?;

            let existing = node
                .status
                .as_ref()
                .and_then(|s| s.capacity.as_ref())
                .and_then(|c| c.get(resource_name));
            if existing == Some(&Quantity(capacity.to_string())) {
                return Ok(());
            }

            // Capacity doesn't match the expected capacity, need to
            // advertise again.
            self.metrics.advertise_resource_inc(resource_name);
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": node.metadata.resource_version },
                "status": {
                    "capacity": capacity_patch
                }
            });
            api.patch_status(node_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| {
                    Error::kube(
                        format!("failed to advertise {resource_name} on node {node_name}"),
                        e,
                    )
                })?;
            info!(msg = "advertised capacity", node = node_name, resource = resource_name, capacity);
            Ok(())
        })
        .retry(conflict_backoff())
        .when(Error::is_conflict)
        .await
        .inspect_err(|_| self.metrics.advertise_resource_error_inc(resource_name))
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        Api::<Node>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|e| Error::kube(format!("failed to get node {name}"), e))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::kube("failed to list nodes".to_string(), e))?;
        Ok(nodes.items)
    }

    async fn get_cninode(&self, name: &str) -> Result<CNINode> {
        Api::<CNINode>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|e| Error::kube(format!("failed to get CNINode {name}"), e))
    }

    async fn create_cninode(&self, node: &Node, features: Vec<Feature>) -> Result<CNINode> {
        let name = node.metadata.name.clone().ok_or_else(|| {
            Error::MissingData("node has no name in its metadata".to_string())
        })?;
        let cninode = CNINode {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                // Owned by the node; the janitor handles objects that
                // outlive it.
                owner_references: Some(vec![OwnerReference {
                    api_version: Node::api_version(&()).to_string(),
                    kind: Node::kind(&()).to_string(),
                    name: name.clone(),
                    uid: node.metadata.uid.clone().unwrap_or_default(),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            spec: CNINodeSpec { features },
            status: None,
        };
        Api::<CNINode>::all(self.client.clone())
            .create(&PostParams::default(), &cninode)
            .await
            .map_err(|e| Error::kube(format!("failed to create CNINode {name}"), e))
    }

    async fn update_cninode_status(&self, old: &CNINode, new: &CNINode) -> Result<CNINode> {
        let name = old.metadata.name.clone().ok_or_else(|| {
            Error::MissingData("CNINode has no name in its metadata".to_string())
        })?;
        let mut new = new.clone();
        new.metadata.resource_version = old.metadata.resource_version.clone();
        let data = serde_json::to_vec(&new).map_err(|e| {
            Error::SerializationError(format!("failed to serialize CNINode {name}"), e)
        })?;
        Api::<CNINode>::all(self.client.clone())
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::kube(format!("failed to update CNINode {name} status"), e))
    }

    async fn delete_cninode(&self, name: &str) -> Result<()> {
        match Api::<CNINode>::all(self.client.clone())
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::kube(format!("failed to delete CNINode {name}"), e)),
        }
    }

    async fn list_cninodes(&self) -> Result<Vec<CNINode>> {
        let cninodes = Api::<CNINode>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::kube("failed to list CNINodes".to_string(), e))?;
        Ok(cninodes.items)
    }

    async fn list_security_group_policies(
        &self,
        namespace: &str,
    ) -> Result<Vec<SecurityGroupPolicy>> {
        let policies = Api::<SecurityGroupPolicy>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                Error::kube(
                    format!("failed to list SecurityGroupPolicies in {namespace}"),
                    e,
                )
            })?;
        Ok(policies.items)
    }
}

//! Node manager: owns the per node contexts and drives the resource
//! providers through a single worker so node lifecycle transitions are
//! serialised.

use std::collections::HashMap;
use std::sync::Arc;

use eniop_api::cninode::{Feature, FeatureName};
use eniop_aws::helper::Ec2Api;
use eniop_aws::instance::{Ec2Instance, OsFamily};
use eniop_k8s_util::wrapper::K8sApi;
use eniop_operator::config::{RESOURCE_NAME_POD_ENI, WORK_QUEUE_CAPACITY, WORKER_MAX_REQUEUE};
use eniop_operator::error::{Error, Result};
use eniop_operator::metrics::WorkerMetrics;
use eniop_operator::provider::ResourceProvider;
use eniop_operator::worker::{WorkResult, WorkerPool};
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::runtime::events::{Event, EventType, Recorder};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::node::NodeContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct NodeJob {
    pub node_name: String,
    pub op: NodeOp,
}

pub struct NodeManager {
    k8s: Arc<dyn K8sApi>,
    ec2: Arc<dyn Ec2Api>,
    providers: Vec<Arc<dyn ResourceProvider>>,
    recorder: Recorder,
    nodes: RwLock<HashMap<String, Arc<NodeContext>>>,
    worker: Arc<WorkerPool<NodeJob>>,
}

fn node_reference(node: &Node) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: node.metadata.name.clone(),
        uid: node.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

impl NodeManager {
    pub fn new(
        k8s: Arc<dyn K8sApi>,
        ec2: Arc<dyn Ec2Api>,
        providers: Vec<Arc<dyn ResourceProvider>>,
        recorder: Recorder,
        worker_metrics: Arc<WorkerMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            k8s,
            ec2,
            providers,
            recorder,
            nodes: RwLock::new(HashMap::new()),
            worker: Arc::new(WorkerPool::new(
                "node",
                1,
                WORKER_MAX_REQUEUE,
                WORK_QUEUE_CAPACITY,
                shutdown,
                worker_metrics,
            )),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let manager = Arc::clone(&self);
        self.worker
            .start(move |job| {
                let manager = Arc::clone(&manager);
                async move { manager.process(job).await }
            })
            .await
    }

    pub fn add_node(&self, node_name: &str) {
        self.worker.submit(NodeJob {
            node_name: node_name.to_string(),
            op: NodeOp::Add,
        });
    }

    pub fn update_node(&self, node_name: &str) {
        self.worker.submit(NodeJob {
            node_name: node_name.to_string(),
            op: NodeOp::Update,
        });
    }

    pub fn delete_node(&self, node_name: &str) {
        self.worker.submit(NodeJob {
            node_name: node_name.to_string(),
            op: NodeOp::Delete,
        });
    }

    pub fn get_node(&self, node_name: &str) -> Option<Arc<NodeContext>> {
        self.nodes.read().get(node_name).cloned()
    }

    pub fn managed_node_names(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: String) {
        if let Err(e) = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.to_string(),
                    note: Some(note),
                    action: "NodeResourceManagement".to_string(),
                    secondary: None,
                },
                reference,
            )
            .await
        {
            warn!(msg = "failed to publish node event", reason, %e);
        }
    }

    async fn process(&self, job: NodeJob) -> Result<WorkResult> {
        match job.op {
            NodeOp::Add | NodeOp::Update => self.add_or_update(&job.node_name).await,
            NodeOp::Delete => self.remove(&job.node_name).await,
        }
    }

    async fn add_or_update(&self, node_name: &str) -> Result<WorkResult> {
        let node = match self.k8s.get_node(node_name).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                info!(msg = "node is gone, dropping the job", node = node_name);
                return Ok(WorkResult::Done);
            }
            Err(e) => {
                return Err(Error::K8sApiError("failed to get the node".to_string(), e));
            }
        };
        let reference = node_reference(&node);

        if let Some(context) = self.get_node(node_name) {
            // Known node: refresh the advertised capacities only. The
            // provider state carries in-flight work and must not be
            // rebuilt.
            for provider in &self.providers {
                if provider.is_instance_supported(context.as_ref()) {
                    provider.update_resource_capacity(context.as_ref()).await?;
                }
            }
            return Ok(WorkResult::Done);
        }

        let context = match NodeContext::new(&self.ec2, &node).await {
            Ok(context) => Arc::new(context),
            Err(Error::MissingData(reason)) => {
                // Not an EC2 backed node, nothing to manage.
                info!(msg = "leaving node unmanaged", node = node_name, reason);
                return Ok(WorkResult::Done);
            }
            Err(e) => return Err(e),
        };
        if !context.is_supported() {
            self.publish(
                &reference,
                EventType::Warning,
                "Unsupported",
                format!(
                    "The instance type {} is not supported for VPC resource management",
                    context.instance_type()
                ),
            )
            .await;
            return Ok(WorkResult::Done);
        }

        for provider in &self.providers {
            if !provider.is_instance_supported(context.as_ref()) {
                continue;
            }
            provider.update_resource_capacity(context.as_ref()).await?;
            match provider.init_resource(context.as_ref()).await {
                Ok(()) => {
                    if provider.resource_name() == RESOURCE_NAME_POD_ENI {
                        self.publish(
                            &reference,
                            EventType::Normal,
                            "NodeTrunkInitiated",
                            "The node has a trunk interface ready for branch interfaces"
                                .to_string(),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    if provider.resource_name() == RESOURCE_NAME_POD_ENI {
                        self.publish(
                            &reference,
                            EventType::Warning,
                            "NodeTrunkFailedInit",
                            format!("The node failed to initialize its trunk interface: {e}"),
                        )
                        .await;
                    }
                    return Err(e);
                }
            }
        }

        if context.os() == OsFamily::Linux {
            self.ensure_cninode(&node, &reference).await;
        }

        self.nodes
            .write()
            .insert(node_name.to_string(), context);
        info!(msg = "node is managed", node = node_name);
        Ok(WorkResult::Done)
    }

    async fn ensure_cninode(&self, node: &Node, reference: &ObjectReference) {
        let node_name = node.metadata.name.as_deref().unwrap_or_default();
        match self.k8s.get_cninode(node_name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                let features = vec![Feature {
                    name: Some(FeatureName::SecurityGroupsForPods),
                    value: None,
                }];
                match self.k8s.create_cninode(node, features).await {
                    Ok(_) => {
                        self.publish(
                            reference,
                            EventType::Normal,
                            "CNINodeCreation",
                            format!("Created the CNINode object for node {node_name}"),
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(msg = "failed to create the CNINode", node = node_name, %e);
                    }
                }
            }
            Err(e) => warn!(msg = "failed to look up the CNINode", node = node_name, %e),
        }
    }

    async fn remove(&self, node_name: &str) -> Result<WorkResult> {
        let Some(context) = self.nodes.write().remove(node_name) else {
            return Ok(WorkResult::Done);
        };
        for provider in &self.providers {
            if provider.is_instance_supported(context.as_ref()) {
                if let Err(e) = provider.de_init_resource(context.as_ref()).await {
                    warn!(msg = "failed to tear down provider state", node = node_name, %e);
                }
            }
        }
        if let Err(e) = self.k8s.delete_cninode(node_name).await {
            warn!(msg = "failed to delete the paired CNINode", node = node_name, %e);
        }
        info!(msg = "node context removed", node = node_name);
        Ok(WorkResult::Done)
    }
}

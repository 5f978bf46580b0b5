//! Branch interface provider: one [`TrunkEni`] per managed Linux node,
//! wired to a single worker so the periodic delete queue drain serialises
//! with the other cloud mutations for the node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eniop_api::cninode::WarmBranchENI;
use eniop_aws::helper::Ec2Api;
use eniop_aws::instance::{Ec2Instance, OsFamily};
use eniop_aws::limits;
use eniop_k8s_util::cninode::CNINodeHandler;
use eniop_k8s_util::sgp::security_groups_for_pod;
use eniop_k8s_util::wrapper::K8sApi;
use eniop_operator::config::{COOL_DOWN_PERIOD, RESOURCE_NAME_POD_ENI};
use eniop_operator::error::{Error, Result};
use eniop_operator::pool::{Operation, WarmPoolJob};
use eniop_operator::provider::{PodResourceHandler, ResourceProvider, requested_resource_count};
use eniop_operator::worker::{WorkResult, WorkerPool};
use k8s_openapi::api::core::v1::Pod;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::trunk::{EniDetails, TrunkEni, annotation_value};

pub struct BranchEniProvider {
    k8s: Arc<dyn K8sApi>,
    ec2: Arc<dyn Ec2Api>,
    cninode: CNINodeHandler,
    worker: Arc<WorkerPool<WarmPoolJob>>,
    trunks: RwLock<HashMap<String, Arc<TrunkEni>>>,
}

impl BranchEniProvider {
    pub fn new(
        k8s: Arc<dyn K8sApi>,
        ec2: Arc<dyn Ec2Api>,
        worker: Arc<WorkerPool<WarmPoolJob>>,
    ) -> Self {
        Self {
            cninode: CNINodeHandler::new(Arc::clone(&k8s)),
            k8s,
            ec2,
            worker,
            trunks: RwLock::new(HashMap::new()),
        }
    }

    /// Launch the worker draining this provider's job queue.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let provider = Arc::clone(&self);
        self.worker
            .start(move |job| {
                let provider = Arc::clone(&provider);
                async move { provider.process_async_job(job).await }
            })
            .await
    }

    fn trunk_for(&self, node_name: &str) -> Result<Arc<TrunkEni>> {
        self.trunks
            .read()
            .get(node_name)
            .cloned()
            .ok_or_else(|| Error::NodeNotReady(node_name.to_string()))
    }

    fn pod_node_name(pod: &Pod) -> Result<&str> {
        pod.spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            .ok_or_else(|| Error::MissingData("pod has no node name in its spec".to_string()))
    }

    fn warm_branch_enis(branches: &[EniDetails]) -> Vec<WarmBranchENI> {
        branches
            .iter()
            .map(|eni| WarmBranchENI {
                id: eni.id.clone(),
                mac_addr: eni.mac_address.clone(),
                ipv4_addr: eni.ipv4_addr.clone(),
                ipv6_addr: eni.ipv6_addr.clone().unwrap_or_default(),
                vlan_id: eni.vlan_id as i64,
                subnet_cidr: eni.subnet_cidr.clone().unwrap_or_default(),
                subnet_v6_cidr: eni.subnet_v6_cidr.clone().unwrap_or_default(),
            })
            .collect()
    }

    async fn security_groups_for(&self, pod: &Pod) -> Result<Vec<String>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let service_account_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.as_deref())
            .unwrap_or("default");

        let service_account = self
            .k8s
            .get_service_account(namespace, service_account_name)
            .await
            .map_err(|e| Error::K8sApiError("failed to get the service account".to_string(), e))?;
        let policies = self
            .k8s
            .list_security_group_policies(namespace)
            .await
            .map_err(|e| {
                Error::K8sApiError("failed to list SecurityGroupPolicies".to_string(), e)
            })?;
        Ok(security_groups_for_pod(pod, &service_account, &policies))
    }
}

#[async_trait]
impl ResourceProvider for BranchEniProvider {
    fn resource_name(&self) -> &'static str {
        RESOURCE_NAME_POD_ENI
    }

    async fn init_resource(&self, instance: &dyn Ec2Instance) -> Result<()> {
        let node_name = instance.name().to_string();
        let trunk = Arc::new(TrunkEni::new(
            Arc::clone(&self.ec2),
            &node_name,
            instance.instance_id(),
            instance.subnet_id(),
            instance.subnet_cidr_block().map(str::to_string),
            instance.subnet_v6_cidr_block().map(str::to_string),
            instance.security_groups(),
        ));

        let pods = self
            .k8s
            .list_pods_on_node(&node_name)
            .await
            .map_err(|e| Error::K8sApiError("failed to list pods on the node".to_string(), e))?;
        trunk.init_trunk(instance, &pods).await?;

        self.trunks.write().insert(node_name.clone(), trunk);
        info!(msg = "initialized the branch interface provider", node = node_name);

        // Kick off the periodic delete queue drain for the node.
        self.submit_async_job(WarmPoolJob::process_delete_queue(&node_name));
        Ok(())
    }

    async fn de_init_resource(&self, instance: &dyn Ec2Instance) -> Result<()> {
        self.trunks.write().remove(instance.name());
        Ok(())
    }

    async fn update_resource_capacity(&self, instance: &dyn Ec2Instance) -> Result<()> {
        let capacity = limits::branch_limit(instance.instance_type()).unwrap_or(0);
        self.k8s
            .advertise_capacity_if_not_set(instance.name(), RESOURCE_NAME_POD_ENI, capacity)
            .await
            .map_err(|e| Error::K8sApiError("failed to advertise capacity".to_string(), e))
    }

    fn is_instance_supported(&self, instance: &dyn Ec2Instance) -> bool {
        instance.os() == OsFamily::Linux
            && limits::branch_limit(instance.instance_type()).unwrap_or(0) > 0
    }

    fn submit_async_job(&self, job: WarmPoolJob) {
        self.worker.submit(job);
    }

    async fn process_async_job(&self, job: WarmPoolJob) -> Result<WorkResult> {
        match job.operation {
            Operation::ProcessDeleteQueue => {
                let trunk = match self.trunk_for(&job.node_name) {
                    Ok(trunk) => trunk,
                    Err(_) => {
                        // Node is gone, retire the periodic job with it.
                        info!(
                            msg = "forgetting the delete queue job",
                            node = job.node_name
                        );
                        return Ok(WorkResult::Done);
                    }
                };
                // Repair drift first: pods whose delete event was missed
                // get their branches queued here.
                match self.k8s.list_pods_on_node(&job.node_name).await {
                    Ok(pods) => trunk.reconcile(&pods)?,
                    Err(e) => {
                        warn!(msg = "skipping the mapping reconcile pass",
                            node = job.node_name, %e);
                    }
                }
                trunk.delete_cooled_down_enis().await;
                Ok(WorkResult::RequeueAfter(COOL_DOWN_PERIOD))
            }
            _ => Ok(WorkResult::Done),
        }
    }
}

#[async_trait]
impl PodResourceHandler for BranchEniProvider {
    fn resource_name(&self) -> &'static str {
        RESOURCE_NAME_POD_ENI
    }

    async fn handle_pod_create(&self, pod: &Pod) -> Result<()> {
        let count = requested_resource_count(pod, RESOURCE_NAME_POD_ENI);
        if count == 0 {
            return Ok(());
        }
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let node_name = Self::pod_node_name(pod)?;
        let trunk = self.trunk_for(node_name)?;

        if trunk.branches_for_pod(namespace, name).is_some() {
            // Repeat create event, the annotation write may have raced the
            // informer; nothing to do.
            return Ok(());
        }

        let security_groups = self.security_groups_for(pod).await?;
        let branches = trunk
            .create_and_associate_branch_enis(pod, security_groups, count)
            .await?;

        let value = annotation_value(&branches)?;
        self.k8s
            .annotate_pod(namespace, name, RESOURCE_NAME_POD_ENI, &value)
            .await
            .map_err(|e| Error::K8sApiError("failed to annotate the pod".to_string(), e))?;

        if let Err(e) = self
            .cninode
            .add_branch_enis(node_name, &Self::warm_branch_enis(&branches))
            .await
        {
            warn!(msg = "failed to record branches on the CNINode", node = node_name, %e);
        }
        Ok(())
    }

    async fn handle_pod_delete(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let node_name = Self::pod_node_name(pod)?;
        let trunk = match self.trunk_for(node_name) {
            Ok(trunk) => trunk,
            // Node context already torn down, interfaces go with the node.
            Err(_) => return Ok(()),
        };

        let branch_ids: Vec<String> = trunk
            .branches_for_pod(namespace, name)
            .unwrap_or_default()
            .iter()
            .map(|eni| eni.id.clone())
            .collect();

        match trunk.mark_pod_being_deleted(uid, namespace, name) {
            Ok(()) => {}
            Err(Error::StaleEvent { cached, received }) => {
                // Delete event for an older pod with the same name.
                info!(msg = "dropping stale pod delete", pod = name, cached, received);
                return Ok(());
            }
            Err(Error::MissingData(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        trunk.push_branch_enis_to_cooldown_queue(namespace, name)?;

        if !branch_ids.is_empty() {
            if let Err(e) = self.cninode.delete_branch_enis(node_name, &branch_ids).await {
                warn!(msg = "failed to remove branches from the CNINode", node = node_name, %e);
            }
        }
        Ok(())
    }
}

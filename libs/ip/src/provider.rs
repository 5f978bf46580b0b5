//! Warm pool driven provider for secondary private IPv4 addresses on
//! Windows nodes. All cloud mutations for the resource run on a single
//! worker, so pool updates and EC2 calls are serialised per node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eniop_aws::helper::Ec2Api;
use eniop_aws::instance::{Ec2Instance, OsFamily};
use eniop_aws::limits;
use eniop_k8s_util::wrapper::K8sApi;
use eniop_operator::config::{COOL_DOWN_PERIOD, RESOURCE_NAME_IPV4_ADDRESS};
use eniop_operator::error::{Error, Result};
use eniop_operator::pool::{Operation, ResourcePool, WarmPoolConfig, WarmPoolJob};
use eniop_operator::provider::{PodResourceHandler, ResourceProvider, requested_resource_count};
use eniop_operator::worker::{WorkResult, WorkerPool};
use k8s_openapi::api::core::v1::Pod;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::eni::EniManager;

struct InstanceState {
    eni_manager: AsyncMutex<EniManager>,
    pool: Mutex<ResourcePool>,
}

pub struct Ipv4Provider {
    k8s: Arc<dyn K8sApi>,
    ec2: Arc<dyn Ec2Api>,
    config: WarmPoolConfig,
    worker: Arc<WorkerPool<WarmPoolJob>>,
    instances: RwLock<HashMap<String, Arc<InstanceState>>>,
}

/// Schedulable address count for the node. Windows serves addresses from
/// the primary interface only.
fn capacity(instance_type: &str, os: OsFamily) -> usize {
    let Some(instance_limits) = limits::limits_for(instance_type) else {
        return 0;
    };
    let per_interface = instance_limits.ipv4_per_interface.saturating_sub(1);
    match os {
        OsFamily::Windows => per_interface,
        OsFamily::Linux => per_interface * instance_limits.interfaces,
    }
}

impl Ipv4Provider {
    pub fn new(
        k8s: Arc<dyn K8sApi>,
        ec2: Arc<dyn Ec2Api>,
        config: WarmPoolConfig,
        worker: Arc<WorkerPool<WarmPoolJob>>,
    ) -> Self {
        Self {
            k8s,
            ec2,
            config,
            worker,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let provider = Arc::clone(&self);
        self.worker
            .start(move |job| {
                let provider = Arc::clone(&provider);
                async move { provider.process_async_job(job).await }
            })
            .await
    }

    fn state_for(&self, node_name: &str) -> Option<Arc<InstanceState>> {
        self.instances.read().get(node_name).cloned()
    }

    fn submit_if_required(&self, job: WarmPoolJob) {
        if job.operation != Operation::ReconcileNotRequired {
            self.submit_async_job(job);
        }
    }

    fn update_pool_and_reconcile(
        &self,
        state: &InstanceState,
        job: &WarmPoolJob,
        did_succeed: bool,
    ) {
        let next = {
            let mut pool = state.pool.lock();
            if pool.update_pool(job, did_succeed) {
                Some(pool.reconcile_pool())
            } else {
                None
            }
        };
        if let Some(job) = next {
            self.submit_if_required(job);
        }
    }

    async fn create_addresses_and_update_pool(&self, mut job: WarmPoolJob) {
        let Some(state) = self.state_for(&job.node_name) else {
            error!(msg = "no instance state for create job", node = job.node_name);
            return;
        };
        let (created, result) = {
            let mut manager = state.eni_manager.lock().await;
            manager.create_ipv4_addresses(job.resource_count, &self.ec2).await
        };
        let did_succeed = match result {
            Ok(()) => true,
            Err(e) => {
                error!(msg = "failed to create all of the requested addresses",
                    node = job.node_name, created = created.len(), %e);
                false
            }
        };
        job.resources = created;
        self.update_pool_and_reconcile(&state, &job, did_succeed);
    }

    async fn delete_addresses_and_update_pool(&self, mut job: WarmPoolJob) {
        let Some(state) = self.state_for(&job.node_name) else {
            error!(msg = "no instance state for delete job", node = job.node_name);
            return;
        };
        let (failed, result) = {
            let mut manager = state.eni_manager.lock().await;
            manager.delete_ipv4_addresses(&job.resources, &self.ec2).await
        };
        let did_succeed = match result {
            Ok(()) => true,
            Err(e) => {
                error!(msg = "failed to delete some addresses",
                    node = job.node_name, failed = failed.len(), %e);
                false
            }
        };
        job.resources = failed;
        self.update_pool_and_reconcile(&state, &job, did_succeed);
    }

    async fn process_delete_queue(&self, job: &WarmPoolJob) -> WorkResult {
        let Some(state) = self.state_for(&job.node_name) else {
            info!(msg = "forgetting the cool down queue job", node = job.node_name);
            return WorkResult::Done;
        };
        let (to_delete, next) = {
            let mut pool = state.pool.lock();
            let to_delete = pool.process_cooldown_queue(COOL_DOWN_PERIOD);
            (to_delete, pool.reconcile_pool())
        };
        if !to_delete.is_empty() {
            self.submit_async_job(WarmPoolJob {
                node_name: job.node_name.clone(),
                operation: Operation::Delete,
                resource_count: to_delete.len(),
                resources: to_delete,
            });
        }
        self.submit_if_required(next);
        WorkResult::RequeueAfter(COOL_DOWN_PERIOD)
    }
}

#[async_trait]
impl ResourceProvider for Ipv4Provider {
    fn resource_name(&self) -> &'static str {
        RESOURCE_NAME_IPV4_ADDRESS
    }

    async fn init_resource(&self, instance: &dyn Ec2Instance) -> Result<()> {
        let node_name = instance.name().to_string();
        let instance_limits = limits::limits_for(instance.instance_type()).ok_or_else(|| {
            Error::Invalid(format!(
                "unsupported instance type {}",
                instance.instance_type()
            ))
        })?;

        let mut eni_manager = EniManager::new(
            instance.instance_id(),
            instance.subnet_id(),
            instance_limits,
        );
        let present = eni_manager.init_resources(&self.ec2).await?;

        let pods = self
            .k8s
            .list_pods_on_node(&node_name)
            .await
            .map_err(|e| Error::K8sApiError("failed to list pods on the node".to_string(), e))?;

        let mut used: HashMap<String, String> = HashMap::new();
        for pod in &pods {
            let Some(annotations) = pod.metadata.annotations.as_ref() else {
                continue;
            };
            let Some(address) = annotations.get(RESOURCE_NAME_IPV4_ADDRESS) else {
                continue;
            };
            let uid = pod.metadata.uid.clone().unwrap_or_default();
            used.insert(uid, address.clone());
        }

        let warm: Vec<String> = present
            .into_iter()
            .filter(|ip| !used.values().any(|assigned| assigned == ip))
            .collect();

        let node_capacity = capacity(instance.instance_type(), instance.os());
        let pool = ResourcePool::new(
            &node_name,
            self.config.clone(),
            used,
            warm,
            node_capacity,
        );

        let state = Arc::new(InstanceState {
            eni_manager: AsyncMutex::new(eni_manager),
            pool: Mutex::new(pool),
        });
        info!(
            msg = "initialized the resource provider for secondary addresses",
            node = node_name,
            capacity = node_capacity
        );

        let first = state.pool.lock().reconcile_pool();
        self.instances.write().insert(node_name.clone(), state);
        self.submit_if_required(first);

        // Periodic cool down queue processing for the node.
        self.submit_async_job(WarmPoolJob::process_delete_queue(&node_name));
        Ok(())
    }

    async fn de_init_resource(&self, instance: &dyn Ec2Instance) -> Result<()> {
        self.instances.write().remove(instance.name());
        Ok(())
    }

    async fn update_resource_capacity(&self, instance: &dyn Ec2Instance) -> Result<()> {
        let capacity = capacity(instance.instance_type(), instance.os());
        self.k8s
            .advertise_capacity_if_not_set(instance.name(), RESOURCE_NAME_IPV4_ADDRESS, capacity)
            .await
            .map_err(|e| Error::K8sApiError("failed to advertise capacity".to_string(), e))
    }

    fn is_instance_supported(&self, instance: &dyn Ec2Instance) -> bool {
        instance.os() == OsFamily::Windows
    }

    fn submit_async_job(&self, job: WarmPoolJob) {
        self.worker.submit(job);
    }

    async fn process_async_job(&self, job: WarmPoolJob) -> Result<WorkResult> {
        match job.operation {
            Operation::Create => {
                self.create_addresses_and_update_pool(job).await;
                Ok(WorkResult::Done)
            }
            Operation::Delete => {
                self.delete_addresses_and_update_pool(job).await;
                Ok(WorkResult::Done)
            }
            Operation::ProcessDeleteQueue => Ok(self.process_delete_queue(&job).await),
            Operation::ReconcileNotRequired => Ok(WorkResult::Done),
        }
    }
}

#[async_trait]
impl PodResourceHandler for Ipv4Provider {
    fn resource_name(&self) -> &'static str {
        RESOURCE_NAME_IPV4_ADDRESS
    }

    async fn handle_pod_create(&self, pod: &Pod) -> Result<()> {
        if requested_resource_count(pod, RESOURCE_NAME_IPV4_ADDRESS) == 0 {
            return Ok(());
        }
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            .ok_or_else(|| Error::MissingData("pod has no node name in its spec".to_string()))?;

        let state = self
            .state_for(node_name)
            .ok_or_else(|| Error::NodeNotReady(node_name.to_string()))?;

        let (address, next) = {
            let mut pool = state.pool.lock();
            let address = pool.assign_resource(uid)?;
            (address, pool.reconcile_pool())
        };
        self.submit_if_required(next);

        if let Err(e) = self
            .k8s
            .annotate_pod(namespace, name, RESOURCE_NAME_IPV4_ADDRESS, &address)
            .await
        {
            // Hand the address back, the pod never learned about it.
            let freed = state.pool.lock().free_resource(uid);
            warn!(msg = "failed to annotate the pod, returning the address",
                pod = name, ?freed, %e);
            return Err(Error::K8sApiError(
                "failed to annotate the pod".to_string(),
                e,
            ));
        }
        Ok(())
    }

    async fn handle_pod_delete(&self, pod: &Pod) -> Result<()> {
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
        else {
            return Ok(());
        };
        let Some(state) = self.state_for(node_name) else {
            return Ok(());
        };

        match state.pool.lock().free_resource(uid) {
            Ok(address) => {
                info!(msg = "returned the pod's address to the cool down queue",
                    node = node_name, address);
            }
            Err(Error::UnknownResource(..)) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capacity_formula() {
        // Windows: serve from the primary interface only.
        assert_eq!(capacity("m5.large", OsFamily::Windows), 9);
        // Linux: every interface contributes.
        assert_eq!(capacity("m5.large", OsFamily::Linux), 27);
        assert_eq!(capacity("unknown.type", OsFamily::Windows), 0);
    }
}

use async_trait::async_trait;

use eniop_aws::instance::Ec2Instance;
use k8s_openapi::api::core::v1::Pod;

use crate::error::Result;
use crate::pool::WarmPoolJob;
use crate::worker::WorkResult;

/// Capability set of a per node resource provider. One provider manages
/// branch interfaces for Linux nodes, another secondary IPv4 addresses for
/// Windows nodes; the node manager drives them without knowing which is
/// which.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Extended resource name the provider advertises and serves.
    fn resource_name(&self) -> &'static str;

    /// Build the per node state, reconciling the cloud view against the
    /// pods already running on the node.
    async fn init_resource(&self, instance: &dyn Ec2Instance) -> Result<()>;

    /// Drop the per node state. Cloud resources attached to the instance
    /// are deleted with it by the termination policy.
    async fn de_init_resource(&self, instance: &dyn Ec2Instance) -> Result<()>;

    /// Advertise the extended resource capacity on the node object.
    async fn update_resource_capacity(&self, instance: &dyn Ec2Instance) -> Result<()>;

    fn is_instance_supported(&self, instance: &dyn Ec2Instance) -> bool;

    /// Queue a job on the provider's worker pool.
    fn submit_async_job(&self, job: WarmPoolJob);

    /// Execute a job; invoked from the worker pool, never directly.
    async fn process_async_job(&self, job: WarmPoolJob) -> Result<WorkResult>;
}

/// Total amount of the extended resource requested across the pod's
/// containers. Pods that do not request it return 0.
pub fn requested_resource_count(pod: &Pod, resource_name: &str) -> usize {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|container| {
                    container
                        .resources
                        .as_ref()?
                        .requests
                        .as_ref()?
                        .get(resource_name)
                })
                .filter_map(|quantity| quantity.0.parse::<usize>().ok())
                .sum()
        })
        .unwrap_or(0)
}

/// Pod facing side of a provider, driven by the pod reconciler. Keyed by
/// the extended resource name the pod requests.
#[async_trait]
pub trait PodResourceHandler: Send + Sync {
    fn resource_name(&self) -> &'static str;

    /// Allocate the resource for a scheduled pod and record it on the pod
    /// annotation.
    async fn handle_pod_create(&self, pod: &Pod) -> Result<()>;

    /// Release the pod's resource into the cool down queue.
    async fn handle_pod_delete(&self, pod: &Pod) -> Result<()>;
}

//! Typed, metric instrumented facade over the EC2 API. Every operation
//! acquires a rate limiter token, records call count and latency, and maps
//! failures to [`Ec2Error`] with a retry category.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_config::sts::AssumeRoleProvider;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::operation::assign_private_ip_addresses::AssignPrivateIpAddressesOutput;
use aws_sdk_ec2::operation::associate_trunk_interface::AssociateTrunkInterfaceOutput;
use aws_sdk_ec2::operation::attach_network_interface::AttachNetworkInterfaceOutput;
use aws_sdk_ec2::operation::create_network_interface::CreateNetworkInterfaceOutput;
use aws_sdk_ec2::operation::describe_instances::DescribeInstancesOutput;
use aws_sdk_ec2::operation::describe_network_interfaces::DescribeNetworkInterfacesOutput;
use aws_sdk_ec2::operation::describe_subnets::DescribeSubnetsOutput;
use aws_sdk_ec2::operation::describe_trunk_interface_associations::DescribeTrunkInterfaceAssociationsOutput;
use aws_sdk_ec2::types::{
    Filter, NetworkInterfaceAttachmentChanges, NetworkInterfaceCreationType, Tag, TagSpecification,
};
use opentelemetry::metrics::Meter;
use tracing::info;

use crate::error::{Ec2Error, Result};
use crate::metrics::Ec2Metrics;
use crate::ratelimit::RateLimiter;

/// SDK level retry budget for a single API call; the outer worker requeue
/// budget bounds the total attempts.
pub const MAX_RETRIES: u32 = 3;

const RESOURCE_TYPE_NETWORK_INTERFACE: &str = "network-interface";

#[derive(Clone)]
pub struct Ec2Wrapper {
    client: Client,
    metrics: Arc<Ec2Metrics>,
    limiter: Arc<RateLimiter>,
}

impl Ec2Wrapper {
    /// Build the wrapper with the configured credential chain: an STS
    /// assume role provider when a role ARN is given, the instance
    /// metadata credentials otherwise. The region comes from the process
    /// environment with an instance metadata fallback.
    pub async fn new(
        role_arn: Option<&str>,
        qps: u32,
        burst: u32,
        meter: &Meter,
    ) -> Result<Self> {
        let region = RegionProviderChain::default_provider()
            .region()
            .await
            .ok_or_else(|| {
                Ec2Error::new(
                    "configure",
                    crate::error::ErrorKind::Invalid,
                    "could not resolve the region from the environment or instance metadata",
                )
            })?;
        info!(msg = "using the region", region = %region);

        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_RETRIES))
            .load()
            .await;

        let config = match role_arn {
            Some(role_arn) => {
                // The STS client resolves the regional endpoint for us,
                // falling back to the global one where the region has none.
                let provider = AssumeRoleProvider::builder(role_arn)
                    .region(region)
                    .session_name("vpc-network-resource-operator")
                    .configure(&base)
                    .build()
                    .await;
                info!(msg = "initialized the assume role provider", role_arn);
                aws_config::defaults(BehaviorVersion::latest())
                    .credentials_provider(provider)
                    .retry_config(RetryConfig::standard().with_max_attempts(MAX_RETRIES))
                    .load()
                    .await
            }
            None => base,
        };

        info!(msg = "created rate limited ec2 client", qps, burst);
        Ok(Self {
            client: Client::new(&config),
            metrics: Arc::new(Ec2Metrics::new(meter)),
            limiter: Arc::new(RateLimiter::new(qps, burst)),
        })
    }

    pub async fn describe_instances(&self, instance_id: &str) -> Result<DescribeInstancesOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("describe_instances");
        let result = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("describe_instances", e));
        measure.observe(&result);
        result
    }

    pub async fn create_network_interface(
        &self,
        subnet_id: &str,
        description: &str,
        security_groups: &[String],
        secondary_ip_count: Option<i32>,
        interface_type: Option<NetworkInterfaceCreationType>,
    ) -> Result<CreateNetworkInterfaceOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("create_network_interface");
        let mut request = self
            .client
            .create_network_interface()
            .subnet_id(subnet_id)
            .description(description)
            .set_groups(Some(security_groups.to_vec()))
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(RESOURCE_TYPE_NETWORK_INTERFACE.into())
                    .tags(
                        Tag::builder()
                            .key("eks:eni:owner")
                            .value("eks-vpc-resource-controller")
                            .build(),
                    )
                    .build(),
            );
        if let Some(count) = secondary_ip_count {
            request = request.secondary_private_ip_address_count(count);
            self.metrics.assigned_ips_add(count as u64);
        }
        if let Some(interface_type) = interface_type {
            request = request.interface_type(interface_type);
        }
        let result = request
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("create_network_interface", e));
        measure.observe(&result);
        result
    }

    pub async fn attach_network_interface(
        &self,
        instance_id: &str,
        eni_id: &str,
        device_index: i32,
    ) -> Result<AttachNetworkInterfaceOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("attach_network_interface");
        let result = self
            .client
            .attach_network_interface()
            .instance_id(instance_id)
            .network_interface_id(eni_id)
            .device_index(device_index)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("attach_network_interface", e));
        measure.observe(&result);
        result
    }

    pub async fn detach_network_interface(&self, attachment_id: &str) -> Result<()> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("detach_network_interface");
        let result = self
            .client
            .detach_network_interface()
            .attachment_id(attachment_id)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("detach_network_interface", e));
        measure.observe(&result);
        result.map(|_| ())
    }

    pub async fn delete_network_interface(&self, eni_id: &str) -> Result<()> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("delete_network_interface");
        let result = self
            .client
            .delete_network_interface()
            .network_interface_id(eni_id)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("delete_network_interface", e));
        measure.observe(&result);
        result.map(|_| ())
    }

    pub async fn describe_network_interfaces(
        &self,
        filters: Vec<Filter>,
    ) -> Result<DescribeNetworkInterfacesOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("describe_network_interfaces");
        let result = self
            .client
            .describe_network_interfaces()
            .set_filters(Some(filters))
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("describe_network_interfaces", e));
        measure.observe(&result);
        result
    }

    pub async fn assign_private_ip_addresses(
        &self,
        eni_id: &str,
        secondary_ip_count: i32,
    ) -> Result<AssignPrivateIpAddressesOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("assign_private_ip");
        let result = self
            .client
            .assign_private_ip_addresses()
            .network_interface_id(eni_id)
            .secondary_private_ip_address_count(secondary_ip_count)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("assign_private_ip", e));
        if result.is_ok() {
            self.metrics.assigned_ips_add(secondary_ip_count as u64);
        }
        measure.observe(&result);
        result
    }

    pub async fn unassign_private_ip_addresses(
        &self,
        eni_id: &str,
        addresses: &[String],
    ) -> Result<()> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("unassign_private_ip");
        let result = self
            .client
            .unassign_private_ip_addresses()
            .network_interface_id(eni_id)
            .set_private_ip_addresses(Some(addresses.to_vec()))
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("unassign_private_ip", e));
        if result.is_ok() {
            self.metrics.unassigned_ips_add(addresses.len() as u64);
        }
        measure.observe(&result);
        result.map(|_| ())
    }

    pub async fn create_tags(&self, resource_id: &str, tags: Vec<Tag>) -> Result<()> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("create_tags");
        let result = self
            .client
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("create_tags", e));
        measure.observe(&result);
        result.map(|_| ())
    }

    pub async fn describe_subnets(&self, subnet_id: &str) -> Result<DescribeSubnetsOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("describe_subnets");
        let result = self
            .client
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("describe_subnets", e));
        measure.observe(&result);
        result
    }

    pub async fn associate_trunk_interface(
        &self,
        trunk_id: &str,
        branch_id: &str,
        vlan_id: i32,
    ) -> Result<AssociateTrunkInterfaceOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("associate_trunk_to_branch");
        let result = self
            .client
            .associate_trunk_interface()
            .trunk_interface_id(trunk_id)
            .branch_interface_id(branch_id)
            .vlan_id(vlan_id)
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("associate_trunk_to_branch", e));
        measure.observe(&result);
        result
    }

    pub async fn describe_trunk_interface_associations(
        &self,
        trunk_id: &str,
    ) -> Result<DescribeTrunkInterfaceAssociationsOutput> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("describe_trunk_association");
        let result = self
            .client
            .describe_trunk_interface_associations()
            .filters(
                Filter::builder()
                    .name("trunk-interface-association.trunk-interface-id")
                    .values(trunk_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("describe_trunk_association", e));
        measure.observe(&result);
        result
    }

    pub async fn set_delete_on_termination(
        &self,
        eni_id: &str,
        attachment_id: &str,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let measure = self.metrics.measure("modify_network_interface_attribute");
        let result = self
            .client
            .modify_network_interface_attribute()
            .network_interface_id(eni_id)
            .attachment(
                NetworkInterfaceAttachmentChanges::builder()
                    .attachment_id(attachment_id)
                    .delete_on_termination(true)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Ec2Error::from_sdk("modify_network_interface_attribute", e));
        measure.observe(&result);
        result.map(|_| ())
    }
}

//! Higher level EC2 operations composed from the wrapper calls. The
//! [`Ec2Api`] trait is the seam the resource managers are written against;
//! tests substitute a scripted fake for the real helper.

use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, NetworkInterfaceCreationType, Tag};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::ec2::Ec2Wrapper;
use crate::error::{Ec2Error, ErrorKind, Result};

pub const TRUNK_ENI_DESCRIPTION: &str = "aws-k8s-trunk-eni";
pub const BRANCH_ENI_DESCRIPTION: &str = "aws-k8s-branch-eni";
pub const SECONDARY_ENI_DESCRIPTION: &str = "aws-k8s-secondary-eni";

const INTERFACE_TYPE_TRUNK: &str = "trunk";

const ATTACHMENT_WAIT_INTERVAL: Duration = Duration::from_millis(500);
const ATTACHMENT_WAIT_ATTEMPTS: u32 = 30;

/// Network interface view decoupled from the SDK output shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: String,
    pub mac_address: Option<String>,
    pub primary_ipv4: Option<String>,
    pub secondary_ipv4: Vec<String>,
    pub ipv6_addr: Option<String>,
    pub interface_type: Option<String>,
    pub attachment_id: Option<String>,
    pub device_index: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkAssociation {
    pub branch_eni_id: String,
    pub vlan_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceDetails {
    pub instance_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_groups: Vec<String>,
    pub used_device_indexes: Vec<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct SubnetInfo {
    pub subnet_id: String,
    pub cidr_block: Option<String>,
    pub ipv6_cidr_block: Option<String>,
}

impl From<&aws_sdk_ec2::types::NetworkInterface> for NetworkInterface {
    fn from(nic: &aws_sdk_ec2::types::NetworkInterface) -> Self {
        let primary_ipv4 = nic.private_ip_address().map(str::to_string);
        let secondary_ipv4 = nic
            .private_ip_addresses()
            .iter()
            .filter(|ip| !ip.primary().unwrap_or(false))
            .filter_map(|ip| ip.private_ip_address().map(str::to_string))
            .collect();
        Self {
            id: nic.network_interface_id().unwrap_or_default().to_string(),
            mac_address: nic.mac_address().map(str::to_string),
            primary_ipv4,
            secondary_ipv4,
            ipv6_addr: nic
                .ipv6_addresses()
                .first()
                .and_then(|a| a.ipv6_address().map(str::to_string)),
            interface_type: nic.interface_type().map(|t| t.as_str().to_string()),
            attachment_id: nic
                .attachment()
                .and_then(|a| a.attachment_id().map(str::to_string)),
            device_index: nic.attachment().and_then(|a| a.device_index()),
        }
    }
}

/// Capability set the resource managers consume.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn get_instance_details(&self, instance_id: &str) -> Result<InstanceDetails>;

    async fn get_subnet(&self, subnet_id: &str) -> Result<SubnetInfo>;

    /// The trunk interface attached to the instance, when one exists.
    async fn get_trunk_interface(&self, instance_id: &str) -> Result<Option<NetworkInterface>>;

    async fn get_instance_network_interfaces(
        &self,
        instance_id: &str,
    ) -> Result<Vec<NetworkInterface>>;

    async fn create_network_interface(
        &self,
        description: &str,
        subnet_id: &str,
        security_groups: &[String],
        secondary_ip_count: Option<i32>,
        interface_type: Option<&str>,
    ) -> Result<NetworkInterface>;

    /// Create plus attach, atomically from the caller's view: on a failed
    /// attach the interface is deleted again before the error is returned.
    async fn create_and_attach_network_interface(
        &self,
        instance_id: &str,
        subnet_id: &str,
        security_groups: &[String],
        device_index: i32,
        description: &str,
        interface_type: Option<&str>,
        secondary_ip_count: Option<i32>,
    ) -> Result<NetworkInterface>;

    /// Delete an interface, detaching it first when it is attached.
    async fn delete_network_interface(&self, eni_id: &str) -> Result<()>;

    async fn assign_ipv4_addresses(&self, eni_id: &str, count: i32) -> Result<Vec<String>>;

    async fn unassign_ipv4_addresses(&self, eni_id: &str, addresses: &[String]) -> Result<()>;

    async fn describe_trunk_interface_associations(
        &self,
        trunk_id: &str,
    ) -> Result<Vec<TrunkAssociation>>;

    async fn associate_branch_to_trunk(
        &self,
        trunk_id: &str,
        branch_id: &str,
        vlan_id: i32,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct Ec2ApiHelper {
    wrapper: Ec2Wrapper,
    cluster_name: String,
}

impl Ec2ApiHelper {
    pub fn new(wrapper: Ec2Wrapper, cluster_name: &str) -> Self {
        Self {
            wrapper,
            cluster_name: cluster_name.to_string(),
        }
    }

    async fn describe_interface(&self, eni_id: &str) -> Result<NetworkInterface> {
        let output = self
            .wrapper
            .describe_network_interfaces(vec![
                Filter::builder()
                    .name("network-interface-id")
                    .values(eni_id)
                    .build(),
            ])
            .await?;
        output
            .network_interfaces()
            .first()
            .map(NetworkInterface::from)
            .ok_or_else(|| {
                Ec2Error::new(
                    "describe_network_interfaces",
                    ErrorKind::NotFound,
                    format!("network interface {eni_id} not found"),
                )
            })
    }

    async fn wait_for_attachment(&self, eni_id: &str) -> Result<NetworkInterface> {
        for _ in 0..ATTACHMENT_WAIT_ATTEMPTS {
            let nic = self.describe_interface(eni_id).await?;
            if nic.attachment_id.is_some() {
                return Ok(nic);
            }
            sleep(ATTACHMENT_WAIT_INTERVAL).await;
        }
        Err(Ec2Error::new(
            "attach_network_interface",
            ErrorKind::Transient,
            format!("interface {eni_id} did not report an attachment in time"),
        ))
    }

    fn owner_tags(&self) -> Vec<Tag> {
        vec![
            Tag::builder()
                .key("cluster.k8s.amazonaws.com/name")
                .value(self.cluster_name.clone())
                .build(),
        ]
    }
}

#[async_trait]
impl Ec2Api for Ec2ApiHelper {
    async fn get_instance_details(&self, instance_id: &str) -> Result<InstanceDetails> {
        let output = self.wrapper.describe_instances(instance_id).await?;
        let instance = output
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .ok_or_else(|| {
                Ec2Error::new(
                    "describe_instances",
                    ErrorKind::NotFound,
                    format!("instance {instance_id} not found"),
                )
            })?;

        let security_groups = instance
            .security_groups()
            .iter()
            .filter_map(|sg| sg.group_id().map(str::to_string))
            .collect();
        let used_device_indexes = instance
            .network_interfaces()
            .iter()
            .filter_map(|nic| nic.attachment().and_then(|a| a.device_index()))
            .collect();

        Ok(InstanceDetails {
            instance_id: instance_id.to_string(),
            instance_type: instance
                .instance_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            subnet_id: instance.subnet_id().unwrap_or_default().to_string(),
            security_groups,
            used_device_indexes,
        })
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<SubnetInfo> {
        let output = self.wrapper.describe_subnets(subnet_id).await?;
        let subnet = output.subnets().first().ok_or_else(|| {
            Ec2Error::new(
                "describe_subnets",
                ErrorKind::NotFound,
                format!("subnet {subnet_id} not found"),
            )
        })?;
        Ok(SubnetInfo {
            subnet_id: subnet_id.to_string(),
            cidr_block: subnet.cidr_block().map(str::to_string),
            ipv6_cidr_block: subnet
                .ipv6_cidr_block_association_set()
                .first()
                .and_then(|a| a.ipv6_cidr_block().map(str::to_string)),
        })
    }

    async fn get_trunk_interface(&self, instance_id: &str) -> Result<Option<NetworkInterface>> {
        let interfaces = self.get_instance_network_interfaces(instance_id).await?;
        Ok(interfaces
            .into_iter()
            .find(|nic| nic.interface_type.as_deref() == Some(INTERFACE_TYPE_TRUNK)))
    }

    async fn get_instance_network_interfaces(
        &self,
        instance_id: &str,
    ) -> Result<Vec<NetworkInterface>> {
        let output = self
            .wrapper
            .describe_network_interfaces(vec![
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(instance_id)
                    .build(),
            ])
            .await?;
        Ok(output
            .network_interfaces()
            .iter()
            .map(NetworkInterface::from)
            .collect())
    }

    async fn create_network_interface(
        &self,
        description: &str,
        subnet_id: &str,
        security_groups: &[String],
        secondary_ip_count: Option<i32>,
        interface_type: Option<&str>,
    ) -> Result<NetworkInterface> {
        let creation_type = interface_type.map(NetworkInterfaceCreationType::from);
        let output = self
            .wrapper
            .create_network_interface(
                subnet_id,
                description,
                security_groups,
                secondary_ip_count,
                creation_type,
            )
            .await?;
        let nic = output.network_interface().ok_or_else(|| {
            Ec2Error::new(
                "create_network_interface",
                ErrorKind::Invalid,
                "create returned no network interface",
            )
        })?;
        let nic = NetworkInterface::from(nic);
        self.wrapper.create_tags(&nic.id, self.owner_tags()).await?;
        Ok(nic)
    }

    async fn create_and_attach_network_interface(
        &self,
        instance_id: &str,
        subnet_id: &str,
        security_groups: &[String],
        device_index: i32,
        description: &str,
        interface_type: Option<&str>,
        secondary_ip_count: Option<i32>,
    ) -> Result<NetworkInterface> {
        let nic = self
            .create_network_interface(
                description,
                subnet_id,
                security_groups,
                secondary_ip_count,
                interface_type,
            )
            .await?;

        let attach = self
            .wrapper
            .attach_network_interface(instance_id, &nic.id, device_index)
            .await;
        let attachment_id = match attach {
            Ok(output) => output.attachment_id().unwrap_or_default().to_string(),
            Err(e) => {
                // Interface never attached, delete it so nothing leaks.
                warn!(msg = "attach failed, deleting the created interface", eni = %nic.id);
                if let Err(delete_err) = self.wrapper.delete_network_interface(&nic.id).await {
                    warn!(msg = "failed to delete interface after attach failure",
                        eni = %nic.id, %delete_err);
                }
                return Err(e);
            }
        };

        let nic = self.wait_for_attachment(&nic.id).await?;
        self.wrapper
            .set_delete_on_termination(&nic.id, &attachment_id)
            .await?;
        Ok(nic)
    }

    async fn delete_network_interface(&self, eni_id: &str) -> Result<()> {
        let nic = match self.describe_interface(eni_id).await {
            Ok(nic) => nic,
            Err(e) if e.is_not_found() => {
                debug!(msg = "interface already gone", eni = eni_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(attachment_id) = &nic.attachment_id {
            self.wrapper.detach_network_interface(attachment_id).await?;
            // Detach is asynchronous on the instance side.
            for _ in 0..ATTACHMENT_WAIT_ATTEMPTS {
                let nic = self.describe_interface(eni_id).await?;
                if nic.attachment_id.is_none() {
                    break;
                }
                sleep(ATTACHMENT_WAIT_INTERVAL).await;
            }
        }

        match self.wrapper.delete_network_interface(eni_id).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn assign_ipv4_addresses(&self, eni_id: &str, count: i32) -> Result<Vec<String>> {
        let output = self.wrapper.assign_private_ip_addresses(eni_id, count).await?;
        Ok(output
            .assigned_private_ip_addresses()
            .iter()
            .filter_map(|ip| ip.private_ip_address().map(str::to_string))
            .collect())
    }

    async fn unassign_ipv4_addresses(&self, eni_id: &str, addresses: &[String]) -> Result<()> {
        self.wrapper
            .unassign_private_ip_addresses(eni_id, addresses)
            .await
    }

    async fn describe_trunk_interface_associations(
        &self,
        trunk_id: &str,
    ) -> Result<Vec<TrunkAssociation>> {
        let output = self
            .wrapper
            .describe_trunk_interface_associations(trunk_id)
            .await?;
        Ok(output
            .interface_associations()
            .iter()
            .filter_map(|assoc| {
                Some(TrunkAssociation {
                    branch_eni_id: assoc.branch_interface_id()?.to_string(),
                    vlan_id: assoc.vlan_id()?,
                })
            })
            .collect())
    }

    async fn associate_branch_to_trunk(
        &self,
        trunk_id: &str,
        branch_id: &str,
        vlan_id: i32,
    ) -> Result<()> {
        self.wrapper
            .associate_trunk_interface(trunk_id, branch_id, vlan_id)
            .await
            .map(|_| ())
    }
}

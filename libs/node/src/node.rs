//! Per node context: the EC2 instance details behind a Kubernetes node,
//! resolved once when the node joins and handed to the resource providers
//! as their [`Ec2Instance`] view.

use std::sync::Arc;

use eniop_aws::error::{Ec2Error, ErrorKind};
use eniop_aws::helper::{Ec2Api, InstanceDetails, SubnetInfo};
use eniop_aws::instance::{Ec2Instance, OsFamily};
use eniop_aws::limits;
use eniop_operator::config::{NODE_LABEL_OS, NODE_LABEL_OS_BETA};
use eniop_operator::error::{Error, Result};
use k8s_openapi::api::core::v1::Node;
use parking_lot::RwLock;

pub struct NodeContext {
    node_name: String,
    instance_id: String,
    os: OsFamily,
    details: InstanceDetails,
    subnet: SubnetInfo,
    /// Device indexes in use on the instance, extended as interfaces are
    /// attached.
    used_device_indexes: RwLock<Vec<i32>>,
}

/// Instance id from the node's provider id, e.g.
/// `aws:///us-west-2a/i-0123456789abcdef0`.
pub fn instance_id_from_provider_id(node: &Node) -> Result<&str> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .and_then(|provider_id| provider_id.rsplit_once('/'))
        .map(|(_, id)| id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::MissingData("node has no usable provider id".to_string()))
}

/// Operating system family from the node labels, the beta label honoured
/// for older kubelets.
pub fn os_from_labels(node: &Node) -> OsFamily {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| {
            labels
                .get(NODE_LABEL_OS)
                .or_else(|| labels.get(NODE_LABEL_OS_BETA))
        })
        .map(|value| OsFamily::from_label(value))
        .unwrap_or(OsFamily::Linux)
}

impl NodeContext {
    pub async fn new(ec2: &Arc<dyn Ec2Api>, node: &Node) -> Result<Self> {
        let node_name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::MissingData("node has no name in its metadata".to_string()))?;
        let instance_id = instance_id_from_provider_id(node)?.to_string();

        let details = ec2
            .get_instance_details(&instance_id)
            .await
            .map_err(|e| Error::Ec2Error("failed to describe the instance".to_string(), e))?;
        let subnet = ec2
            .get_subnet(&details.subnet_id)
            .await
            .map_err(|e| Error::Ec2Error("failed to describe the subnet".to_string(), e))?;

        Ok(Self {
            node_name,
            instance_id,
            os: os_from_labels(node),
            used_device_indexes: RwLock::new(details.used_device_indexes.clone()),
            details,
            subnet,
        })
    }

    /// True when the instance type is in the limits table; anything else
    /// is left unmanaged.
    pub fn is_supported(&self) -> bool {
        limits::limits_for(&self.details.instance_type).is_some()
    }
}

impl Ec2Instance for NodeContext {
    fn name(&self) -> &str {
        &self.node_name
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn instance_type(&self) -> &str {
        &self.details.instance_type
    }

    fn os(&self) -> OsFamily {
        self.os
    }

    fn subnet_id(&self) -> &str {
        &self.details.subnet_id
    }

    fn subnet_cidr_block(&self) -> Option<&str> {
        self.subnet.cidr_block.as_deref()
    }

    fn subnet_v6_cidr_block(&self) -> Option<&str> {
        self.subnet.ipv6_cidr_block.as_deref()
    }

    fn security_groups(&self) -> Vec<String> {
        self.details.security_groups.clone()
    }

    fn highest_unused_device_index(&self) -> Result<i32, Ec2Error> {
        let mut used = self.used_device_indexes.write();
        let next = used.iter().max().map(|index| index + 1).unwrap_or(0);
        if let Some(limit) = limits::eni_limit(&self.details.instance_type) {
            if next >= limit as i32 {
                return Err(Ec2Error::new(
                    "device_index",
                    ErrorKind::Quota,
                    format!(
                        "instance {} has no free device index",
                        self.instance_id
                    ),
                ));
            }
        }
        used.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(provider_id: Option<&str>, os_label: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("test-node".to_string()),
                labels: os_label.map(|os| {
                    [(NODE_LABEL_OS.to_string(), os.to_string())]
                        .into_iter()
                        .collect()
                }),
                ..ObjectMeta::default()
            },
            spec: Some(k8s_openapi::api::core::v1::NodeSpec {
                provider_id: provider_id.map(str::to_string),
                ..Default::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn test_instance_id_from_provider_id() {
        let node = node(Some("aws:///us-west-2a/i-0123456789abcdef0"), None);
        assert_eq!(
            instance_id_from_provider_id(&node).unwrap(),
            "i-0123456789abcdef0"
        );
    }

    #[test]
    fn test_instance_id_missing_provider_id() {
        assert!(instance_id_from_provider_id(&node(None, None)).is_err());
        assert!(instance_id_from_provider_id(&node(Some("aws:///"), None)).is_err());
    }

    #[test]
    fn test_os_from_labels() {
        assert_eq!(os_from_labels(&node(None, Some("windows"))), OsFamily::Windows);
        assert_eq!(os_from_labels(&node(None, Some("linux"))), OsFamily::Linux);
        assert_eq!(os_from_labels(&node(None, None)), OsFamily::Linux);
    }
}

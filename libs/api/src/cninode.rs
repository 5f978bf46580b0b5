use std::fmt;

use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Feature delegated to the controller for a given node. The value carries
/// feature specific configuration, e.g. the custom networking subnet.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<FeatureName>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum FeatureName {
    SecurityGroupsForPods,
    CustomNetworking,
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureName::SecurityGroupsForPods => write!(f, "SecurityGroupsForPods"),
            FeatureName::CustomNetworking => write!(f, "CustomNetworking"),
        }
    }
}

/// The CNINode custom resource pairs every managed Kubernetes node with the
/// VPC resources attached to it. The resource is cluster scoped and shares
/// its name with the node.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "vpcresources.k8s.aws",
    version = "v1alpha1",
    kind = "CNINode",
    plural = "cninodes",
    singular = "cninode",
    shortname = "cnd",
    status = "CNINodeStatus",
    doc = r#"CNINode records the features delegated to the controller and the branch network interfaces warmed for the node."#,
    printcolumn = r#"{"name":"Features","type":"string","jsonPath":".spec.features"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct CNINodeSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<Feature>,
}

/// Branch network interface recorded on the node, either warmed or in use.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct WarmBranchENI {
    /// Network interface id of the branch interface.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// MAC address of the branch interface.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_addr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv4_addr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv6_addr: String,

    /// VLAN tag identifying the branch on the trunk interface.
    #[serde(default)]
    pub vlan_id: i64,

    /// CIDR block of the subnet the interface was created in.
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "subnetCIDR")]
    pub subnet_cidr: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "subnetV6CIDR")]
    pub subnet_v6_cidr: String,
}

/// Most recent observed set of VPC resources managed for the node.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct CNINodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "branchenis")]
    pub branch_enis: Vec<WarmBranchENI>,
}

impl CNINode {
    /// True when the given feature has been delegated to the controller.
    pub fn has_feature(&self, name: FeatureName) -> bool {
        self.spec
            .features
            .iter()
            .any(|f| f.name.as_ref() == Some(&name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_branch_eni_round_trips_with_upstream_field_names() {
        let eni = WarmBranchENI {
            id: "eni-0e42914a33ee3c5ce".to_string(),
            mac_addr: "0e:cb:3c:0d:97:3b".to_string(),
            ipv4_addr: "10.1.191.190".to_string(),
            vlan_id: 1,
            subnet_cidr: "10.1.160.0/19".to_string(),
            ..WarmBranchENI::default()
        };

        let value = serde_json::to_value(&eni).unwrap();
        assert_eq!(value["macAddr"], "0e:cb:3c:0d:97:3b");
        assert_eq!(value["subnetCIDR"], "10.1.160.0/19");
        assert!(value.get("ipv6Addr").is_none());
    }

    #[test]
    fn test_has_feature() {
        let cninode = CNINode::new(
            "node-1",
            CNINodeSpec {
                features: vec![Feature {
                    name: Some(FeatureName::SecurityGroupsForPods),
                    value: None,
                }],
            },
        );

        assert!(cninode.has_feature(FeatureName::SecurityGroupsForPods));
        assert!(!cninode.has_feature(FeatureName::CustomNetworking));
    }
}

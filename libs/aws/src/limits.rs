//! Per instance type network limits. A subset of the published EC2 limits
//! covering the instance families the controller is commonly deployed on;
//! unknown types resolve to no capacity and the node is left unmanaged.

use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy)]
pub struct InstanceLimits {
    /// Network interfaces attachable to the instance.
    pub interfaces: usize,
    /// IPv4 addresses per interface, primary included.
    pub ipv4_per_interface: usize,
    /// Branch interfaces supported on the trunk, 0 when the type does not
    /// support trunking.
    pub branch_interfaces: usize,
}

static LIMITS: LazyLock<HashMap<&'static str, InstanceLimits>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    let mut add = |ty: &'static str, interfaces, ipv4_per_interface, branch_interfaces| {
        m.insert(
            ty,
            InstanceLimits {
                interfaces,
                ipv4_per_interface,
                branch_interfaces,
            },
        );
    };

    add("t3.medium", 3, 6, 9);
    add("t3.large", 3, 12, 9);
    add("t3.xlarge", 4, 15, 18);
    add("t3.2xlarge", 4, 15, 38);
    add("m5.large", 3, 10, 9);
    add("m5.xlarge", 4, 15, 18);
    add("m5.2xlarge", 4, 15, 38);
    add("m5.4xlarge", 8, 30, 54);
    add("m5.8xlarge", 8, 30, 54);
    add("m5.12xlarge", 8, 30, 54);
    add("m5.16xlarge", 15, 50, 107);
    add("m5.24xlarge", 15, 50, 107);
    add("c5.large", 3, 10, 9);
    add("c5.xlarge", 4, 15, 18);
    add("c5.2xlarge", 4, 15, 38);
    add("c5.4xlarge", 8, 30, 54);
    add("c5.9xlarge", 8, 30, 54);
    add("c5.18xlarge", 15, 50, 107);
    add("r5.large", 3, 10, 9);
    add("r5.xlarge", 4, 15, 18);
    add("r5.2xlarge", 4, 15, 38);
    add("r5.4xlarge", 8, 30, 54);
    add("r5.24xlarge", 15, 50, 107);
    m
});

pub fn limits_for(instance_type: &str) -> Option<InstanceLimits> {
    LIMITS.get(instance_type).copied()
}

/// IPv4 addresses available per interface, or `None` for unknown types.
pub fn ip_limit(instance_type: &str) -> Option<usize> {
    limits_for(instance_type).map(|l| l.ipv4_per_interface)
}

pub fn eni_limit(instance_type: &str) -> Option<usize> {
    limits_for(instance_type).map(|l| l.interfaces)
}

pub fn branch_limit(instance_type: &str) -> Option<usize> {
    limits_for(instance_type).map(|l| l.branch_interfaces)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_known_type() {
        let limits = limits_for("m5.large").unwrap();
        assert_eq!(limits.interfaces, 3);
        assert_eq!(limits.ipv4_per_interface, 10);
        assert_eq!(limits.branch_interfaces, 9);
    }

    #[test]
    fn test_unknown_type_has_no_capacity() {
        assert!(limits_for("u-24tb1.metal").is_none());
        assert!(ip_limit("u-24tb1.metal").is_none());
    }
}

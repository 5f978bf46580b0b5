use std::fmt;

use crate::error::Ec2Error;

/// Operating system family of a node, derived from its Kubernetes labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    pub fn from_label(value: &str) -> Self {
        if value.eq_ignore_ascii_case("windows") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::Windows => write!(f, "windows"),
        }
    }
}

/// View of an EC2 instance the resource providers operate against. The
/// node context implements this; tests substitute a fixture.
pub trait Ec2Instance: Send + Sync {
    /// Kubernetes node name backing the instance.
    fn name(&self) -> &str;
    fn instance_id(&self) -> &str;
    fn instance_type(&self) -> &str;
    fn os(&self) -> OsFamily;
    fn subnet_id(&self) -> &str;
    fn subnet_cidr_block(&self) -> Option<&str>;
    fn subnet_v6_cidr_block(&self) -> Option<&str>;
    /// Security groups of the primary network interface.
    fn security_groups(&self) -> Vec<String>;
    /// Device index for a new interface, above every index in use.
    fn highest_unused_device_index(&self) -> Result<i32, Ec2Error>;
}

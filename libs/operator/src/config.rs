//! Resource names, annotation keys and tuning knobs shared by every
//! component. Values that operators are expected to tune are surfaced as
//! flags on the binaries and threaded through here as plain arguments.

use tokio::time::Duration;

/// Extended resource advertised for branch network interfaces on Linux
/// nodes, and the pod annotation carrying the allocated branch list.
pub const RESOURCE_NAME_POD_ENI: &str = "vpc.amazonaws.com/pod-eni";

/// Extended resource advertised for secondary private IPv4 addresses on
/// Windows nodes, and the pod annotation carrying the assigned address.
pub const RESOURCE_NAME_IPV4_ADDRESS: &str = "vpc.amazonaws.com/PrivateIPv4Address";

/// Security group annotation written by the Fargate mutating webhook.
/// Immutable on update regardless of the requesting user.
pub const FARGATE_POD_SG_ANNOTATION: &str = "fargate.amazonaws.com/pod-sg";

pub const NODE_LABEL_OS: &str = "kubernetes.io/os";
pub const NODE_LABEL_OS_BETA: &str = "beta.kubernetes.io/os";
pub const OS_WINDOWS: &str = "windows";
pub const OS_LINUX: &str = "linux";

/// Service account user names allowed to mutate the protected annotations.
/// The older names are kept because the controller's service account was
/// renamed after the first release.
pub const TRUSTED_ANNOTATION_USERS: [&str; 3] = [
    "system:serviceaccount:kube-system:vpc-resource-controller",
    "system:serviceaccount:kube-system:eks-vpc-resource-controller",
    "eks:vpc-resource-controller",
];

/// Minimum time a freed resource is held before physical deletion so
/// in-flight traffic is not raced.
pub const COOL_DOWN_PERIOD: Duration = Duration::from_secs(30);

/// Interval between CNINode janitor passes. A CNINode must be without a
/// backing node for two consecutive passes before it is deleted.
pub const CNI_NODE_CLEANUP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Attempts to delete a cooled down branch interface before it is dropped
/// from the delete queue.
pub const MAX_DELETE_RETRIES: u32 = 5;

/// Size of the VLAN id space on a trunk interface. Id 0 is reserved for
/// the trunk itself, leaving [1, MAX_ALLOCATABLE_VLAN_IDS) for branches.
pub const MAX_ALLOCATABLE_VLAN_IDS: usize = 121;

/// Substituted for an empty pod namespace when keying the pod to branch
/// interface mapping.
pub const DEFAULT_NAMESPACE: &str = "default";

pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Bound on the per resource worker queues; submissions past this are
/// dropped with a counter rather than blocking the submitter.
pub const WORK_QUEUE_CAPACITY: usize = 4096;

/// Requeue budget for asynchronous warm pool jobs.
pub const WORKER_MAX_REQUEUE: u32 = 5;

/// Warm pool defaults for the Windows secondary IPv4 resource.
pub const IPV4_DEFAULT_WARM_POOL_SIZE: usize = 3;
pub const IPV4_DEFAULT_MIN_WARM_POOL_SIZE: usize = 2;
pub const IPV4_DEFAULT_MAX_DEVIATION: usize = 1;
pub const IPV4_DEFAULT_RESERVED_SIZE: usize = 0;

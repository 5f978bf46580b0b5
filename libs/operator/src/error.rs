use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    Ec2Error(String, #[source] eniop_aws::error::Ec2Error),

    #[error("{0}: {1}")]
    K8sApiError(String, #[source] eniop_k8s_util::error::Error),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}")]
    MissingData(String),

    #[error("warm pool has no free resource for node {0}")]
    PoolEmpty(String),

    #[error("no resource assigned on node {0} for pod {1}")]
    UnknownResource(String, String),

    #[error("stale event: cached uid {cached} does not match {received}")]
    StaleEvent { cached: String, received: String },

    #[error("no free vlan id on trunk {0}")]
    VlanExhausted(String),

    #[error("worker pool {0} already started")]
    AlreadyStarted(&'static str),

    #[error("node {0} is not initialized yet")]
    NodeNotReady(String),

    #[error("{0}")]
    Invalid(String),
}

impl Error {
    /// True when the job that hit this error should be handed back to the
    /// worker queue instead of dropped.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Ec2Error(_, e) => e.is_transient(),
            // A missing object means the owner went away, retrying cannot
            // bring it back.
            Error::K8sApiError(_, e) => !e.is_not_found(),
            Error::NodeNotReady(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

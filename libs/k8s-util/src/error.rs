use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}")]
    MissingData(String),
}

impl Error {
    pub fn kube(context: impl Into<String>, e: kube::Error) -> Self {
        Error::KubeError(context.into(), Box::new(e))
    }

    /// True for optimistic concurrency failures worth retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(_, e)
            if matches!(e.as_ref(), kube::Error::Api(ae) if ae.code == 409))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(_, e)
            if matches!(e.as_ref(), kube::Error::Api(ae) if ae.code == 404))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

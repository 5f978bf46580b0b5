use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Category of an EC2 API failure, decides whether the caller retries,
/// surfaces an event, or drops the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Throttling, timeouts and other failures worth retrying.
    Transient,
    /// Credential or permission failures.
    Auth,
    /// Account or subnet level limits; surfaced as an event, not retried
    /// in a tight loop.
    Quota,
    /// The referenced object is gone, often because the owner was deleted
    /// concurrently.
    NotFound,
    /// Malformed request, a programming error on our side.
    Invalid,
}

#[derive(Error, Debug)]
#[error("ec2 {operation} failed: {message}")]
pub struct Ec2Error {
    pub operation: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl Ec2Error {
    pub fn new(operation: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    pub fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::fmt::Debug,
        R: std::fmt::Debug,
    {
        let kind = match &err {
            SdkError::ServiceError(service) => classify(service.err().code()),
            // Connection level failures never reached the service.
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
                ErrorKind::Transient
            }
            SdkError::ConstructionFailure(_) => ErrorKind::Invalid,
            _ => ErrorKind::Transient,
        };
        Self {
            operation,
            kind,
            message: format!("{err:?}"),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_quota(&self) -> bool {
        self.kind == ErrorKind::Quota
    }
}

fn classify(code: Option<&str>) -> ErrorKind {
    let Some(code) = code else {
        return ErrorKind::Transient;
    };
    if code.ends_with(".NotFound") {
        return ErrorKind::NotFound;
    }
    match code {
        "RequestLimitExceeded"
        | "Throttling"
        | "ThrottlingException"
        | "ServiceUnavailable"
        | "InternalError"
        | "ResourceCountExceeded" => ErrorKind::Transient,
        "UnauthorizedOperation" | "AuthFailure" | "ExpiredToken" | "ExpiredTokenException" => {
            ErrorKind::Auth
        }
        "InsufficientFreeAddressesInSubnet"
        | "AddressLimitExceeded"
        | "NetworkInterfaceLimitExceeded"
        | "PrivateIpAddressLimitExceeded"
        | "AttachmentLimitExceeded" => ErrorKind::Quota,
        _ if code.starts_with("InvalidParameter") || code.starts_with("MissingParameter") => {
            ErrorKind::Invalid
        }
        _ => ErrorKind::Transient,
    }
}

pub type Result<T, E = Ec2Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classify_not_found_suffix() {
        assert_eq!(
            classify(Some("InvalidNetworkInterfaceID.NotFound")),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_classify_quota_codes() {
        assert_eq!(
            classify(Some("InsufficientFreeAddressesInSubnet")),
            ErrorKind::Quota
        );
        assert_eq!(classify(Some("AttachmentLimitExceeded")), ErrorKind::Quota);
    }

    #[test]
    fn test_classify_invalid_parameters() {
        assert_eq!(classify(Some("InvalidParameterValue")), ErrorKind::Invalid);
    }

    #[test]
    fn test_classify_unknown_defaults_to_transient() {
        assert_eq!(classify(Some("SomethingNew")), ErrorKind::Transient);
        assert_eq!(classify(None), ErrorKind::Transient);
    }
}

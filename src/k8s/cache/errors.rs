/**
 * Helper functions for creating common error types
 */
use crate::error::{Code, Error, Status};

fn status(code: Code, message: String) -> Error {
    Error::Status(Status { code, message })
}

/// Create an `Internal` status error, used for broken invariants such as a malformed cache key
#[must_use]
pub fn internal_error(message: impl Into<String>) -> Error {
    status(Code::Internal, message.into())
}

/// Create an `InvalidArgument` status error
#[must_use]
pub fn invalid_argument_error(message: impl Into<String>) -> Error {
    status(Code::InvalidArgument, message.into())
}

/// Create a `FailedPrecondition` status error for components that are not set up properly
#[must_use]
pub fn failed_precondition_error(message: impl Into<String>) -> Error {
    status(Code::FailedPrecondition, message.into())
}

/// Create a `NotFound` status error
#[must_use]
pub fn not_found_error(message: impl Into<String>) -> Error {
    status(Code::NotFound, message.into())
}

/// Create an error for an invalid cache key
#[must_use]
pub fn invalid_key_error(key: &str) -> Error {
    internal_error(format!("invalid key [{key}]"))
}

/// Whether a Kubernetes API error means "resource version too old" (HTTP 410 Gone)
#[must_use]
pub fn is_gone(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(resp)) if resp.code == 410)
}

/// Whether a Kubernetes API error means the object does not exist
#[must_use]
pub fn is_not_found(err: &Error) -> bool {
    match err {
        Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
        Error::Status(s) => s.code == Code::NotFound,
        _ => false,
    }
}

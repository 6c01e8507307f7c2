use std::error::Error;
use std::fmt::{Display, Formatter};

/// Message attached to the error raised when a `readwrite-primary`
/// transaction runs on a client that no longer holds the owner lease.
pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current tab is not in the required state to perform this operation. \
     It might be necessary to refresh the browser tab.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn parse(value: &str) -> Option<Self> {
        const ALL: [FirestoreErrorCode; 16] = [
            FirestoreErrorCode::Cancelled,
            FirestoreErrorCode::Unknown,
            FirestoreErrorCode::InvalidArgument,
            FirestoreErrorCode::DeadlineExceeded,
            FirestoreErrorCode::NotFound,
            FirestoreErrorCode::AlreadyExists,
            FirestoreErrorCode::PermissionDenied,
            FirestoreErrorCode::ResourceExhausted,
            FirestoreErrorCode::FailedPrecondition,
            FirestoreErrorCode::Aborted,
            FirestoreErrorCode::OutOfRange,
            FirestoreErrorCode::Unimplemented,
            FirestoreErrorCode::Internal,
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::DataLoss,
            FirestoreErrorCode::Unauthenticated,
        ];
        ALL.into_iter().find(|code| code.as_str() == value)
    }

    /// Maps a numeric gRPC status code as sent by the backend.
    pub fn from_grpc_status(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let message = message.unwrap_or_else(|| "stream error".to_string());
    FirestoreError::new(FirestoreErrorCode::from_grpc_status(code), message)
}

/// Errors the client should not retry.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    !matches!(
        code,
        FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::Unknown
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated
    )
}

/// Write failures that reject the head batch. `Aborted` is retried because the
/// backend uses it for contention.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

pub fn is_primary_lease_lost(error: &FirestoreError) -> bool {
    error.code == FirestoreErrorCode::FailedPrecondition
        && error.message == PRIMARY_LEASE_LOST_ERROR_MSG
}

/// Storage failures that are worth retrying, such as a busy or briefly
/// unreadable backing file.
pub fn is_transient_storage_error(error: &FirestoreError) -> bool {
    error.code == FirestoreErrorCode::Unavailable
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

pub fn primary_lease_lost() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_grpc_codes() {
        let err = map_grpc_status(8, Some("quota".into()));
        assert_eq!(err.code, FirestoreErrorCode::ResourceExhausted);
        assert_eq!(err.code_str(), "firestore/resource-exhausted");
        assert_eq!(map_grpc_status(99, None).code, FirestoreErrorCode::Unknown);
    }

    #[test]
    fn classifies_write_errors() {
        assert!(is_permanent_write_error(FirestoreErrorCode::PermissionDenied));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Unavailable));
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
    }

    #[test]
    fn recognises_lease_loss() {
        assert!(is_primary_lease_lost(&primary_lease_lost()));
        assert!(!is_primary_lease_lost(&failed_precondition("other")));
    }
}

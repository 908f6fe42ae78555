//! Join protocol error types.

use std::fmt;

use thiserror::Error;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

/// Metadata key naming the [`JoinError`] variant behind a failed stream.
const ERROR_KIND_KEY: &str = "warpgrid-join-error";
/// Metadata key carrying the join method of a [`JoinError::VerifierRejected`].
const ERROR_METHOD_KEY: &str = "warpgrid-join-method";

/// Errors that end a join attempt.
///
/// Every one of them is fatal to the stream it happened on; the node retries
/// the whole handshake from `ClientInit`.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("unrecognized join message: {0}")]
    UnrecognizedMessage(String),

    #[error("unsupported join method: {0:?}")]
    UnsupportedJoinMethod(String),

    #[error("join protocol violation: {0}")]
    ProtocolSequenceViolation(String),

    #[error("join method {method:?} rejected the node: {reason}")]
    VerifierRejected { method: String, reason: String },

    #[error("invalid join request: {0}")]
    InvalidRequest(String),

    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    #[error("transport failure: {0}")]
    Transport(#[source] Status),

    #[error("join canceled")]
    Canceled,

    #[error("join deadline exceeded")]
    DeadlineExceeded,
}

impl JoinError {
    pub fn sequence(msg: impl Into<String>) -> Self {
        JoinError::ProtocolSequenceViolation(msg.into())
    }

    pub fn rejected(method: impl Into<String>, reason: impl Into<String>) -> Self {
        JoinError::VerifierRejected {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Stable name of the variant, carried in status metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            JoinError::UnrecognizedMessage(_) => "unrecognized-message",
            JoinError::UnsupportedJoinMethod(_) => "unsupported-join-method",
            JoinError::ProtocolSequenceViolation(_) => "protocol-sequence-violation",
            JoinError::VerifierRejected { .. } => "verifier-rejected",
            JoinError::InvalidRequest(_) => "invalid-request",
            JoinError::Issuance(_) => "issuance",
            JoinError::Transport(_) => "transport",
            JoinError::Canceled => "canceled",
            JoinError::DeadlineExceeded => "deadline-exceeded",
        }
    }

    /// Convert into the status that ends the gRPC stream.
    pub fn into_status(self) -> Status {
        let kind = self.kind();
        let (code, message, method) = match self {
            JoinError::Transport(status) => return status,
            JoinError::UnrecognizedMessage(msg) => (Code::InvalidArgument, msg, None),
            JoinError::UnsupportedJoinMethod(method) => (Code::Unimplemented, method, None),
            JoinError::ProtocolSequenceViolation(msg) => (Code::FailedPrecondition, msg, None),
            JoinError::VerifierRejected { method, reason } => {
                (Code::PermissionDenied, reason, Some(method))
            }
            JoinError::InvalidRequest(msg) => (Code::InvalidArgument, msg, None),
            JoinError::Issuance(msg) => (Code::Internal, msg, None),
            JoinError::Canceled => (Code::Cancelled, "join canceled".to_string(), None),
            JoinError::DeadlineExceeded => (
                Code::DeadlineExceeded,
                "join deadline exceeded".to_string(),
                None,
            ),
        };

        let mut metadata = MetadataMap::new();
        metadata.insert(ERROR_KIND_KEY, MetadataValue::from_static(kind));
        if let Some(method) = method {
            // Method names that are not valid header values are dropped.
            if let Ok(value) = MetadataValue::try_from(method.as_str()) {
                metadata.insert(ERROR_METHOD_KEY, value);
            }
        }

        Status::with_metadata(code, message, metadata)
    }

    /// Recover the error a peer ended the stream with.
    ///
    /// Statuses without join metadata (connection resets, HTTP/2 errors, ...)
    /// become [`JoinError::Transport`], except cancellation and deadlines which
    /// keep their own variants.
    pub fn from_status(status: Status) -> Self {
        let kind = status
            .metadata()
            .get(ERROR_KIND_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let message = status.message().to_string();

        match kind.as_deref() {
            Some("unrecognized-message") => JoinError::UnrecognizedMessage(message),
            Some("unsupported-join-method") => JoinError::UnsupportedJoinMethod(message),
            Some("protocol-sequence-violation") => JoinError::ProtocolSequenceViolation(message),
            Some("verifier-rejected") => {
                let method = status
                    .metadata()
                    .get(ERROR_METHOD_KEY)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                JoinError::VerifierRejected {
                    method,
                    reason: message,
                }
            }
            Some("invalid-request") => JoinError::InvalidRequest(message),
            Some("issuance") => JoinError::Issuance(message),
            Some("canceled") => JoinError::Canceled,
            Some("deadline-exceeded") => JoinError::DeadlineExceeded,
            _ => match status.code() {
                Code::Cancelled => JoinError::Canceled,
                Code::DeadlineExceeded => JoinError::DeadlineExceeded,
                _ => JoinError::Transport(status),
            },
        }
    }
}

impl From<JoinError> for Status {
    fn from(err: JoinError) -> Self {
        err.into_status()
    }
}

/// The stream task an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTask {
    /// Opening the outbound stream (client side).
    Open,
    /// The join logic consuming the channels.
    Service,
    /// Reading and decoding wire messages.
    Recv,
    /// Encoding and writing wire messages.
    Send,
}

impl fmt::Display for StreamTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamTask::Open => "opening join stream",
            StreamTask::Service => "join service",
            StreamTask::Recv => "receiving from join stream",
            StreamTask::Send => "sending to join stream",
        })
    }
}

/// First error observed across the tasks of one join stream.
///
/// `Recv`/`Send`/`Open` failures point at the peer or the transport;
/// `Service` failures come from the join logic itself.
#[derive(Debug, Error)]
#[error("{task}: {source}")]
pub struct StreamError {
    pub task: StreamTask,
    #[source]
    pub source: JoinError,
}

impl StreamError {
    pub fn new(task: StreamTask, source: JoinError) -> Self {
        Self { task, source }
    }

    /// The underlying protocol error.
    pub fn error(&self) -> &JoinError {
        &self.source
    }

    pub fn into_inner(self) -> JoinError {
        self.source
    }

    /// Status sent to the peer when this error ends a server stream.
    pub fn into_status(self) -> Status {
        self.source.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(err: JoinError) -> JoinError {
        JoinError::from_status(Status::from(err))
    }

    #[test]
    fn unsupported_method_survives_status() {
        let err = round_trip(JoinError::UnsupportedJoinMethod("unknown-method".to_string()));
        match err {
            JoinError::UnsupportedJoinMethod(m) => assert_eq!(m, "unknown-method"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejection_keeps_method_and_reason() {
        let err = round_trip(JoinError::rejected("token", "token expired"));
        match err {
            JoinError::VerifierRejected { method, reason } => {
                assert_eq!(method, "token");
                assert_eq!(reason, "token expired");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_argument_variants_stay_distinct() {
        assert!(matches!(
            round_trip(JoinError::UnrecognizedMessage("empty payload".to_string())),
            JoinError::UnrecognizedMessage(m) if m == "empty payload"
        ));
        assert!(matches!(
            round_trip(JoinError::InvalidRequest("expired".to_string())),
            JoinError::InvalidRequest(m) if m == "expired"
        ));
    }

    #[test]
    fn status_codes_match_variants() {
        assert_eq!(
            Status::from(JoinError::sequence("second ClientInit")).code(),
            Code::FailedPrecondition
        );
        assert_eq!(Status::from(JoinError::Canceled).code(), Code::Cancelled);
        assert_eq!(
            Status::from(JoinError::Issuance("ca offline".to_string())).code(),
            Code::Internal
        );
    }

    #[test]
    fn plain_statuses_are_transport_failures() {
        assert!(matches!(
            JoinError::from_status(Status::unavailable("connection reset")),
            JoinError::Transport(_)
        ));
        assert!(matches!(
            JoinError::from_status(Status::cancelled("client went away")),
            JoinError::Canceled
        ));
    }

    #[test]
    fn stream_error_names_the_task() {
        let err = StreamError::new(StreamTask::Recv, JoinError::Canceled);
        assert_eq!(err.to_string(), "receiving from join stream: join canceled");
        assert!(matches!(err.into_inner(), JoinError::Canceled));
    }
}

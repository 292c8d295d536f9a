//! The error taxonomy shared by both peers of a session.

use std::fmt;

/// The six error kinds that may appear in a wire `["error", ...]` expression.
///
/// Anything received with an unrecognized kind string collapses to
/// [`ErrorKind::Internal`] when materialized locally, but the raw string is
/// preserved by the codec so that re-serialization is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The peer sent a malformed expression, violated a protocol invariant,
    /// or invoked with the wrong arity or types.
    BadRequest,
    /// A named method, property, or capability ID does not exist.
    NotFound,
    /// The capability was disposed by its owner.
    CapRevoked,
    /// Application-level authorization rejected the call.
    PermissionDenied,
    /// The operation was canceled before completion.
    Canceled,
    /// Any other failure: transport errors, unexpected exceptions.
    Internal,
}

impl ErrorKind {
    /// The wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::CapRevoked => "cap_revoked",
            Self::PermissionDenied => "permission_denied",
            Self::Canceled => "canceled",
            Self::Internal => "internal",
        }
    }

    /// Maps a wire string to a kind. Unknown strings become `Internal`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "bad_request" => Self::BadRequest,
            "not_found" => Self::NotFound,
            "cap_revoked" => Self::CapRevoked,
            "permission_denied" => Self::PermissionDenied,
            "canceled" => Self::Canceled,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RPC error: a kind, a human-readable message, and optional structured
/// data that rode along on the wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a structured data payload to the error.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn cap_revoked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapRevoked, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            ErrorKind::BadRequest,
            ErrorKind::NotFound,
            ErrorKind::CapRevoked,
            ErrorKind::PermissionDenied,
            ErrorKind::Canceled,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_wire(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_kind_collapses_to_internal() {
        assert_eq!(ErrorKind::from_wire("gremlins"), ErrorKind::Internal);
        assert_eq!(ErrorKind::from_wire(""), ErrorKind::Internal);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = RpcError::not_found("Method foo not found");
        assert_eq!(err.to_string(), "not_found: Method foo not found");
    }
}

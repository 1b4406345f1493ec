//! Error taxonomy shared by every transport.
//!
//! A single [`ErrorCode`] enum covers the core codes plus the transport-local
//! ones; adapters translate via [`Error::http_status`] and
//! [`Error::json_rpc_code`] so the mapping table lives in exactly one place.

use serde_json::Value;

/// Canonical error codes. Core codes first, transport-local codes after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    ValidationError,
    OutputValidationError,
    Unauthenticated,
    PermissionDenied,
    AlreadyExists,
    FailedPrecondition,
    RateLimited,
    ResourceExhausted,
    DeadlineExceeded,
    Unimplemented,
    Unavailable,
    Cancelled,
    DataLoss,
    InternalError,
    // Transport-local
    ParseError,
    InvalidEnvelope,
    MessageTooLarge,
    MethodNotAllowed,
    UnsupportedMediaType,
    NotAcceptable,
}

impl ErrorCode {
    /// Wire name, e.g. `NOT_FOUND`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::OutputValidationError => "OUTPUT_VALIDATION_ERROR",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::DataLoss => "DATA_LOSS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidEnvelope => "INVALID_ENVELOPE",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ErrorCode::NotAcceptable => "NOT_ACCEPTABLE",
        }
    }

    /// Parse a wire name back into a code. Unknown names map to `INTERNAL_ERROR`.
    pub fn parse(name: &str) -> Self {
        match name {
            "NOT_FOUND" => ErrorCode::NotFound,
            "INVALID_ARGUMENT" => ErrorCode::InvalidArgument,
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "OUTPUT_VALIDATION_ERROR" => ErrorCode::OutputValidationError,
            "UNAUTHENTICATED" => ErrorCode::Unauthenticated,
            "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
            "ALREADY_EXISTS" => ErrorCode::AlreadyExists,
            "FAILED_PRECONDITION" => ErrorCode::FailedPrecondition,
            "RATE_LIMITED" => ErrorCode::RateLimited,
            "RESOURCE_EXHAUSTED" => ErrorCode::ResourceExhausted,
            "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
            "UNIMPLEMENTED" => ErrorCode::Unimplemented,
            "UNAVAILABLE" => ErrorCode::Unavailable,
            "CANCELLED" => ErrorCode::Cancelled,
            "DATA_LOSS" => ErrorCode::DataLoss,
            "PARSE_ERROR" => ErrorCode::ParseError,
            "INVALID_ENVELOPE" => ErrorCode::InvalidEnvelope,
            "MESSAGE_TOO_LARGE" => ErrorCode::MessageTooLarge,
            "METHOD_NOT_ALLOWED" => ErrorCode::MethodNotAllowed,
            "UNSUPPORTED_MEDIA_TYPE" => ErrorCode::UnsupportedMediaType,
            "NOT_ACCEPTABLE" => ErrorCode::NotAcceptable,
            _ => ErrorCode::InternalError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed error carried through the pipeline and mapped per transport.
#[derive(Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedPrecondition, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_envelope(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidEnvelope, message)
    }

    pub fn message_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MessageTooLarge, message)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Cancelled | ErrorCode::DeadlineExceeded
        )
    }

    /// The error payload placed in error envelopes and HTTP bodies.
    ///
    /// Internal errors never carry their cause here; the cause stays in logs.
    pub fn to_payload(&self) -> Value {
        let mut payload = serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
        });
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }

    /// Rebuild an error from an error-envelope payload.
    pub fn from_payload(payload: &Value) -> Self {
        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .map(ErrorCode::parse)
            .unwrap_or(ErrorCode::InternalError);
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Self {
            code,
            message,
            details: payload.get("details").cloned(),
        }
    }

    /// HTTP status for this code, per the transport mapping table.
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::NotFound => 404,
            ErrorCode::ValidationError
            | ErrorCode::InvalidArgument
            | ErrorCode::ParseError
            | ErrorCode::InvalidEnvelope => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::AlreadyExists => 409,
            ErrorCode::FailedPrecondition => 412,
            ErrorCode::RateLimited | ErrorCode::ResourceExhausted => 429,
            ErrorCode::DeadlineExceeded => 504,
            ErrorCode::Unimplemented => 501,
            ErrorCode::Unavailable => 503,
            ErrorCode::Cancelled => 499,
            ErrorCode::MessageTooLarge => 413,
            ErrorCode::MethodNotAllowed => 405,
            ErrorCode::UnsupportedMediaType => 415,
            ErrorCode::NotAcceptable => 406,
            ErrorCode::OutputValidationError
            | ErrorCode::DataLoss
            | ErrorCode::InternalError => 500,
        }
    }

    /// JSON-RPC 2.0 error code, per the transport mapping table.
    pub fn json_rpc_code(&self) -> i64 {
        match self.code {
            ErrorCode::NotFound | ErrorCode::Unimplemented => -32601,
            ErrorCode::ValidationError | ErrorCode::InvalidArgument => -32602,
            ErrorCode::Unauthenticated => -32002,
            ErrorCode::PermissionDenied => -32003,
            ErrorCode::AlreadyExists => -32004,
            ErrorCode::RateLimited | ErrorCode::ResourceExhausted => -32005,
            ErrorCode::Unavailable => -32000,
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidEnvelope => -32600,
            ErrorCode::FailedPrecondition
            | ErrorCode::DeadlineExceeded
            | ErrorCode::Cancelled
            | ErrorCode::OutputValidationError
            | ErrorCode::DataLoss
            | ErrorCode::MessageTooLarge
            | ErrorCode::MethodNotAllowed
            | ErrorCode::UnsupportedMediaType
            | ErrorCode::NotAcceptable
            | ErrorCode::InternalError => -32603,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::parse(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping_matches_table() {
        let cases = [
            (ErrorCode::NotFound, 404),
            (ErrorCode::ValidationError, 400),
            (ErrorCode::InvalidArgument, 400),
            (ErrorCode::Unauthenticated, 401),
            (ErrorCode::PermissionDenied, 403),
            (ErrorCode::AlreadyExists, 409),
            (ErrorCode::FailedPrecondition, 412),
            (ErrorCode::RateLimited, 429),
            (ErrorCode::ResourceExhausted, 429),
            (ErrorCode::DeadlineExceeded, 504),
            (ErrorCode::Unimplemented, 501),
            (ErrorCode::Unavailable, 503),
            (ErrorCode::Cancelled, 499),
            (ErrorCode::ParseError, 400),
            (ErrorCode::InternalError, 500),
            (ErrorCode::DataLoss, 500),
            (ErrorCode::MessageTooLarge, 413),
            (ErrorCode::MethodNotAllowed, 405),
            (ErrorCode::UnsupportedMediaType, 415),
            (ErrorCode::NotAcceptable, 406),
        ];
        for (code, status) in cases {
            assert_eq!(Error::new(code, "x").http_status(), status, "{code}");
        }
    }

    #[test]
    fn json_rpc_mapping_matches_table() {
        let cases = [
            (ErrorCode::NotFound, -32601),
            (ErrorCode::ValidationError, -32602),
            (ErrorCode::InvalidArgument, -32602),
            (ErrorCode::Unauthenticated, -32002),
            (ErrorCode::PermissionDenied, -32003),
            (ErrorCode::AlreadyExists, -32004),
            (ErrorCode::FailedPrecondition, -32603),
            (ErrorCode::RateLimited, -32005),
            (ErrorCode::ResourceExhausted, -32005),
            (ErrorCode::DeadlineExceeded, -32603),
            (ErrorCode::Unimplemented, -32601),
            (ErrorCode::Unavailable, -32000),
            (ErrorCode::Cancelled, -32603),
            (ErrorCode::ParseError, -32700),
            (ErrorCode::InvalidEnvelope, -32600),
            (ErrorCode::InternalError, -32603),
        ];
        for (code, rpc) in cases {
            assert_eq!(Error::new(code, "x").json_rpc_code(), rpc, "{code}");
        }
    }

    #[test]
    fn payload_round_trip() {
        let err = Error::validation("bad input").with_details(serde_json::json!({"field": "name"}));
        let payload = err.to_payload();
        assert_eq!(payload["code"], "VALIDATION_ERROR");
        assert_eq!(payload["details"]["field"], "name");
        let back = Error::from_payload(&payload);
        assert_eq!(back.code, ErrorCode::ValidationError);
        assert_eq!(back.message, "bad input");
    }

    #[test]
    fn wire_names_round_trip() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::Cancelled,
            ErrorCode::MessageTooLarge,
            ErrorCode::OutputValidationError,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
        assert_eq!(ErrorCode::parse("NO_SUCH_CODE"), ErrorCode::InternalError);
    }
}

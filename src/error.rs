use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures of the SNS notifier outside of an inbound HTTP exchange.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("invalid SNS configuration: {0}")]
    InvalidConfig(String),

    #[error("SNS subscription is not ready")]
    NotReady,

    #[error("timed out queueing message for publish after {0:?}")]
    PublishTimeout(Duration),

    #[error("publish channel closed")]
    Closed,

    #[error("AWS SNS {operation} failed: {message}")]
    Aws {
        operation: &'static str,
        message: String,
    },

    #[error("DNS not ready for {host}: {reason}")]
    Dns { host: String, reason: String },
}

impl NotifierError {
    pub fn aws(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Aws {
            operation,
            message: err.to_string(),
        }
    }
}

/// Failures while checking the authenticity of an SNS message.
///
/// A signature that simply does not verify is not an error; see
/// [`crate::verification::SignatureValidator::validate`].
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("failed to fetch signing certificate {url}: {source}")]
    CertificateFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("signing certificate {url} returned HTTP {status}")]
    CertificateStatus { url: String, status: u16 },

    #[error("invalid signing certificate: {0}")]
    Certificate(#[source] openssl::error::ErrorStack),

    #[error("cannot determine message format for type {0:?}")]
    UnknownMessageType(String),

    #[error("unsupported signature version {0:?}")]
    UnsupportedVersion(String),

    #[error("signature verification failed: {0}")]
    Verification(#[source] openssl::error::ErrorStack),
}

/// Failures fetching the current hook list from a peer at startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("unable to obtain hook list within {0:?}")]
    Timeout(Duration),

    #[error("failed to obtain service access token: {0}")]
    Auth(String),

    #[error("hook list request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("hook list request returned HTTP {0}")]
    Status(u16),

    #[error("failed to decode hook list: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("peer returned an empty hook list")]
    Empty,
}

/// Reasons a webhook registration is refused. All map to HTTP 400.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid config url: {0}")]
    InvalidUrl(String),

    #[error("invalid content_type {0:?}: must be \"json\"")]
    InvalidContentType(String),

    #[error("events must not be empty")]
    MissingEvents,

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Error body for SNS callback endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// A rejected inbound SNS callback, rendered as `{code, message}`.
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct HandlerError {
    pub status: StatusCode,
    pub message: String,
}

impl HandlerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.status.as_u16(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

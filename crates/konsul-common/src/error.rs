//! Core error type for Konsul.
//!
//! `ConError` models exactly the error kinds a core component (KV store,
//! service registry, ACL engine, rate limiter, persistence mirror) can
//! surface. HTTP/DNS status mapping lives at the transport boundary, not
//! here — this type only carries the information needed to render it.

use std::fmt;

use serde::Serialize;

/// The eight error kinds a core operation can fail with.
#[derive(thiserror::Error, Debug)]
pub enum ConError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cas conflict on '{key}': expected {expected}, current {current}")]
    CasConflict {
        key: String,
        expected: u64,
        current: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("too many watchers for client '{0}'")]
    TooManyWatchers(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConError {
    /// Stable machine-readable tag, used both in the JSON envelope and in logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConError::NotFound(_) => ErrorKind::NotFound,
            ConError::CasConflict { .. } => ErrorKind::CasConflict,
            ConError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConError::Unauthorized => ErrorKind::Unauthorized,
            ConError::Forbidden(_) => ErrorKind::Forbidden,
            ConError::RateLimited { .. } => ErrorKind::RateLimited,
            ConError::TooManyWatchers(_) => ErrorKind::TooManyWatchers,
            ConError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ConError::NotFound(what.into())
    }

    pub fn cas_conflict(key: impl Into<String>, expected: u64, current: u64) -> Self {
        ConError::CasConflict {
            key: key.into(),
            expected,
            current,
        }
    }

    pub fn invalid_argument(what: impl Into<String>) -> Self {
        ConError::InvalidArgument(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        ConError::Internal(what.into())
    }
}

/// Machine-readable error kind, serialized as the `error` field of the
/// JSON envelope (see `ErrorEnvelope`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    CasConflict,
    InvalidArgument,
    Unauthorized,
    Forbidden,
    RateLimited,
    TooManyWatchers,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::CasConflict => "cas_conflict",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TooManyWatchers => "too_many_watchers",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Wire shape for `{error, message, request_id?, timestamp, path}` (spec §7).
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub path: String,
}

impl ErrorEnvelope {
    pub fn new(err: &ConError, path: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            error: err.kind(),
            message: err.to_string(),
            request_id,
            timestamp: chrono::Utc::now(),
            path: path.into(),
        }
    }
}

//! Error types for request classification, rendering and configuration.
//!
//! `RscError` covers failures the protocol itself can detect (bad wire
//! encodings, a consumed body, an unknown function id). User callbacks return
//! `anyhow::Result` instead; the [`outcome`](crate::outcome) module turns either
//! kind into an HTTP response.

use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RscError>;

#[derive(Debug, Error)]
pub enum RscError {
    /// Malformed RSC path or function id
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// No route produced a response
    #[error("not found: {0}")]
    NotFound(String),

    /// The request body was already taken by an earlier consumer
    #[error("request body already consumed")]
    BodyConsumed,

    /// Function id decoded correctly but nothing is registered under it
    #[error("unknown server function: {0}")]
    UnknownFunction(String),

    /// Request body could not be decoded into arguments or form data
    #[error("failed to decode request body: {0}")]
    Decode(String),

    /// Serialization or page rendering failed
    #[error("render failed: {0}")]
    Render(String),

    /// Snapshot pathname resolves outside the output directory
    #[error("invalid output path: {0}")]
    InvalidOutputPath(String),

    /// Request context accessed outside a request scope
    #[error("request context is not available outside a request")]
    ContextUnavailable,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RscError {
    /// HTTP status this error maps to when it reaches the dispatcher boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            RscError::InvalidEncoding(_) | RscError::Decode(_) => StatusCode::BAD_REQUEST,
            RscError::NotFound(_) | RscError::UnknownFunction(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<multer::Error> for RscError {
    fn from(err: multer::Error) -> Self {
        RscError::Decode(err.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {value}\n\nHint: {hint}")]
    InvalidValue {
        field: String,
        value: String,
        hint: String,
    },

    #[error("unknown middleware '{0}'\n\nHint: register it with MiddlewareRegistry::register")]
    UnknownMiddleware(String),

    #[error("failed to load configuration: {0}")]
    Load(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}

//! Failure classification.
//!
//! Any error reaching the dispatcher boundary is turned into an
//! [`OutcomeInfo`] and written into the response, so every request ends with
//! some HTTP response. User code raises [`HttpError`] to pick the status or
//! request a redirect.

use crate::error::RscError;
use crate::middleware::ResponseContext;
use crate::stream::string_to_stream;
use axum::http::{header, HeaderValue, StatusCode};
use sha2::{Digest, Sha256};
use std::fmt;

/// Leading field of every [`HttpError`] digest.
pub const DIGEST_PREFIX: &str = "FOB_RSC_ERROR";

/// Error carrying HTTP semantics, raised by user handlers.
///
/// ```
/// use fob_rsc::HttpError;
///
/// let err = HttpError::redirect("/login");
/// assert_eq!(err.status().as_u16(), 307);
/// assert_eq!(err.digest(), "FOB_RSC_ERROR;307;/login");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    status: StatusCode,
    location: Option<String>,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            location: None,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Temporary redirect (307).
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::redirect_with_status(location, StatusCode::TEMPORARY_REDIRECT)
    }

    pub fn redirect_with_status(location: impl Into<String>, status: StatusCode) -> Self {
        let location = location.into();
        Self {
            status,
            message: format!("Redirect to {location}"),
            location: Some(location),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Client-safe encoding of status and location.
    pub fn digest(&self) -> String {
        format!(
            "{DIGEST_PREFIX};{};{}",
            self.status.as_u16(),
            self.location.as_deref().unwrap_or_default()
        )
    }

    /// Parse a digest produced by [`digest`](Self::digest).
    pub fn from_digest(digest: &str) -> Option<Self> {
        let mut parts = digest.splitn(3, ';');
        if parts.next()? != DIGEST_PREFIX {
            return None;
        }
        let status = parts.next()?.parse::<u16>().ok()?;
        let status = StatusCode::from_u16(status).ok()?;
        let location = parts.next().filter(|l| !l.is_empty()).map(str::to_string);
        let message = match &location {
            Some(location) => format!("Redirect to {location}"),
            None => status.canonical_reason().unwrap_or("Error").to_string(),
        };
        Some(Self {
            status,
            location,
            message,
        })
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// HTTP outcome derived from a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeInfo {
    pub status: StatusCode,
    pub location: Option<String>,
    pub message: String,
}

impl OutcomeInfo {
    /// Overwrite status and body and set `location` if present.
    ///
    /// Headers already on the response are kept.
    pub fn apply(self, res: &mut ResponseContext) {
        res.status = Some(self.status);
        res.body = Some(string_to_stream(self.message));
        if let Some(location) = self.location {
            match HeaderValue::from_str(&location) {
                Ok(value) => {
                    res.headers.insert(header::LOCATION, value);
                }
                Err(_) => {
                    tracing::warn!(%location, "dropping redirect location that is not a valid header value");
                }
            }
        }
    }
}

/// Classify an arbitrary failure.
///
/// Walks the error chain: the first [`HttpError`], digest-encoded
/// [`HttpError`], or [`RscError`] decides the status. Anything else is a 500.
/// The body is the outermost message only; causes stay in the logs.
pub fn error_info(err: &anyhow::Error) -> OutcomeInfo {
    let message = err.to_string();

    for cause in err.chain() {
        if let Some(http) = cause.downcast_ref::<HttpError>() {
            return OutcomeInfo {
                status: http.status,
                location: http.location.clone(),
                message,
            };
        }
        if let Some(rsc) = cause.downcast_ref::<RscError>() {
            return OutcomeInfo {
                status: rsc.status(),
                location: None,
                message,
            };
        }
        if let Some(http) = HttpError::from_digest(&cause.to_string()) {
            return OutcomeInfo {
                status: http.status,
                location: http.location,
                message,
            };
        }
    }

    OutcomeInfo {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        location: None,
        message,
    }
}

/// Classify `err` and write the outcome into `res`.
pub fn apply_error(res: &mut ResponseContext, err: &anyhow::Error) -> StatusCode {
    let info = error_info(err);
    let status = info.status;
    if status.is_server_error() {
        let detail = format!("{err:#}");
        tracing::error!(status = status.as_u16(), error = %detail, "request failed");
    } else {
        tracing::debug!(status = status.as_u16(), error = %err, "request ended with error status");
    }
    info.apply(res);
    status
}

/// Digest sent to the client for a failure raised during serialization.
///
/// [`HttpError`]s keep their own digest so the client can still act on a
/// redirect. Everything else becomes an opaque hash of the message, logged
/// alongside the full error for correlation.
pub fn serialization_digest(err: &anyhow::Error) -> String {
    if let Some(http) = err.chain().find_map(|c| c.downcast_ref::<HttpError>()) {
        return http.digest();
    }

    let detail = format!("{err:#}");
    let digest = opaque_digest(&detail);
    tracing::error!(%digest, error = %detail, "error while serializing payload");
    digest
}

/// Short SHA-256 hex digest of `text`.
fn opaque_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collect_string;
    use anyhow::Context;

    #[test]
    fn test_digest_round_trip() {
        let err = HttpError::redirect("/login?next=/a;b");
        let parsed = HttpError::from_digest(&err.digest()).unwrap();
        assert_eq!(parsed.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(parsed.location(), Some("/login?next=/a;b"));

        let parsed = HttpError::from_digest(&HttpError::forbidden("no").digest()).unwrap();
        assert_eq!(parsed.status(), StatusCode::FORBIDDEN);
        assert_eq!(parsed.location(), None);

        assert!(HttpError::from_digest("OTHER;404;").is_none());
        assert!(HttpError::from_digest("FOB_RSC_ERROR;abc;").is_none());
    }

    #[test]
    fn test_error_info_defaults_to_500() {
        let err = anyhow::anyhow!("database exploded");
        let info = error_info(&err);
        assert_eq!(info.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(info.location, None);
        assert_eq!(info.message, "database exploded");
    }

    #[test]
    fn test_error_info_finds_http_error_in_chain() {
        let err = Err::<(), _>(HttpError::unauthorized("log in first"))
            .context("loading dashboard")
            .unwrap_err();
        let info = error_info(&err);
        assert_eq!(info.status, StatusCode::UNAUTHORIZED);
        assert_eq!(info.message, "loading dashboard");
    }

    #[test]
    fn test_error_info_maps_rsc_errors() {
        let err = anyhow::Error::from(RscError::InvalidEncoding("x".into()));
        assert_eq!(error_info(&err).status, StatusCode::BAD_REQUEST);

        let err = anyhow::Error::from(RscError::UnknownFunction("a#b".into()));
        assert_eq!(error_info(&err).status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_info_reads_digest_messages() {
        let err = anyhow::anyhow!("{}", HttpError::redirect("/next").digest());
        let info = error_info(&err);
        assert_eq!(info.status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(info.location.as_deref(), Some("/next"));
    }

    #[tokio::test]
    async fn test_apply_error_keeps_existing_headers() {
        let mut res = ResponseContext::default();
        res.headers
            .insert("x-request-id", HeaderValue::from_static("abc"));

        let err = anyhow::Error::new(HttpError::redirect("/home"));
        let status = apply_error(&mut res, &err);

        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(res.status, Some(StatusCode::TEMPORARY_REDIRECT));
        assert_eq!(res.headers.get(header::LOCATION).unwrap(), "/home");
        assert_eq!(res.headers.get("x-request-id").unwrap(), "abc");
        let body = collect_string(res.body.take().unwrap()).await.unwrap();
        assert_eq!(body, "Redirect to /home");
    }

    #[test]
    fn test_serialization_digest() {
        let http = anyhow::Error::new(HttpError::not_found("gone"));
        assert_eq!(serialization_digest(&http), "FOB_RSC_ERROR;404;");

        let opaque = serialization_digest(&anyhow::anyhow!("password=hunter2"));
        assert_eq!(opaque.len(), 16);
        assert!(!opaque.contains("hunter2"));
        assert_eq!(opaque, serialization_digest(&anyhow::anyhow!("password=hunter2")));
    }
}

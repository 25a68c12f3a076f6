//! HTTP transport adapter.
//!
//! Bridges axum requests into the middleware [`Pipeline`] and turns the
//! resulting [`ResponseContext`] back into an axum response. Optionally serves
//! a directory of prebuilt snapshot files first and falls back to the
//! pipeline for anything not found on disk.

use crate::error::{ConfigError, Result, RscError};
use crate::middleware::{MiddlewareRegistry, Pipeline, PipelineCache, ResponseContext};
use crate::render::RscHandler;
use crate::request::{RequestBody, RequestMeta};
use axum::body::HttpBody;
use axum::extract::{Request, State};
use axum::http::uri::Authority;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::TryStreamExt;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use url::Url;

/// State shared by every request.
pub struct ServerState {
    handler: Arc<RscHandler>,
    registry: MiddlewareRegistry,
    pipeline: PipelineCache,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(handler: Arc<RscHandler>, registry: MiddlewareRegistry) -> Self {
        Self {
            handler,
            registry,
            pipeline: PipelineCache::new(),
        }
    }

    pub fn handler(&self) -> &Arc<RscHandler> {
        &self.handler
    }

    /// The configured pipeline, built on first use.
    pub fn pipeline(&self) -> std::result::Result<Pipeline, ConfigError> {
        self.pipeline.get_or_try_init(|| {
            self.registry
                .build(&self.handler.config().middleware, &self.handler)
        })
    }

    /// Forget the built pipeline so the next request rebuilds it.
    pub fn reset_pipeline(&self) {
        self.pipeline.reset();
    }

    /// Run one request through the pipeline.
    pub async fn handle(&self, req: RequestMeta) -> ResponseContext {
        let pipeline = match self.pipeline() {
            Ok(pipeline) => pipeline,
            Err(err) => {
                let err = anyhow::Error::new(RscError::from(err));
                let mut res = ResponseContext::default();
                crate::outcome::apply_error(&mut res, &err);
                return res;
            }
        };

        let mut res = pipeline.handle(req).await;
        if res.is_empty() {
            res.set_text(StatusCode::NOT_FOUND, "404 Not Found");
        }
        res
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("handler", &self.handler)
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// RSC server over axum.
pub struct RscServer {
    state: SharedState,
    static_dir: Option<PathBuf>,
}

impl RscServer {
    /// Server with the built-in middleware registry.
    pub fn new(handler: Arc<RscHandler>) -> Self {
        Self::with_registry(handler, MiddlewareRegistry::with_builtins())
    }

    pub fn with_registry(handler: Arc<RscHandler>, registry: MiddlewareRegistry) -> Self {
        Self {
            state: Arc::new(ServerState::new(handler, registry)),
            static_dir: None,
        }
    }

    /// Serve files from `dir` before falling back to the pipeline.
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let rsc = Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&self.state));

        match &self.static_dir {
            Some(dir) => Router::new().fallback_service(
                ServeDir::new(dir)
                    .call_fallback_on_method_not_allowed(true)
                    .fallback(rsc),
            ),
            None => rsc,
        }
    }

    /// Serve on `listener` until the server stops.
    ///
    /// # Errors
    ///
    /// Returns [`RscError::Io`] if the server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let app = self.router();
        tracing::info!(%addr, "rsc server listening");

        axum::serve(listener, app).await.map_err(RscError::Io)
    }
}

impl fmt::Debug for RscServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RscServer")
            .field("state", &self.state)
            .field("static_dir", &self.static_dir)
            .finish()
    }
}

async fn handle_request(State(state): State<SharedState>, request: Request) -> Response {
    let req = match to_request_meta(request) {
        Ok(req) => req,
        Err(err) => {
            tracing::debug!(error = %err, "rejecting malformed request");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    state.handle(req).await.into_response()
}

/// Convert an axum request into the transport-independent view.
pub fn to_request_meta(request: Request) -> Result<RequestMeta> {
    let (parts, body) = request.into_parts();
    let url = request_url(&parts.uri, &parts.headers)?;

    let body = if body.is_end_stream() {
        RequestBody::empty()
    } else {
        RequestBody::new(Box::pin(body.into_data_stream().map_err(io::Error::other)))
    };

    Ok(RequestMeta::new(parts.method, url, parts.headers, body))
}

/// Absolute URL of the request. The host comes from the URI or the `Host`
/// header and is only used when it is a plain authority without user info;
/// anything else falls back to `localhost` so it cannot alter the path.
fn request_url(uri: &axum::http::Uri, headers: &HeaderMap) -> Result<Url> {
    let host = uri
        .authority()
        .cloned()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|value| Authority::try_from(value.as_bytes()).ok())
        })
        .filter(|authority| !authority.as_str().contains('@'))
        .map(|authority| authority.as_str().to_string())
        .unwrap_or_else(|| "localhost".to_string());
    let scheme = uri.scheme_str().unwrap_or("http");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Url::parse(&format!("{scheme}://{host}{path}"))
        .map_err(|e| RscError::InvalidEncoding(format!("invalid request url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Uri};

    #[test]
    fn test_request_url_uses_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "example.com:3000".parse().unwrap());
        let uri: Uri = "/RSC/_.txt?x=1".parse().unwrap();
        let url = request_url(&uri, &headers).unwrap();
        assert_eq!(url.as_str(), "http://example.com:3000/RSC/_.txt?x=1");
    }

    #[test]
    fn test_request_url_ignores_host_that_is_not_an_authority() {
        let uri: Uri = "/_.txt".parse().unwrap();
        for host in ["evil/RSC", "evil?x=", "evil#frag", "user@evil"] {
            let mut headers = HeaderMap::new();
            headers.insert(header::HOST, host.parse().unwrap());
            let url = request_url(&uri, &headers).unwrap();
            assert_eq!(url.as_str(), "http://localhost/_.txt", "host {host}");
            assert_eq!(url.path(), "/_.txt");
        }
    }

    #[test]
    fn test_request_url_defaults_to_localhost() {
        let uri: Uri = "/".parse().unwrap();
        let url = request_url(&uri, &HeaderMap::new()).unwrap();
        assert_eq!(url.as_str(), "http://localhost/");
    }

    #[tokio::test]
    async fn test_to_request_meta_body_presence() {
        let request = axum::http::Request::builder()
            .method(Method::GET)
            .uri("/page")
            .body(Body::empty())
            .unwrap();
        let meta = to_request_meta(request).unwrap();
        assert!(!meta.body.is_present());
        assert_eq!(meta.pathname(), "/page");

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api")
            .body(Body::from("payload"))
            .unwrap();
        let meta = to_request_meta(request).unwrap();
        assert!(meta.body.is_present());
        assert_eq!(meta.body.text().await.unwrap(), "payload");
    }
}

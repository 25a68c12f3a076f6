//! Ordered middleware pipeline.
//!
//! Each [`Middleware`] receives the request context and a [`Next`]
//! continuation. Calling [`Next::run`] runs the rest of the chain; calling it
//! again is a no-op. A middleware that never calls it ends the chain, and
//! whatever it left in [`HandlerContext::res`] is the response. Code after
//! `next.run(ctx).await` sees the response produced further down and may
//! still change it.
//!
//! Middleware is configured by name. [`MiddlewareRegistry`] maps names to
//! factories; the built-ins are:
//!
//! | Name | Middleware |
//! |---|---|
//! | `context` | [`ContextMiddleware`] |
//! | `request-log` | [`RequestLogMiddleware`] |
//! | `handler` | [`HandlerMiddleware`] |

use crate::context::{self, ContextData, RequestContext};
use crate::error::ConfigError;
use crate::outcome::apply_error;
use crate::render::{Dispatch, RscHandler};
use crate::request::RequestMeta;
use crate::stream::{string_to_stream, ByteStream};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Mutable response built up by the pipeline.
#[derive(Default)]
pub struct ResponseContext {
    pub body: Option<ByteStream>,
    /// Defaults to 200 when unset
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
}

impl ResponseContext {
    /// True until some middleware sets a body or status.
    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.status.is_none()
    }

    pub fn set_text(&mut self, status: StatusCode, text: impl Into<String>) {
        self.status = Some(status);
        self.body = Some(string_to_stream(text));
    }

    /// Set a header, ignoring values that are not valid header values.
    pub fn set_header(&mut self, name: header::HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    pub fn into_response(self) -> Response {
        let body = match self.body {
            Some(stream) => Body::from_stream(stream),
            None => Body::empty(),
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseContext")
            .field("body", &self.body.is_some())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Per-request state passed through the pipeline.
#[derive(Debug)]
pub struct HandlerContext {
    pub req: RequestMeta,
    pub res: ResponseContext,
    pub data: ContextData,
}

impl HandlerContext {
    pub fn new(req: RequestMeta) -> Self {
        Self {
            req,
            res: ResponseContext::default(),
            data: ContextData::new(),
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut HandlerContext, next: &mut Next<'_>) -> anyhow::Result<()>;
}

/// Continuation into the rest of the chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    called: bool,
}

impl<'a> Next<'a> {
    /// Run the remaining middleware. Only the first call has any effect.
    pub async fn run(&mut self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        if self.called {
            return Ok(());
        }
        self.called = true;
        run_chain(self.rest, ctx).await
    }

    pub fn was_called(&self) -> bool {
        self.called
    }
}

fn run_chain<'a>(
    chain: &'a [Arc<dyn Middleware>],
    ctx: &'a mut HandlerContext,
) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async move {
        let Some((first, rest)) = chain.split_first() else {
            return Ok(());
        };
        let mut next = Next {
            rest,
            called: false,
        };
        first.handle(ctx, &mut next).await
    })
}

/// A built middleware chain.
#[derive(Clone)]
pub struct Pipeline {
    middleware: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    pub fn new(middleware: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middleware: middleware.into(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run the chain over `ctx`.
    pub async fn run(&self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        run_chain(&self.middleware, ctx).await
    }

    /// Run the chain for `req` and return the response context.
    ///
    /// A middleware error is classified into the response, so this always
    /// yields something to send.
    pub async fn handle(&self, req: RequestMeta) -> ResponseContext {
        let mut ctx = HandlerContext::new(req);
        if let Err(err) = self.run(&mut ctx).await {
            apply_error(&mut ctx.res, &err);
        }
        ctx.res
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pipeline").field(&self.names()).finish()
    }
}

/// Lazily built pipeline with explicit invalidation.
#[derive(Default)]
pub struct PipelineCache {
    pipeline: RwLock<Option<Pipeline>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached pipeline, building it with `init` on first use.
    pub fn get_or_try_init<F, E>(&self, init: F) -> Result<Pipeline, E>
    where
        F: FnOnce() -> Result<Pipeline, E>,
    {
        if let Some(pipeline) = self.pipeline.read().as_ref() {
            return Ok(pipeline.clone());
        }

        let mut slot = self.pipeline.write();
        if let Some(pipeline) = slot.as_ref() {
            return Ok(pipeline.clone());
        }
        let pipeline = init()?;
        *slot = Some(pipeline.clone());
        Ok(pipeline)
    }

    pub fn get(&self) -> Option<Pipeline> {
        self.pipeline.read().clone()
    }

    /// Drop the cached pipeline; the next request rebuilds it.
    pub fn reset(&self) {
        *self.pipeline.write() = None;
    }
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("pipeline", &*self.pipeline.read())
            .finish()
    }
}

/// Builds a middleware instance for a handler.
pub type MiddlewareFactory = Arc<dyn Fn(&Arc<RscHandler>) -> Arc<dyn Middleware> + Send + Sync>;

/// Named middleware factories.
#[derive(Clone)]
pub struct MiddlewareRegistry {
    factories: IndexMap<String, MiddlewareFactory>,
}

impl MiddlewareRegistry {
    /// Registry with no entries.
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Registry with `context`, `request-log` and `handler`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("context", |_| ContextMiddleware);
        registry.register("request-log", |_| RequestLogMiddleware);
        registry.register("handler", |handler| HandlerMiddleware::new(Arc::clone(handler)));
        registry
    }

    /// Register a factory, replacing any previous one under `name`.
    pub fn register<F, M>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Arc<RscHandler>) -> M + Send + Sync + 'static,
        M: Middleware + 'static,
    {
        let factory: MiddlewareFactory =
            Arc::new(move |handler: &Arc<RscHandler>| Arc::new(factory(handler)) as Arc<dyn Middleware>);
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build a pipeline from names, in order.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownMiddleware`] for an unregistered name.
    pub fn build(&self, names: &[String], handler: &Arc<RscHandler>) -> Result<Pipeline, ConfigError> {
        let middleware = names
            .iter()
            .map(|name| {
                self.factories
                    .get(name)
                    .map(|factory| factory(handler))
                    .ok_or_else(|| ConfigError::UnknownMiddleware(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(middleware = ?names, "built middleware pipeline");
        Ok(Pipeline::new(middleware))
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MiddlewareRegistry")
            .field(&self.names())
            .finish()
    }
}

/// Runs the rest of the chain inside a request context scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextMiddleware;

#[async_trait]
impl Middleware for ContextMiddleware {
    fn name(&self) -> &str {
        "context"
    }

    async fn handle(&self, ctx: &mut HandlerContext, next: &mut Next<'_>) -> anyhow::Result<()> {
        let scoped = RequestContext::new(ctx.req.clone(), ctx.data.clone());
        context::scope(scoped, next.run(ctx)).await
    }
}

/// Logs one line per request with final status and latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogMiddleware;

#[async_trait]
impl Middleware for RequestLogMiddleware {
    fn name(&self) -> &str {
        "request-log"
    }

    async fn handle(&self, ctx: &mut HandlerContext, next: &mut Next<'_>) -> anyhow::Result<()> {
        let start = Instant::now();
        let method = ctx.req.method.clone();
        let path = ctx.req.pathname().to_string();

        let result = next.run(ctx).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => {
                let status = ctx.res.status.unwrap_or(StatusCode::OK).as_u16();
                tracing::info!(%method, %path, status, elapsed_ms, "request");
            }
            Err(err) => {
                tracing::warn!(%method, %path, elapsed_ms, error = %err, "request failed");
            }
        }
        result
    }
}

/// Dispatches to the [`RscHandler`].
///
/// When the application's entry produces nothing, the rest of the chain runs
/// first; the root shell or 404 fallback is only applied if the response is
/// still empty afterwards.
#[derive(Debug, Clone)]
pub struct HandlerMiddleware {
    handler: Arc<RscHandler>,
}

impl HandlerMiddleware {
    pub fn new(handler: Arc<RscHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Middleware for HandlerMiddleware {
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, ctx: &mut HandlerContext, next: &mut Next<'_>) -> anyhow::Result<()> {
        let pathname = ctx.req.pathname().to_string();
        match self.handler.dispatch(ctx.req.clone(), &mut ctx.res).await {
            Dispatch::Responded(status) => {
                tracing::debug!(%pathname, status = status.as_u16(), "handled");
                Ok(())
            }
            Dispatch::Unhandled => {
                next.run(ctx).await?;
                if ctx.res.is_empty() {
                    self.handler.apply_fallback(&pathname, &mut ctx.res).await;
                }
                Ok(())
            }
        }
    }
}

//! Render orchestration.
//!
//! [`RscHandler`] classifies a request, hands the [`DispatchInput`] to the
//! application's [`ServerEntry`] together with a [`RenderOps`], and writes the
//! returned [`HandlerOutput`] (or the classified failure) into the response.

use crate::classify::{Classified, Classifier, DispatchInput};
use crate::config::RscConfig;
use crate::html::{HtmlOptions, HtmlRenderer};
use crate::middleware::ResponseContext;
use crate::outcome::{apply_error, serialization_digest};
use crate::request::RequestMeta;
use crate::runtime::{
    Element, Elements, ErrorDigest, FunctionRegistry, RscRuntime, SerializeOptions,
    TemporaryReferences,
};
use crate::snapshot::{BuildOps, BuildTask};
use crate::stream::{string_to_stream, ByteStream};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures::stream::{self, BoxStream};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Content type of rendered pages.
pub const HTML_CONTENT_TYPE: &str = "text/html";

/// Key of the page tree inside its own serialized payload.
const PAGE_TREE_KEY: &str = "root";

/// Options for [`RenderOps::render_page`].
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    /// Form state from a script-less action, replayed on hydration
    pub form_state: Option<Value>,
    /// RSC path the client hydrates from
    pub rsc_path: Option<String>,
}

/// Rendering primitives handed to user code.
#[derive(Clone)]
pub struct RenderOps {
    runtime: Arc<dyn RscRuntime>,
    html: Arc<dyn HtmlRenderer>,
    temporary_references: Option<TemporaryReferences>,
    rsc_path: Option<String>,
    debug_nojs: bool,
    nonce: Option<String>,
}

impl RenderOps {
    pub fn new(runtime: Arc<dyn RscRuntime>, html: Arc<dyn HtmlRenderer>) -> Self {
        Self {
            runtime,
            html,
            temporary_references: None,
            rsc_path: None,
            debug_nojs: false,
            nonce: None,
        }
    }

    /// RSC path used for hydration when [`PageOptions::rsc_path`] is unset.
    pub fn with_rsc_path(mut self, rsc_path: Option<String>) -> Self {
        self.rsc_path = rsc_path;
        self
    }

    pub fn with_temporary_references(mut self, refs: Option<TemporaryReferences>) -> Self {
        self.temporary_references = refs;
        self
    }

    pub fn with_debug_nojs(mut self, debug_nojs: bool) -> Self {
        self.debug_nojs = debug_nojs;
        self
    }

    pub fn with_nonce(mut self, nonce: Option<String>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn debug_nojs(&self) -> bool {
        self.debug_nojs
    }

    /// Content type of [`render_data`](Self::render_data) output.
    pub fn content_type(&self) -> &'static str {
        self.runtime.content_type()
    }

    fn digest_errors() -> ErrorDigest {
        Arc::new(|err| Some(serialization_digest(err)))
    }

    /// Serialize render roots into a payload stream.
    ///
    /// Failures inside individual elements reach the client as digests only.
    pub fn render_data(&self, elements: Elements) -> ByteStream {
        self.runtime.serialize(
            elements,
            SerializeOptions {
                temporary_references: self.temporary_references.clone(),
                on_error: Some(Self::digest_errors()),
            },
        )
    }

    /// Render an HTML page from render roots and a page tree.
    pub async fn render_page(
        &self,
        elements: Elements,
        page: Element,
        options: PageOptions,
    ) -> anyhow::Result<HandlerOutput> {
        let serialize_options = SerializeOptions {
            temporary_references: None,
            on_error: Some(Self::digest_errors()),
        };
        let data = self.runtime.serialize(elements, serialize_options.clone());

        let mut tree = Elements::new();
        tree.insert(PAGE_TREE_KEY.to_string(), page);
        let tree = self.runtime.serialize(tree, serialize_options);

        let body = self
            .html
            .render(
                data,
                tree,
                HtmlOptions {
                    form_state: options.form_state,
                    rsc_path: options.rsc_path.or_else(|| self.rsc_path.clone()),
                    debug_nojs: self.debug_nojs,
                    nonce: self.nonce.clone(),
                },
            )
            .await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(HTML_CONTENT_TYPE),
        );
        Ok(HandlerOutput::Parts {
            body: Some(body),
            status: None,
            headers,
        })
    }
}

impl fmt::Debug for RenderOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderOps")
            .field("temporary_references", &self.temporary_references)
            .field("rsc_path", &self.rsc_path)
            .field("debug_nojs", &self.debug_nojs)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

/// What a [`ServerEntry`] returns for a request.
pub enum HandlerOutput {
    /// Raw response body
    Stream(ByteStream),
    /// Each present field overwrites the response; headers are merged
    Parts {
        body: Option<ByteStream>,
        status: Option<StatusCode>,
        headers: HeaderMap,
    },
}

impl HandlerOutput {
    /// Plain text response with a status.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=utf-8"),
        );
        HandlerOutput::Parts {
            body: Some(string_to_stream(text)),
            status: Some(status),
            headers,
        }
    }

    /// Status only, keeping whatever body earlier middleware set.
    pub fn status(status: StatusCode) -> Self {
        HandlerOutput::Parts {
            body: None,
            status: Some(status),
            headers: HeaderMap::new(),
        }
    }

    /// Write into `res`. `payload_type` is set as content type for bare
    /// streams when no content type is present yet.
    pub fn apply(self, res: &mut ResponseContext, payload_type: Option<&'static str>) {
        match self {
            HandlerOutput::Stream(body) => {
                res.body = Some(body);
                if let Some(content_type) = payload_type {
                    res.headers
                        .entry(header::CONTENT_TYPE)
                        .or_insert(HeaderValue::from_static(content_type));
                }
            }
            HandlerOutput::Parts {
                body,
                status,
                headers,
            } => {
                if let Some(body) = body {
                    res.body = Some(body);
                }
                if let Some(status) = status {
                    res.status = Some(status);
                }
                let mut last: Option<HeaderName> = None;
                for (name, value) in headers {
                    match name {
                        Some(name) => {
                            res.headers.insert(name.clone(), value);
                            last = Some(name);
                        }
                        None => {
                            if let Some(name) = &last {
                                res.headers.append(name.clone(), value);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutput::Stream(_) => f.write_str("Stream"),
            HandlerOutput::Parts {
                body,
                status,
                headers,
            } => f
                .debug_struct("Parts")
                .field("body", &body.is_some())
                .field("status", status)
                .field("headers", headers)
                .finish(),
        }
    }
}

/// The application's request and build entry points.
#[async_trait]
pub trait ServerEntry: Send + Sync {
    /// Handle one classified request. `Ok(None)` leaves the response to later
    /// middleware and the fallback.
    async fn handle_request(
        &self,
        input: DispatchInput,
        ops: &RenderOps,
    ) -> anyhow::Result<Option<HandlerOutput>>;

    /// Produce static build tasks.
    fn handle_build(&self, _ops: BuildOps) -> BoxStream<'static, anyhow::Result<BuildTask>> {
        Box::pin(stream::empty())
    }
}

/// Result of running the handler for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The response was written (possibly with an error status)
    Responded(StatusCode),
    /// The entry returned nothing and the response is still empty
    Unhandled,
}

/// Classifies requests and dispatches them to a [`ServerEntry`].
pub struct RscHandler {
    config: Arc<RscConfig>,
    entry: Arc<dyn ServerEntry>,
    runtime: Arc<dyn RscRuntime>,
    html: Arc<dyn HtmlRenderer>,
    classifier: Classifier,
}

impl RscHandler {
    pub fn new(
        config: Arc<RscConfig>,
        entry: Arc<dyn ServerEntry>,
        runtime: Arc<dyn RscRuntime>,
        html: Arc<dyn HtmlRenderer>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        let classifier = Classifier::new(&config, Arc::clone(&runtime), functions);
        Self {
            config,
            entry,
            runtime,
            html,
            classifier,
        }
    }

    pub fn config(&self) -> &RscConfig {
        &self.config
    }

    pub fn html(&self) -> &Arc<dyn HtmlRenderer> {
        &self.html
    }

    /// Render ops for requests outside HTTP (builds).
    pub fn build_ops(&self) -> BuildOps {
        BuildOps::new(
            RenderOps::new(Arc::clone(&self.runtime), Arc::clone(&self.html))
                .with_nonce(self.config.nonce.clone()),
            self.config.rsc_base.clone(),
        )
    }

    pub fn entry(&self) -> &Arc<dyn ServerEntry> {
        &self.entry
    }

    /// Classify `req`, run the entry and write the outcome into `res`.
    ///
    /// Never fails: classification and handler errors are mapped onto `res`.
    pub async fn dispatch(&self, req: RequestMeta, res: &mut ResponseContext) -> Dispatch {
        let classified = match self.classifier.classify(req).await {
            Ok(classified) => classified,
            Err(err) => {
                let err = anyhow::Error::new(err);
                return Dispatch::Responded(apply_error(res, &err));
            }
        };

        let Classified {
            input,
            temporary_references,
            rsc_path,
            debug_nojs,
        } = classified;

        let payload_type = input
            .expects_payload()
            .then(|| self.runtime.content_type());
        let variant = input.kind();

        let ops = RenderOps::new(Arc::clone(&self.runtime), Arc::clone(&self.html))
            .with_temporary_references(temporary_references)
            .with_rsc_path(rsc_path)
            .with_debug_nojs(debug_nojs)
            .with_nonce(self.config.nonce.clone());

        match self.entry.handle_request(input, &ops).await {
            Ok(Some(output)) => {
                output.apply(res, payload_type);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(variant, "handler failed");
                return Dispatch::Responded(apply_error(res, &err));
            }
        }

        if res.is_empty() {
            Dispatch::Unhandled
        } else {
            Dispatch::Responded(res.status.unwrap_or(StatusCode::OK))
        }
    }

    /// Root shell for the base path, 404 text otherwise.
    pub async fn apply_fallback(&self, pathname: &str, res: &mut ResponseContext) {
        if pathname == self.config.base_path {
            match self.html.render_fallback().await {
                Ok(body) => {
                    res.body = Some(body);
                    res.headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/html;charset=utf-8"),
                    );
                }
                Err(err) => {
                    apply_error(res, &err);
                }
            }
            return;
        }

        res.status = Some(StatusCode::NOT_FOUND);
        res.body = Some(string_to_stream("404 Not Found"));
    }
}

impl fmt::Debug for RscHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RscHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

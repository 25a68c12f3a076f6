#![cfg_attr(docsrs, feature(doc_cfg))]

//! # fob-rsc
//!
//! Request routing and streaming render protocol for server components.
//!
//! An inbound request runs through an ordered [`Pipeline`] of middleware. The
//! built-in `handler` middleware classifies it into a [`DispatchInput`]
//! (component payload, remote function call, script-less form action, or a
//! custom route), hands it to the application's [`ServerEntry`] and maps the
//! result, or any failure, back onto the response.
//!
//! Pages are rendered in two phases from the same data: [`RenderOps::render_data`]
//! serializes render roots into a payload, and [`RenderOps::render_page`] turns
//! that payload into HTML while embedding a second copy of it for hydration.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use fob_rsc::html::MarkupRenderer;
//! use fob_rsc::stream::{collect_string, string_to_stream};
//! use fob_rsc::{
//!     elements, ByteStream, DispatchInput, Element, FunctionRegistry, HandlerOutput,
//!     HtmlOptions, JsonRuntime, PageOptions, PageRenderer, RenderOps, RscConfig, RscHandler,
//!     RscServer, ServerEntry,
//! };
//! use serde_json::json;
//!
//! struct App;
//!
//! #[async_trait]
//! impl ServerEntry for App {
//!     async fn handle_request(
//!         &self,
//!         input: DispatchInput,
//!         ops: &RenderOps,
//!     ) -> anyhow::Result<Option<HandlerOutput>> {
//!         let roots = elements([("root", json!({ "title": "Hello" }))]);
//!         match input {
//!             DispatchInput::Component { .. } => Ok(Some(HandlerOutput::Stream(ops.render_data(roots)))),
//!             DispatchInput::Custom { pathname, .. } if pathname == "/" => ops
//!                 .render_page(roots, Element::Ready(json!("page")), PageOptions::default())
//!                 .await
//!                 .map(Some),
//!             _ => Ok(None),
//!         }
//!     }
//! }
//!
//! struct Markup;
//!
//! #[async_trait]
//! impl MarkupRenderer for Markup {
//!     async fn render_markup(
//!         &self,
//!         _data: ByteStream,
//!         tree: ByteStream,
//!         _options: &HtmlOptions,
//!     ) -> anyhow::Result<ByteStream> {
//!         let tree = collect_string(tree).await?;
//!         Ok(string_to_stream(format!("<html><body>{tree}</body></html>")))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(RscConfig::load()?);
//! let handler = RscHandler::new(
//!     Arc::clone(&config),
//!     Arc::new(App),
//!     Arc::new(JsonRuntime::new()),
//!     Arc::new(PageRenderer::new(Markup, config.tee_buffer_limit)),
//!     Arc::new(FunctionRegistry::new()),
//! );
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! RscServer::new(Arc::new(handler)).serve(listener).await?;
//! # Ok(()) }
//! ```
//!
//! ## Logging
//!
//! The crate emits `tracing` events only. Enable the `logging` feature for
//! [`logging::init_logging`].

pub mod classify;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod html;
pub mod middleware;
pub mod outcome;
pub mod render;
pub mod request;
pub mod runtime;
pub mod server;
pub mod snapshot;
pub mod stream;

#[cfg(feature = "logging")]
#[cfg_attr(docsrs, doc(cfg(feature = "logging")))]
pub mod logging;

pub use classify::{Classified, Classifier, DispatchInput, RscParams};
pub use codec::{decode_func_id, decode_rsc_path, decode_uri, encode_func_id, encode_rsc_path};
pub use config::RscConfig;
pub use context::{get_context, get_data, set_data, ContextData, RequestContext};
pub use error::{ConfigError, Result, RscError};
pub use html::{HtmlOptions, HtmlRenderer, MarkupRenderer, PageRenderer};
pub use middleware::{
    HandlerContext, Middleware, MiddlewareRegistry, Next, Pipeline, PipelineCache,
    ResponseContext,
};
pub use outcome::{HttpError, OutcomeInfo};
pub use render::{
    Dispatch, HandlerOutput, PageOptions, RenderOps, RscHandler, ServerEntry,
};
pub use request::{FormData, FormValue, ReplyBody, RequestBody, RequestMeta};
pub use runtime::{
    elements, server_fn, Element, Elements, FunctionRegistry, JsonRuntime, RscRuntime,
    ServerAction, ServerFunction, TemporaryReferences,
};
pub use server::RscServer;
pub use snapshot::{BuildOps, BuildTask, SnapshotCollector, SnapshotReport};
pub use stream::ByteStream;

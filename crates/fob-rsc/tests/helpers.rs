//! Shared test application for fob-rsc integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use fob_rsc::html::MarkupRenderer;
use fob_rsc::stream::{collect_string, string_to_stream};
use fob_rsc::{
    elements, BuildOps, BuildTask, ByteStream, DispatchInput, Element, Elements,
    FunctionRegistry, HandlerOutput, HtmlOptions, HttpError, JsonRuntime, PageOptions,
    PageRenderer, RenderOps, RscConfig, RscHandler, ServerEntry,
};
use futures::stream::BoxStream;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

/// Writes the page tree and form state; ignores its copy of the payload.
pub struct TestMarkup;

#[async_trait]
impl MarkupRenderer for TestMarkup {
    async fn render_markup(
        &self,
        _data: ByteStream,
        tree: ByteStream,
        options: &HtmlOptions,
    ) -> anyhow::Result<ByteStream> {
        let tree = collect_string(tree).await?;
        let form_state = options
            .form_state
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        Ok(string_to_stream(format!(
            "<!DOCTYPE html><html><body><main>{}</main><pre>{}</pre></body></html>",
            tree.trim(),
            form_state
        )))
    }
}

pub fn roots(rsc_path: &str) -> Elements {
    elements([("root", json!({ "path": rsc_path }))])
}

async fn page(ops: &RenderOps, pathname: &str, form_state: Option<Value>) -> anyhow::Result<HandlerOutput> {
    ops.render_page(
        roots(pathname.trim_start_matches('/')),
        Element::Ready(json!({ "page": pathname })),
        PageOptions {
            form_state,
            rsc_path: None,
        },
    )
    .await
}

/// Application used by the end-to-end tests.
pub struct TestApp;

#[async_trait]
impl ServerEntry for TestApp {
    async fn handle_request(
        &self,
        input: DispatchInput,
        ops: &RenderOps,
    ) -> anyhow::Result<Option<HandlerOutput>> {
        match input {
            DispatchInput::Component { rsc_path, .. } => {
                Ok(Some(HandlerOutput::Stream(ops.render_data(roots(&rsc_path)))))
            }
            DispatchInput::Function { func, args, .. } => {
                let result = func(args).await?;
                let data = ops.render_data(elements([("returnValue", result)]));
                Ok(Some(HandlerOutput::Stream(data)))
            }
            DispatchInput::Action {
                action, pathname, ..
            } => {
                let form_state = action().await?;
                page(ops, &pathname, Some(form_state)).await.map(Some)
            }
            DispatchInput::Custom { pathname, req } => match pathname.as_str() {
                "/" | "/about" => page(ops, &pathname, None).await.map(Some),
                "/api/echo" => {
                    let text = req.body.text().await?;
                    Ok(Some(HandlerOutput::text(StatusCode::OK, text)))
                }
                "/ctx" => {
                    let user = fob_rsc::get_data("user").unwrap_or(Value::Null);
                    Ok(Some(HandlerOutput::text(StatusCode::OK, user.to_string())))
                }
                "/secret" => Err(HttpError::forbidden("members only").into()),
                "/old" => Err(HttpError::redirect("/new").into()),
                "/boom" => Err(anyhow::anyhow!("database unavailable")),
                _ => Ok(None),
            },
        }
    }

    fn handle_build(&self, ops: BuildOps) -> BoxStream<'static, anyhow::Result<BuildTask>> {
        Box::pin(async_stream::stream! {
            for pathname in ["/", "/about"] {
                let rsc_path = pathname.trim_start_matches('/');
                match ops
                    .render_page(
                        roots(rsc_path),
                        Element::Ready(json!({ "page": pathname })),
                        PageOptions::default(),
                    )
                    .await
                {
                    Ok(body) => {
                        yield Ok::<_, anyhow::Error>(BuildTask::file(pathname, body));
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
                yield Ok(BuildTask::file(
                    ops.rsc_path_to_pathname(rsc_path),
                    ops.render_data(roots(rsc_path)),
                ));
            }
            yield Ok(BuildTask::Other { kind: "sitemap".to_string() });
        })
    }
}

/// Application whose entry never produces a response.
pub struct EmptyApp;

#[async_trait]
impl ServerEntry for EmptyApp {
    async fn handle_request(
        &self,
        _input: DispatchInput,
        _ops: &RenderOps,
    ) -> anyhow::Result<Option<HandlerOutput>> {
        Ok(None)
    }
}

pub fn functions() -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    functions
        .register("actions/index.js#save", |args: Vec<Value>| async move {
            Ok::<_, anyhow::Error>(json!({ "saved": args }))
        })
        .unwrap();
    functions
}

pub fn handler_with(config: RscConfig, entry: Arc<dyn ServerEntry>) -> Arc<RscHandler> {
    let limit = config.tee_buffer_limit;
    Arc::new(RscHandler::new(
        Arc::new(config),
        entry,
        Arc::new(JsonRuntime::new()),
        Arc::new(PageRenderer::new(TestMarkup, limit)),
        Arc::new(functions()),
    ))
}

pub fn handler() -> Arc<RscHandler> {
    handler_with(RscConfig::default(), Arc::new(TestApp))
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(router: Router, request: Request<Body>) -> TestResponse {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    TestResponse {
        status,
        headers,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post(uri: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", content_type)
        .body(body.into())
        .unwrap()
}

/// Multipart body with text fields.
pub fn multipart(boundary: &str, fields: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body
}

/// JSON lines of a payload body.
pub fn payload_lines(body: &str) -> Vec<Value> {
    body.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

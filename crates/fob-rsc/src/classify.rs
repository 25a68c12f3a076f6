//! Request classification.
//!
//! Every request maps to exactly one [`DispatchInput`], checked in this order:
//!
//! 1. path under the RSC prefix: a function id becomes [`DispatchInput::Function`],
//!    anything else [`DispatchInput::Component`]
//! 2. `POST` with a multipart body carrying an action reference:
//!    [`DispatchInput::Action`]
//! 3. any other request: [`DispatchInput::Custom`]
//!
//! Classification owns the request body. Variants 1 and 2 consume it here.
//! `Custom` hands it to user code unread; a multipart `POST` that turned out
//! not to be an action has its bytes restored first.

use crate::codec::{decode_func_id, decode_rsc_path, decode_uri};
use crate::config::RscConfig;
use crate::error::{Result, RscError};
use crate::request::{is_multipart, FormData, ReplyBody, RequestMeta};
use crate::runtime::{
    FunctionRegistry, RscRuntime, ServerAction, ServerFunction, TemporaryReferences,
};
use crate::stream::{chunks_to_stream, collect_bytes};
use axum::http::Method;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Parameters of a component request.
#[derive(Debug, Clone, PartialEq)]
pub enum RscParams {
    /// JSON body of a `POST`
    Json(Value),
    /// URL query pairs
    Query(Vec<(String, String)>),
}

/// What an inbound request asks for.
pub enum DispatchInput {
    /// Serialized component tree
    Component {
        rsc_path: String,
        rsc_params: RscParams,
        req: RequestMeta,
    },
    /// Remote function call
    Function {
        id: String,
        func: ServerFunction,
        args: Vec<Value>,
        req: RequestMeta,
    },
    /// Script-less form submission. Running `action` yields the form state.
    Action {
        action: ServerAction,
        pathname: String,
        req: RequestMeta,
    },
    /// Any other route, handled entirely by user code
    Custom { pathname: String, req: RequestMeta },
}

impl DispatchInput {
    /// Variant name, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchInput::Component { .. } => "component",
            DispatchInput::Function { .. } => "function",
            DispatchInput::Action { .. } => "action",
            DispatchInput::Custom { .. } => "custom",
        }
    }

    pub fn req(&self) -> &RequestMeta {
        match self {
            DispatchInput::Component { req, .. }
            | DispatchInput::Function { req, .. }
            | DispatchInput::Action { req, .. }
            | DispatchInput::Custom { req, .. } => req,
        }
    }

    /// True for variants answered with a serialized payload.
    pub fn expects_payload(&self) -> bool {
        matches!(
            self,
            DispatchInput::Component { .. } | DispatchInput::Function { .. }
        )
    }
}

impl fmt::Debug for DispatchInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchInput::Component {
                rsc_path,
                rsc_params,
                ..
            } => f
                .debug_struct("Component")
                .field("rsc_path", rsc_path)
                .field("rsc_params", rsc_params)
                .finish_non_exhaustive(),
            DispatchInput::Function { id, args, .. } => f
                .debug_struct("Function")
                .field("id", id)
                .field("args", args)
                .finish_non_exhaustive(),
            DispatchInput::Action { pathname, .. } => f
                .debug_struct("Action")
                .field("pathname", pathname)
                .finish_non_exhaustive(),
            DispatchInput::Custom { pathname, .. } => f
                .debug_struct("Custom")
                .field("pathname", pathname)
                .finish_non_exhaustive(),
        }
    }
}

/// A classified request plus the per-request state rendering needs.
#[derive(Debug)]
pub struct Classified {
    pub input: DispatchInput,
    /// Set when arguments were decoded; shared with the render step
    pub temporary_references: Option<TemporaryReferences>,
    /// Decoded RSC path, when the request was under the RSC prefix
    pub rsc_path: Option<String>,
    pub debug_nojs: bool,
}

/// Classifies requests against a fixed configuration.
#[derive(Clone)]
pub struct Classifier {
    rsc_prefix: String,
    nojs_param: String,
    runtime: Arc<dyn RscRuntime>,
    functions: Arc<FunctionRegistry>,
}

impl Classifier {
    pub fn new(
        config: &RscConfig,
        runtime: Arc<dyn RscRuntime>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            rsc_prefix: config.rsc_prefix(),
            nojs_param: config.nojs_param.clone(),
            runtime,
            functions,
        }
    }

    /// Classify `req`, consuming its body where the variant requires it.
    ///
    /// # Errors
    ///
    /// - [`RscError::InvalidEncoding`] for a malformed RSC path
    /// - [`RscError::UnknownFunction`] for an unregistered function id
    /// - [`RscError::Decode`] for an unreadable body
    /// - [`RscError::BodyConsumed`] if the body was already taken
    pub async fn classify(&self, req: RequestMeta) -> Result<Classified> {
        let debug_nojs = req.has_query(&self.nojs_param);

        if let Some(encoded) = req.pathname().strip_prefix(self.rsc_prefix.as_str()) {
            let rsc_path = decode_rsc_path(&decode_uri(encoded)?)?;

            if let Some(id) = decode_func_id(&rsc_path) {
                let func = self.functions.resolve(&id)?;
                let temporary_references = TemporaryReferences::new();
                let body = read_reply_body(&req).await?;
                let args = self
                    .runtime
                    .decode_reply(body, &temporary_references)
                    .await?;
                tracing::debug!(function_id = %id, args = args.len(), "classified function call");
                return Ok(Classified {
                    input: DispatchInput::Function {
                        id,
                        func,
                        args,
                        req,
                    },
                    temporary_references: Some(temporary_references),
                    rsc_path: Some(rsc_path),
                    debug_nojs,
                });
            }

            let rsc_params = read_rsc_params(&req).await?;
            tracing::debug!(rsc_path = %rsc_path, "classified component request");
            return Ok(Classified {
                input: DispatchInput::Component {
                    rsc_path: rsc_path.clone(),
                    rsc_params,
                    req,
                },
                temporary_references: None,
                rsc_path: Some(rsc_path),
                debug_nojs,
            });
        }

        let pathname = req.pathname().to_string();

        if req.method == Method::POST && req.is_multipart() {
            let content_type = req.content_type().unwrap_or_default().to_string();
            if let Some(stream) = req.body.take()? {
                let raw = collect_bytes(stream).await?;
                match FormData::from_multipart(chunks_to_stream(vec![raw.clone()]), &content_type).await {
                    Ok(form) => {
                        if let Some(action) =
                            self.runtime.decode_action(&form, &self.functions).await?
                        {
                            tracing::debug!(pathname = %pathname, "classified form action");
                            return Ok(Classified {
                                input: DispatchInput::Action {
                                    action: self.with_form_state(action, form),
                                    pathname,
                                    req,
                                },
                                temporary_references: None,
                                rsc_path: None,
                                debug_nojs,
                            });
                        }
                        tracing::debug!(pathname = %pathname, "multipart POST without an action reference");
                    }
                    Err(err) => {
                        tracing::debug!(pathname = %pathname, error = %err, "unparsable multipart POST");
                    }
                }
                // not an action; user code gets the body as sent
                req.body.restore(raw);
            }
        }

        Ok(Classified {
            input: DispatchInput::Custom { pathname, req },
            temporary_references: None,
            rsc_path: None,
            debug_nojs,
        })
    }

    /// Run the action, then derive form state from its result.
    fn with_form_state(&self, action: ServerAction, form: FormData) -> ServerAction {
        let runtime = Arc::clone(&self.runtime);
        Box::new(move || {
            async move {
                let result = action().await?;
                Ok::<_, anyhow::Error>(runtime.decode_form_state(result, &form).await?)
            }
            .boxed()
        })
    }
}

/// Multipart bodies become form data, anything else raw text.
async fn read_reply_body(req: &RequestMeta) -> Result<ReplyBody> {
    let content_type = req.content_type().map(str::to_string);
    match req.body.take()? {
        Some(stream) => match content_type.filter(|ct| is_multipart(ct)) {
            Some(ct) => Ok(ReplyBody::Form(FormData::from_multipart(stream, &ct).await?)),
            None => {
                let bytes = collect_bytes(stream).await?;
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| RscError::Decode(format!("body is not valid UTF-8: {e}")))?;
                Ok(ReplyBody::Text(text))
            }
        },
        None => Ok(ReplyBody::Text(String::new())),
    }
}

/// JSON body of a `POST`, otherwise the URL query.
async fn read_rsc_params(req: &RequestMeta) -> Result<RscParams> {
    if req.method == Method::POST && req.body.is_present() {
        let text = req.body.text().await?;
        if !text.trim().is_empty() {
            let value = serde_json::from_str(&text)
                .map_err(|e| RscError::Decode(format!("invalid rsc params: {e}")))?;
            return Ok(RscParams::Json(value));
        }
    }
    Ok(RscParams::Query(req.query_pairs()))
}

//! Serialization runtime seam and server function registry.
//!
//! The payload wire format is owned by an [`RscRuntime`] implementation; the
//! dispatcher only calls its encode/decode primitives. [`JsonRuntime`] is a
//! small JSON-lines implementation used by tests and by applications that are
//! happy with a plain text payload.

use crate::codec::encode_func_id;
use crate::error::{Result, RscError};
use crate::request::{FormData, FormValue, ReplyBody};
use crate::stream::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

/// Remote function callable by id.
pub type ServerFunction =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Decoded form action, ready to run once.
pub type ServerAction = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// Maps a failure raised while serializing to the digest sent to the client.
pub type ErrorDigest = Arc<dyn Fn(&anyhow::Error) -> Option<String> + Send + Sync>;

/// Wrap an async closure as a [`ServerFunction`].
pub fn server_fn<F, Fut>(f: F) -> ServerFunction
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// A named render root.
pub enum Element {
    /// Already computed
    Ready(Value),
    /// Resolved while the payload streams; a failure becomes an error digest
    /// for this element only
    Deferred(BoxFuture<'static, anyhow::Result<Value>>),
}

impl Element {
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Element::Deferred(Box::pin(fut))
    }
}

impl From<Value> for Element {
    fn from(value: Value) -> Self {
        Element::Ready(value)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Element::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Flat mapping of named render roots, serialized in insertion order.
pub type Elements = IndexMap<String, Element>;

/// Build [`Elements`] from ready values.
pub fn elements<I, K>(entries: I) -> Elements
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), Element::Ready(v)))
        .collect()
}

/// Request-scoped set of values received from the client.
///
/// Values registered while decoding arguments can be referenced by index from
/// the payload rendered for the same request instead of being sent back.
/// Clones share one set.
#[derive(Clone, Default)]
pub struct TemporaryReferences {
    values: Arc<Mutex<Vec<Value>>>,
}

impl TemporaryReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value and return its index.
    pub fn register(&self, value: Value) -> usize {
        let mut values = self.values.lock();
        values.push(value);
        values.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.lock().get(index).cloned()
    }

    /// Index of a registered value equal to `value`.
    pub fn find(&self, value: &Value) -> Option<usize> {
        self.values.lock().iter().position(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl fmt::Debug for TemporaryReferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryReferences")
            .field("len", &self.len())
            .finish()
    }
}

/// Options for [`RscRuntime::serialize`].
#[derive(Clone, Default)]
pub struct SerializeOptions {
    pub temporary_references: Option<TemporaryReferences>,
    pub on_error: Option<ErrorDigest>,
}

/// Startup-built mapping from function id to callable.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, ServerFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `<module>#<export>`.
    ///
    /// # Errors
    ///
    /// [`RscError::InvalidEncoding`] if the id could not be carried in a URL.
    pub fn register<F, Fut>(&mut self, id: impl Into<String>, f: F) -> Result<&mut Self>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let id = id.into();
        encode_func_id(&id)?;
        self.functions.insert(id, server_fn(f));
        Ok(self)
    }

    /// Look up a function by decoded id.
    pub fn resolve(&self, id: &str) -> Result<ServerFunction> {
        self.functions
            .get(id)
            .cloned()
            .ok_or_else(|| RscError::UnknownFunction(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.functions.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.ids())
            .finish()
    }
}

/// Component serialization runtime.
#[async_trait]
pub trait RscRuntime: Send + Sync {
    /// Content type of a serialized payload.
    fn content_type(&self) -> &'static str {
        "text/x-component"
    }

    /// Serialize render roots into a payload stream.
    fn serialize(&self, elements: Elements, options: SerializeOptions) -> ByteStream;

    /// Decode call arguments sent by the client.
    async fn decode_reply(
        &self,
        body: ReplyBody,
        temporary_references: &TemporaryReferences,
    ) -> Result<Vec<Value>>;

    /// Decode the action referenced by a script-less form submission.
    ///
    /// Returns `None` when the form carries no action reference.
    async fn decode_action(
        &self,
        form: &FormData,
        functions: &FunctionRegistry,
    ) -> Result<Option<ServerAction>>;

    /// Derive the form state replayed into the next render.
    async fn decode_form_state(&self, result: Value, form: &FormData) -> Result<Value>;
}

/// Form field naming the action to run.
pub const ACTION_ID_FIELD: &str = "$ACTION_ID";
/// Form field carrying the JSON array of arguments bound to the action.
pub const ACTION_BOUND_FIELD: &str = "$ACTION_BOUND";
/// Form field carrying the form state key.
pub const ACTION_KEY_FIELD: &str = "$ACTION_KEY";
/// Form field carrying the JSON-encoded argument list of a reply.
pub const REPLY_ARGS_FIELD: &str = "0";

/// JSON-lines payload runtime.
///
/// Each element becomes one line:
///
/// ```text
/// {"id":"main","value":{"title":"Home"}}
/// {"id":"side","ref":0}
/// {"id":"slow","error":{"digest":"..."}}
/// ```
///
/// `ref` lines point into the request's [`TemporaryReferences`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRuntime;

impl JsonRuntime {
    pub fn new() -> Self {
        Self
    }

    fn line(value: Value) -> io::Result<Bytes> {
        let mut buf = serde_json::to_vec(&value).map_err(io::Error::other)?;
        buf.push(b'\n');
        Ok(Bytes::from(buf))
    }

    fn value_line(id: &str, value: Value, refs: Option<&TemporaryReferences>) -> Value {
        match refs.and_then(|refs| refs.find(&value)) {
            Some(index) => json!({ "id": id, "ref": index }),
            None => json!({ "id": id, "value": value }),
        }
    }

    fn error_line(id: &str, digest: Option<String>) -> Value {
        match digest {
            Some(digest) => json!({ "id": id, "error": { "digest": digest } }),
            None => json!({ "id": id, "error": {} }),
        }
    }

    fn form_to_args(form: &FormData) -> Result<Vec<Value>> {
        if let Some(raw) = form.get_text(REPLY_ARGS_FIELD) {
            return Self::parse_args(raw);
        }
        let mut fields = serde_json::Map::new();
        for (name, value) in form.iter() {
            if let FormValue::Text(text) = value {
                fields.insert(name.to_string(), Value::String(text.clone()));
            }
        }
        Ok(vec![Value::Object(fields)])
    }

    fn parse_args(raw: &str) -> Result<Vec<Value>> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(raw).map_err(|e| RscError::Decode(e.to_string()))? {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    /// Text fields of a submitted form, minus the action bookkeeping fields.
    fn form_fields(form: &FormData) -> Value {
        let mut fields = serde_json::Map::new();
        for (name, value) in form.iter() {
            if name.starts_with("$ACTION_") {
                continue;
            }
            if let FormValue::Text(text) = value {
                fields.insert(name.to_string(), Value::String(text.clone()));
            }
        }
        Value::Object(fields)
    }
}

#[async_trait]
impl RscRuntime for JsonRuntime {
    fn serialize(&self, elements: Elements, options: SerializeOptions) -> ByteStream {
        let SerializeOptions {
            temporary_references,
            on_error,
        } = options;

        Box::pin(async_stream::stream! {
            for (id, element) in elements {
                let line = match element {
                    Element::Ready(value) => {
                        Self::value_line(&id, value, temporary_references.as_ref())
                    }
                    Element::Deferred(fut) => match fut.await {
                        Ok(value) => Self::value_line(&id, value, temporary_references.as_ref()),
                        Err(err) => {
                            let digest = on_error.as_ref().and_then(|f| f(&err));
                            Self::error_line(&id, digest)
                        }
                    },
                };
                yield Self::line(line);
            }
        })
    }

    async fn decode_reply(
        &self,
        body: ReplyBody,
        temporary_references: &TemporaryReferences,
    ) -> Result<Vec<Value>> {
        let args = match body {
            // Plain text that is not JSON is passed through as one argument
            ReplyBody::Text(text) => match Self::parse_args(&text) {
                Ok(args) => args,
                Err(_) => vec![Value::String(text)],
            },
            ReplyBody::Form(form) => Self::form_to_args(&form)?,
        };
        for arg in &args {
            if arg.is_object() || arg.is_array() {
                temporary_references.register(arg.clone());
            }
        }
        Ok(args)
    }

    async fn decode_action(
        &self,
        form: &FormData,
        functions: &FunctionRegistry,
    ) -> Result<Option<ServerAction>> {
        let Some(id) = form.get_text(ACTION_ID_FIELD) else {
            return Ok(None);
        };
        let func = functions.resolve(id)?;

        let mut args = match form.get_text(ACTION_BOUND_FIELD) {
            Some(raw) => Self::parse_args(raw)?,
            None => Vec::new(),
        };
        args.push(Self::form_fields(form));

        let action: ServerAction = Box::new(move || func(args));
        Ok(Some(action))
    }

    async fn decode_form_state(&self, result: Value, form: &FormData) -> Result<Value> {
        let key = form
            .get_text(ACTION_KEY_FIELD)
            .map_or(Value::Null, |k| Value::String(k.to_string()));
        Ok(json!([result, key]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collect_string;

    fn lines(text: &str) -> Vec<Value> {
        text.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_serialize_ready_elements_in_order() {
        let runtime = JsonRuntime::new();
        let els = elements([("b", json!(1)), ("a", json!({"x": true}))]);
        let out = collect_string(runtime.serialize(els, SerializeOptions::default()))
            .await
            .unwrap();

        assert_eq!(
            lines(&out),
            vec![
                json!({"id": "b", "value": 1}),
                json!({"id": "a", "value": {"x": true}}),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_element_becomes_digest() {
        let runtime = JsonRuntime::new();
        let mut els = Elements::new();
        els.insert("ok".into(), Element::Ready(json!("fine")));
        els.insert(
            "broken".into(),
            Element::deferred(async { Err::<Value, _>(anyhow::anyhow!("secret internals")) }),
        );
        els.insert("after".into(), Element::deferred(async { Ok::<_, anyhow::Error>(json!(2)) }));

        let options = SerializeOptions {
            temporary_references: None,
            on_error: Some(Arc::new(|_| Some("d1".to_string()))),
        };
        let out = collect_string(runtime.serialize(els, options)).await.unwrap();

        assert!(!out.contains("secret internals"));
        let parsed = lines(&out);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1], json!({"id": "broken", "error": {"digest": "d1"}}));
        assert_eq!(parsed[2], json!({"id": "after", "value": 2}));
    }

    #[tokio::test]
    async fn test_temporary_references_round_trip() {
        let runtime = JsonRuntime::new();
        let refs = TemporaryReferences::new();
        let args = runtime
            .decode_reply(
                ReplyBody::Text(r#"[{"todo": 1}, "plain"]"#.to_string()),
                &refs,
            )
            .await
            .unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(refs.len(), 1);

        let options = SerializeOptions {
            temporary_references: Some(refs.clone()),
            on_error: None,
        };
        let els = elements([("echo", json!({"todo": 1}))]);
        let out = collect_string(runtime.serialize(els, options)).await.unwrap();
        assert_eq!(lines(&out), vec![json!({"id": "echo", "ref": 0})]);
    }

    #[tokio::test]
    async fn test_decode_reply_forms() {
        let runtime = JsonRuntime::new();
        let refs = TemporaryReferences::new();

        assert!(runtime
            .decode_reply(ReplyBody::Text(String::new()), &refs)
            .await
            .unwrap()
            .is_empty());

        let scalar = runtime
            .decode_reply(ReplyBody::Text("42".into()), &refs)
            .await
            .unwrap();
        assert_eq!(scalar, vec![json!(42)]);

        let mut form = FormData::new();
        form.append_text("0", r#"["a", "b"]"#);
        let args = runtime
            .decode_reply(ReplyBody::Form(form), &refs)
            .await
            .unwrap();
        assert_eq!(args, vec![json!("a"), json!("b")]);

        let mut form = FormData::new();
        form.append_text("name", "x");
        let args = runtime
            .decode_reply(ReplyBody::Form(form), &refs)
            .await
            .unwrap();
        assert_eq!(args, vec![json!({"name": "x"})]);

        let args = runtime
            .decode_reply(ReplyBody::Text("hello there".into()), &refs)
            .await
            .unwrap();
        assert_eq!(args, vec![json!("hello there")]);

        let mut form = FormData::new();
        form.append_text("0", "{not json");
        let err = runtime
            .decode_reply(ReplyBody::Form(form), &refs)
            .await
            .unwrap_err();
        assert!(matches!(err, RscError::Decode(_)));
    }

    #[tokio::test]
    async fn test_registry_resolve() {
        let mut registry = FunctionRegistry::new();
        registry
            .register("actions/index.js#save", |args: Vec<Value>| async move {
                Ok::<_, anyhow::Error>(json!(args.len()))
            })
            .unwrap();

        let rejected = registry
            .register("no-hash", |_| async { Ok::<_, anyhow::Error>(Value::Null) })
            .is_err();
        assert!(rejected);
        assert_eq!(registry.ids(), vec!["actions/index.js#save"]);

        let f = registry.resolve("actions/index.js#save").unwrap();
        assert_eq!(f(vec![json!(1), json!(2)]).await.unwrap(), json!(2));

        let err = registry.resolve("missing#fn").err().unwrap();
        assert!(matches!(err, RscError::UnknownFunction(_)));
    }

    #[tokio::test]
    async fn test_decode_action_and_form_state() {
        let runtime = JsonRuntime::new();
        let mut registry = FunctionRegistry::new();
        registry
            .register("form.js#submit", |args: Vec<Value>| async move {
                Ok::<_, anyhow::Error>(json!({ "received": args }))
            })
            .unwrap();

        let mut form = FormData::new();
        form.append_text(ACTION_ID_FIELD, "form.js#submit");
        form.append_text(ACTION_BOUND_FIELD, "[7]");
        form.append_text(ACTION_KEY_FIELD, "k1");
        form.append_text("title", "hello");

        let action = runtime
            .decode_action(&form, &registry)
            .await
            .unwrap()
            .unwrap();
        let result = action().await.unwrap();
        assert_eq!(result, json!({"received": [7, {"title": "hello"}]}));

        let state = runtime.decode_form_state(result, &form).await.unwrap();
        assert_eq!(state[1], json!("k1"));

        let empty = FormData::new();
        assert!(runtime.decode_action(&empty, &registry).await.unwrap().is_none());
    }
}

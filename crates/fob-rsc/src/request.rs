//! Inbound request view shared by middleware, the classifier and user code.

use crate::error::{Result, RscError};
use crate::stream::{chunks_to_stream, collect_bytes, ByteStream};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use url::Url;

enum BodyState {
    Present(ByteStream),
    Empty,
    Consumed,
}

/// Single-consumption request body.
///
/// Clones share the same underlying stream; whichever clone calls
/// [`take`](Self::take) first owns it and every later call fails with
/// [`RscError::BodyConsumed`].
#[derive(Clone)]
pub struct RequestBody {
    state: Arc<Mutex<BodyState>>,
}

impl RequestBody {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            state: Arc::new(Mutex::new(BodyState::Present(stream))),
        }
    }

    pub fn empty() -> Self {
        Self {
            state: Arc::new(Mutex::new(BodyState::Empty)),
        }
    }

    /// Take ownership of the body stream.
    ///
    /// Returns `Ok(None)` for a request that had no body.
    ///
    /// # Errors
    ///
    /// [`RscError::BodyConsumed`] on every call after the first.
    pub fn take(&self) -> Result<Option<ByteStream>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, BodyState::Consumed) {
            BodyState::Present(stream) => Ok(Some(stream)),
            BodyState::Empty => Ok(None),
            BodyState::Consumed => Err(RscError::BodyConsumed),
        }
    }

    /// Put already-read bytes back so the next [`take`](Self::take) yields
    /// them. Every clone sees the restored body.
    pub fn restore(&self, bytes: Bytes) {
        let stream = chunks_to_stream(vec![bytes]);
        *self.state.lock() = BodyState::Present(stream);
    }

    /// True if a stream is still waiting to be taken.
    pub fn is_present(&self) -> bool {
        matches!(*self.state.lock(), BodyState::Present(_))
    }

    pub fn is_consumed(&self) -> bool {
        matches!(*self.state.lock(), BodyState::Consumed)
    }

    /// Take the body and read it to the end.
    pub async fn bytes(&self) -> Result<Bytes> {
        match self.take()? {
            Some(stream) => Ok(collect_bytes(stream).await?),
            None => Ok(Bytes::new()),
        }
    }

    /// Take the body and read it as UTF-8 text.
    pub async fn text(&self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RscError::Decode(format!("body is not valid UTF-8: {e}")))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock() {
            BodyState::Present(_) => "present",
            BodyState::Empty => "empty",
            BodyState::Consumed => "consumed",
        };
        f.debug_tuple("RequestBody").field(&state).finish()
    }
}

/// Immutable view of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub body: RequestBody,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
}

impl RequestMeta {
    pub fn new(method: Method, url: Url, headers: HeaderMap, body: RequestBody) -> Self {
        Self {
            body,
            url,
            method,
            headers,
        }
    }

    /// Bodyless request, mostly for tests and build-time rendering.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url, HeaderMap::new(), RequestBody::empty())
    }

    /// Add a header, replacing any previous value.
    ///
    /// Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn pathname(&self) -> &str {
        self.url.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type().is_some_and(is_multipart)
    }

    pub fn has_query(&self, key: &str) -> bool {
        self.url.query_pairs().any(|(k, _)| k == key)
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

/// True for `multipart/form-data` content types.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        file_name: String,
        content_type: Option<String>,
        data: Bytes,
    },
}

impl FormValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormValue::Text(text) => Some(text),
            FormValue::File { .. } => None,
        }
    }
}

/// Parsed `multipart/form-data` body, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    entries: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: FormValue) {
        self.entries.push((name.into(), value));
    }

    pub fn append_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.append(name, FormValue::Text(value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FormValue::as_text)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormValue> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a multipart body.
    ///
    /// # Errors
    ///
    /// [`RscError::Decode`] when the boundary is missing, the body is
    /// malformed, or a text field is not UTF-8.
    pub async fn from_multipart(body: ByteStream, content_type: &str) -> Result<Self> {
        let boundary = multer::parse_boundary(content_type)?;
        let mut multipart = multer::Multipart::new(body, boundary);
        let mut form = FormData::new();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(|m| m.to_string());
            let data = field.bytes().await?;

            let value = match file_name {
                Some(file_name) => FormValue::File {
                    file_name,
                    content_type,
                    data,
                },
                None => FormValue::Text(String::from_utf8(data.to_vec()).map_err(|e| {
                    RscError::Decode(format!("form field '{name}' is not valid UTF-8: {e}"))
                })?),
            };
            form.append(name, value);
        }

        Ok(form)
    }
}

/// Body handed to the reply decoder: form data for multipart requests,
/// raw text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Text(String),
    Form(FormData),
}

//! Request-scoped context.
//!
//! Each request runs inside [`scope`], which installs a task-local
//! [`RequestContext`]. Code running in that task, including user handlers and
//! server functions, reads it back with [`get_context`] without the value
//! being threaded through every call. Concurrent requests never see each
//! other's context.

use crate::error::{Result, RscError};
use crate::request::RequestMeta;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CONTEXT: RequestContext;
}

/// String-keyed data shared by middleware and user code for one request.
#[derive(Clone, Default)]
pub struct ContextData {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl ContextData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().remove(key)
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.lock().clone()
    }
}

impl fmt::Debug for ContextData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.lock().iter()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub req: RequestMeta,
    pub data: ContextData,
}

impl RequestContext {
    pub fn new(req: RequestMeta, data: ContextData) -> Self {
        Self { req, data }
    }
}

/// Run `fut` with `ctx` installed as the current request context.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CONTEXT.scope(ctx, fut).await
}

/// The current request context, if called inside [`scope`].
pub fn get_context() -> Option<RequestContext> {
    CONTEXT.try_with(Clone::clone).ok()
}

/// Store a value in the current request's data map.
///
/// # Errors
///
/// [`RscError::ContextUnavailable`] outside a request scope.
pub fn set_data(key: impl Into<String>, value: Value) -> Result<()> {
    CONTEXT
        .try_with(|ctx| {
            ctx.data.insert(key, value);
        })
        .map_err(|_| RscError::ContextUnavailable)
}

/// Read a value from the current request's data map.
pub fn get_data(key: &str) -> Option<Value> {
    CONTEXT.try_with(|ctx| ctx.data.get(key)).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use url::Url;

    fn ctx(path: &str) -> RequestContext {
        let url = Url::parse(&format!("http://localhost{path}")).unwrap();
        RequestContext::new(RequestMeta::get(url), ContextData::new())
    }

    #[tokio::test]
    async fn test_context_visible_inside_scope_only() {
        assert!(get_context().is_none());
        assert!(set_data("k", json!(1)).is_err());

        let seen = scope(ctx("/inside"), async {
            set_data("user", json!("ada")).unwrap();
            let current = get_context().unwrap();
            (current.req.pathname().to_string(), get_data("user"))
        })
        .await;

        assert_eq!(seen, ("/inside".to_string(), Some(json!("ada"))));
        assert!(get_data("user").is_none());
    }

    #[tokio::test]
    async fn test_data_shared_with_outer_handle() {
        let context = ctx("/");
        let data = context.data.clone();
        scope(context, async {
            set_data("count", json!(2)).unwrap();
        })
        .await;
        assert_eq!(data.get("count"), Some(json!(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_are_isolated() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(scope(ctx(&format!("/r{i}")), async move {
                    set_data("id", json!(i)).unwrap();
                    tokio::task::yield_now().await;
                    let current = get_context().unwrap();
                    (current.req.pathname().to_string(), get_data("id"))
                }))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let (path, id) = handle.await.unwrap();
            assert_eq!(path, format!("/r{i}"));
            assert_eq!(id, Some(json!(i)));
        }
    }
}

//! HTML rendering.
//!
//! [`HtmlRenderer`] turns a serialized payload and page tree into an HTML
//! stream. [`PageRenderer`] is the standard implementation: it duplicates the
//! payload, hands one copy to a [`MarkupRenderer`] and embeds the other into
//! the markup as inline scripts, so the client can hydrate without fetching
//! the payload again.

use crate::stream::{string_to_stream, tee, ByteStream};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::io;
use std::task::Poll;

/// Global the injected scripts push payload chunks onto.
pub const FLIGHT_DATA_GLOBAL: &str = "__FLIGHT_DATA";

/// Shell served for the root path when no handler produced a response.
pub const DEFAULT_FALLBACK_SHELL: &str =
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body></body></html>";

/// Options passed through to the HTML renderer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HtmlOptions {
    /// Result of a script-less form submission, replayed on hydration
    pub form_state: Option<Value>,
    /// RSC path the client should hydrate from
    pub rsc_path: Option<String>,
    /// Skip hydration payload injection entirely
    pub debug_nojs: bool,
    /// CSP nonce for injected scripts
    pub nonce: Option<String>,
}

/// Page template renderer.
#[async_trait]
pub trait HtmlRenderer: Send + Sync {
    /// Combine a payload stream and a page tree stream into HTML.
    async fn render(
        &self,
        data: ByteStream,
        tree: ByteStream,
        options: HtmlOptions,
    ) -> anyhow::Result<ByteStream>;

    /// Bare page shell for the root path.
    async fn render_fallback(&self) -> anyhow::Result<ByteStream>;
}

/// Renders markup from one copy of the payload.
///
/// `data` may be read as far as needed before returning; the embedded copy
/// is collected while `render_markup` runs.
#[async_trait]
pub trait MarkupRenderer: Send + Sync {
    async fn render_markup(
        &self,
        data: ByteStream,
        tree: ByteStream,
        options: &HtmlOptions,
    ) -> anyhow::Result<ByteStream>;
}

/// [`HtmlRenderer`] that embeds the payload for hydration.
pub struct PageRenderer<M> {
    markup: M,
    tee_limit: usize,
    fallback_shell: String,
}

impl<M: MarkupRenderer> PageRenderer<M> {
    pub fn new(markup: M, tee_limit: usize) -> Self {
        Self {
            markup,
            tee_limit,
            fallback_shell: DEFAULT_FALLBACK_SHELL.to_string(),
        }
    }

    pub fn with_fallback_shell(mut self, shell: impl Into<String>) -> Self {
        self.fallback_shell = shell.into();
        self
    }
}

#[async_trait]
impl<M: MarkupRenderer> HtmlRenderer for PageRenderer<M> {
    async fn render(
        &self,
        data: ByteStream,
        tree: ByteStream,
        options: HtmlOptions,
    ) -> anyhow::Result<ByteStream> {
        if options.debug_nojs {
            return self.markup.render_markup(data, tree, &options).await;
        }

        let (for_markup, mut for_client) = tee(data, self.tee_limit);

        // Keep reading the embedded copy while the markup renders, or a
        // renderer that reads past the tee limit would wait on it forever.
        let mut early = Vec::new();
        let html = {
            let mut markup = self
                .markup
                .render_markup(for_markup.boxed(), tree, &options);
            let mut client_done = false;
            future::poll_fn(|cx| {
                if let Poll::Ready(html) = markup.as_mut().poll(cx) {
                    return Poll::Ready(html);
                }
                while !client_done {
                    match for_client.poll_next_unpin(cx) {
                        Poll::Ready(Some(chunk)) => early.push(chunk),
                        Poll::Ready(None) => client_done = true,
                        Poll::Pending => break,
                    }
                }
                Poll::Pending
            })
            .await?
        };

        let payload = stream::iter(early).chain(for_client);
        Ok(inject_payload(html, Box::pin(payload), options.nonce))
    }

    async fn render_fallback(&self) -> anyhow::Result<ByteStream> {
        Ok(string_to_stream(self.fallback_shell.clone()))
    }
}

enum Part {
    Html(io::Result<Bytes>),
    Payload(io::Result<Bytes>),
}

/// Interleave payload chunks into an HTML stream as inline scripts.
///
/// Scripts are only emitted where the HTML written so far ends a tag, never
/// before the first chunk, and always ahead of the closing `</body>`. The
/// closing tag is found even when it is split across chunks; everything from
/// it on is held back until the payload ends. Both inputs are read
/// concurrently.
pub fn inject_payload(html: ByteStream, payload: ByteStream, nonce: Option<String>) -> ByteStream {
    let merged = stream::select(html.map(Part::Html), payload.map(Part::Payload));

    Box::pin(async_stream::stream! {
        let mut merged = merged;
        // html not yet written: at most a partial `</body>`
        let mut carry: Vec<u8> = Vec::new();
        let mut tail: Option<Vec<u8>> = None;
        let mut scripts: Vec<u8> = Vec::new();
        let mut at_tag_end = false;

        while let Some(part) = merged.next().await {
            match part {
                Part::Html(Ok(chunk)) => {
                    if let Some(tail) = tail.as_mut() {
                        tail.extend_from_slice(&chunk);
                        continue;
                    }
                    carry.extend_from_slice(&chunk);
                    let ready = match find_body_end(&carry) {
                        Some(at) => {
                            tail = Some(carry.split_off(at));
                            std::mem::take(&mut carry)
                        }
                        None => {
                            let keep = partial_body_end(&carry);
                            let held = carry.split_off(carry.len() - keep);
                            std::mem::replace(&mut carry, held)
                        }
                    };
                    if let Some(&last) = ready.last() {
                        at_tag_end = last == b'>';
                        yield Ok(Bytes::from(ready));
                    }
                    if tail.is_some() {
                        at_tag_end = true;
                    }
                    if at_tag_end && !scripts.is_empty() {
                        yield Ok(Bytes::from(std::mem::take(&mut scripts)));
                    }
                }
                Part::Payload(Ok(chunk)) => {
                    scripts.extend_from_slice(payload_script(&chunk, nonce.as_deref()).as_bytes());
                    if at_tag_end {
                        yield Ok(Bytes::from(std::mem::take(&mut scripts)));
                    }
                }
                Part::Html(Err(err)) | Part::Payload(Err(err)) => {
                    yield Err(err);
                    return;
                }
            }
        }

        if !carry.is_empty() {
            yield Ok(Bytes::from(carry));
        }
        if !scripts.is_empty() {
            yield Ok(Bytes::from(scripts));
        }
        if let Some(tail) = tail {
            yield Ok(Bytes::from(tail));
        }
    })
}

const BODY_END: &[u8] = b"</body>";

fn find_body_end(html: &[u8]) -> Option<usize> {
    html.windows(BODY_END.len()).position(|w| w == BODY_END)
}

/// Length of the longest suffix of `html` that could start a `</body>`.
fn partial_body_end(html: &[u8]) -> usize {
    (1..BODY_END.len())
        .rev()
        .find(|&len| html.ends_with(&BODY_END[..len]))
        .unwrap_or(0)
}

/// Inline script pushing one payload chunk.
///
/// Text chunks are pushed as JSON strings with `<` escaped so the payload can
/// never close the script element. Chunks that are not valid UTF-8 are pushed
/// as `{"b64": "..."}`.
pub fn payload_script(chunk: &[u8], nonce: Option<&str>) -> String {
    let data = match std::str::from_utf8(chunk) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => serde_json::json!({ "b64": STANDARD.encode(chunk) }),
    };
    let json = data.to_string().replace('<', "\\u003c");
    let nonce_attr = match nonce {
        Some(nonce) => format!(" nonce=\"{}\"", nonce.replace('"', "&quot;")),
        None => String::new(),
    };
    format!("<script{nonce_attr}>(self.{FLIGHT_DATA_GLOBAL}||=[]).push({json})</script>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{chunks_to_stream, collect_string};

    struct EchoMarkup;

    #[async_trait]
    impl MarkupRenderer for EchoMarkup {
        async fn render_markup(
            &self,
            data: ByteStream,
            tree: ByteStream,
            _options: &HtmlOptions,
        ) -> anyhow::Result<ByteStream> {
            let data = collect_string(data).await?;
            let tree = collect_string(tree).await?;
            Ok(string_to_stream(format!(
                "<html><body><main>{tree}|{}</main></body></html>",
                data.trim()
            )))
        }
    }

    fn html_chunks(parts: &[&'static str]) -> ByteStream {
        chunks_to_stream(parts.iter().map(|p| Bytes::from_static(p.as_bytes())).collect::<Vec<_>>())
    }

    #[test]
    fn test_payload_script_escapes() {
        let script = payload_script(b"</script><b>", None);
        assert!(!script.contains("</script><b>"));
        assert!(script.contains("\\u003c/script>"));
        assert!(script.starts_with("<script>(self.__FLIGHT_DATA||=[]).push("));

        let script = payload_script(&[0xff, 0x00], Some("abc"));
        assert!(script.starts_with("<script nonce=\"abc\">"));
        assert!(script.contains("\"b64\":\"/wA=\""));
    }

    #[tokio::test]
    async fn test_scripts_land_before_body_end() {
        let html = html_chunks(&["<html><head></head><body>", "<p>hi</p>", "</body></html>"]);
        let payload = string_to_stream("line1\n");
        let out = collect_string(inject_payload(html, payload, None)).await.unwrap();

        let script_at = out.find("<script>").unwrap();
        let body_end = out.find("</body>").unwrap();
        assert!(out.starts_with("<html><head></head><body>"));
        assert!(script_at < body_end);
        assert!(out.ends_with("</body></html>"));
        assert!(out.contains(r#"push("line1\n")"#));
    }

    #[tokio::test]
    async fn test_body_end_split_across_chunks() {
        let html = html_chunks(&["<html><body><p>x</p>", "</bo", "dy></html>"]);
        let payload = chunks_to_stream(vec![Bytes::from_static(b"P1"), Bytes::from_static(b"P2")]);
        let out = collect_string(inject_payload(html, payload, None)).await.unwrap();

        let expected = format!(
            "<html><body><p>x</p>{}{}</body></html>",
            payload_script(b"P1", None),
            payload_script(b"P2", None)
        );
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_scripts_wait_for_tag_end() {
        let html = html_chunks(&["<body><p class=\"", "big\">hi</p></body>"]);
        let out = collect_string(inject_payload(html, string_to_stream("P"), None))
            .await
            .unwrap();
        assert_eq!(
            out,
            format!("<body><p class=\"big\">hi</p>{}</body>", payload_script(b"P", None))
        );
    }

    #[test]
    fn test_partial_body_end() {
        assert_eq!(partial_body_end(b"<p>x</p></bo"), 4);
        assert_eq!(partial_body_end(b"<p>x</p><"), 1);
        assert_eq!(partial_body_end(b"<p>x</p>"), 0);
        assert_eq!(partial_body_end(b"</body"), 6);
    }

    #[tokio::test]
    async fn test_page_renderer_payload_larger_than_tee_limit() {
        let renderer = PageRenderer::new(EchoMarkup, 16);
        let parts: Vec<Bytes> = (0..10u8)
            .map(|i| Bytes::from(vec![b'a' + i; 8]))
            .collect();
        let data = chunks_to_stream(parts.clone());

        let rendered = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let out = renderer
                .render(data, string_to_stream("tree"), HtmlOptions::default())
                .await
                .unwrap();
            collect_string(out).await.unwrap()
        })
        .await
        .expect("page render stalled");

        assert_eq!(rendered.matches("__FLIGHT_DATA").count(), parts.len());
        let mut last = 0;
        for part in &parts {
            let script = payload_script(part, None);
            let at = rendered.find(&script).unwrap();
            assert!(at >= last, "payload chunks out of order");
            last = at;
        }
        assert!(last < rendered.find("</body>").unwrap());
    }

    #[tokio::test]
    async fn test_payload_without_body_tag_is_appended() {
        let html = html_chunks(&["<div>fragment</div>"]);
        let payload = string_to_stream("x");
        let out = collect_string(inject_payload(html, payload, None)).await.unwrap();
        assert!(out.starts_with("<div>fragment</div>"));
        assert!(out.ends_with(r#"push("x")</script>"#));
    }

    #[tokio::test]
    async fn test_page_renderer_embeds_same_payload() {
        let renderer = PageRenderer::new(EchoMarkup, 64);
        let data = string_to_stream("{\"id\":\"main\"}\n");
        let tree = string_to_stream("tree");
        let out = renderer
            .render(data, tree, HtmlOptions::default())
            .await
            .unwrap();
        let out = collect_string(out).await.unwrap();

        assert!(out.contains("<main>tree|{\"id\":\"main\"}</main>"));
        assert!(out.contains(r#"push("{\"id\":\"main\"}\n")"#));
    }

    #[tokio::test]
    async fn test_page_renderer_debug_nojs_skips_injection() {
        let renderer = PageRenderer::new(EchoMarkup, 1024);
        let options = HtmlOptions {
            debug_nojs: true,
            ..HtmlOptions::default()
        };
        let out = renderer
            .render(string_to_stream("d"), string_to_stream("t"), options)
            .await
            .unwrap();
        let out = collect_string(out).await.unwrap();
        assert_eq!(out, "<html><body><main>t|d</main></body></html>");
    }

    #[tokio::test]
    async fn test_fallback_shell() {
        let renderer = PageRenderer::new(EchoMarkup, 1024).with_fallback_shell("<p>shell</p>");
        let out = collect_string(renderer.render_fallback().await.unwrap())
            .await
            .unwrap();
        assert_eq!(out, "<p>shell</p>");
    }
}

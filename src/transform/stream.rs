//! Streaming rewrite of server-sent events.
//!
//! Wraps the upstream byte stream and rewrites each complete `data:` line
//! whose payload parses as a JSON object, unwrapping the internal nesting as
//! chunks arrive. Line boundaries and trailing carriage returns are
//! preserved exactly; comment lines, `[DONE]` markers, and anything else
//! that is not a JSON payload pass through verbatim. Partial lines are
//! buffered until their newline arrives, so a payload split across read
//! boundaries is reassembled before rewriting.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;

use super::response::unwrap_payload;

pin_project! {
    /// Byte stream that rewrites SSE `data:` lines in flight.
    pub struct SseRewriteStream<S> {
        #[pin]
        inner: S,
        buffer: BytesMut,
        inner_done: bool,
    }
}

impl<S> SseRewriteStream<S> {
    /// Wrap an upstream byte stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            inner_done: false,
        }
    }
}

/// Rewrite the content of one line (no trailing newline or CR).
///
/// Returns `None` when the line is not a rewritable JSON data line.
fn rewrite_content(content: &[u8]) -> Option<Vec<u8>> {
    let rest = content.strip_prefix(b"data:")?;
    let payload = rest.strip_prefix(b" ").unwrap_or(rest);
    let parsed: Value = serde_json::from_slice(payload).ok()?;
    if !parsed.is_object() {
        return None;
    }
    let mut out = b"data: ".to_vec();
    serde_json::to_writer(&mut out, &unwrap_payload(parsed)).ok()?;
    Some(out)
}

/// Rewrite one line, preserving a trailing carriage return.
fn rewrite_line(line: &[u8]) -> Vec<u8> {
    let (content, cr) = match line.last() {
        Some(b'\r') => (&line[..line.len() - 1], true),
        _ => (line, false),
    };
    match rewrite_content(content) {
        Some(mut rewritten) => {
            if cr {
                rewritten.push(b'\r');
            }
            rewritten
        }
        None => line.to_vec(),
    }
}

impl<S, E> Stream for SseRewriteStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if this.buffer.iter().any(|&b| b == b'\n') {
                let mut out = Vec::new();
                while let Some(pos) = this.buffer.iter().position(|&b| b == b'\n') {
                    let line = this.buffer.split_to(pos + 1);
                    out.extend_from_slice(&rewrite_line(&line[..line.len() - 1]));
                    out.push(b'\n');
                }
                return Poll::Ready(Some(Ok(Bytes::from(out))));
            }

            if *this.inner_done {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                // Final line without a newline: rewrite what we have.
                let line = this.buffer.split();
                return Poll::Ready(Some(Ok(Bytes::from(rewrite_line(&line)))));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => *this.inner_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

//! Streaming rewriter for `.sh` response bodies: every URL matching the
//! pattern table (`urlproxy::patterns`) is prefixed with the proxy's own
//! origin so a downloaded script re-fetches its dependencies through this
//! proxy instead of reaching out directly.
//!
//! Bridges hyper body framing into `AsyncRead` via a `poll_frame` adapter,
//! the same way an outbound compression encoder would, but run in reverse:
//! this decompresses (optionally) and rewrites an inbound body instead of
//! compressing an outbound one.

use crate::body::HubBody;
use crate::urlproxy::patterns;
use bytes::Bytes;
use futures_util::Stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

/// Window of already-emitted bytes kept unprocessed at the tail of each
/// chunk, wide enough that a URL split across a chunk boundary is always
/// reassembled before the regex pass runs over it.
const TAIL_WINDOW: usize = 1024;
const READ_CHUNK: usize = 8192;

struct BodyStream(HubBody);

impl Stream for BodyStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        use hyper::body::Body;
        loop {
            match Pin::new(&mut self.0).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))))
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum State {
    Uninit {
        reader: BufReader<StreamReader<BodyStream, Bytes>>,
        is_gzip: bool,
    },
    Active {
        reader: Pin<Box<dyn AsyncRead + Send>>,
        carry: Vec<u8>,
    },
    Done,
}

/// Rewrite the URLs inside a `.sh` response body. `proxy_host` is the origin
/// (e.g. `https://proxy.example.com`) every matched URL is prefixed with.
///
/// If the body is declared gzip-compressed but its magic bytes don't check
/// out, decompression is skipped and the raw bytes are rewritten as-is —
/// the non-fatal fallback the contract calls for. A read error mid-stream
/// truncates the output and is logged; it cannot un-send bytes already
/// flushed to the client, so this is the practical limit of "non-fatal"
/// once streaming has started.
pub fn rewrite_stream(body: HubBody, is_gzip: bool, proxy_host: String) -> HubBody {
    let reader = BufReader::new(StreamReader::new(BodyStream(body)));
    let state = State::Uninit { reader, is_gzip };

    let stream = futures_util::stream::unfold((state, proxy_host), move |(state, proxy_host)| async move {
        step(state, proxy_host).await
    });

    BodyExt::boxed(StreamBody::new(stream))
}

async fn step(
    state: State,
    proxy_host: String,
) -> Option<(Result<Frame<Bytes>, hyper::Error>, (State, String))> {
    let mut state = match state {
        State::Done => return None,
        State::Uninit { mut reader, is_gzip } => {
            let reader: Pin<Box<dyn AsyncRead + Send>> = if !is_gzip {
                Box::pin(reader)
            } else {
                match reader.fill_buf().await {
                    Ok(buf) if buf.len() >= 2 && buf[0] == 0x1f && buf[1] == 0x8b => {
                        Box::pin(async_compression::tokio::bufread::GzipDecoder::new(reader))
                    }
                    _ => {
                        tracing::warn!(
                            "script rewrite: declared gzip but magic bytes missing, falling back to raw body"
                        );
                        Box::pin(reader)
                    }
                }
            };
            State::Active {
                reader,
                carry: Vec::new(),
            }
        }
        active => active,
    };

    let State::Active { reader, carry } = &mut state else {
        unreachable!()
    };

    let mut buf = vec![0u8; READ_CHUNK];
    match reader.read(&mut buf).await {
        Ok(0) => {
            if carry.is_empty() {
                return None;
            }
            let text = String::from_utf8_lossy(carry).into_owned();
            let rewritten = apply_rewrite(&text, &proxy_host);
            let frame = Ok(Frame::data(Bytes::from(rewritten)));
            Some((frame, (State::Done, proxy_host)))
        }
        Ok(n) => {
            buf.truncate(n);
            carry.extend_from_slice(&buf);

            let split = floor_char_boundary(carry, carry.len().saturating_sub(TAIL_WINDOW));
            let head: Vec<u8> = carry.drain(..split).collect();
            let text = String::from_utf8_lossy(&head).into_owned();
            let rewritten = apply_rewrite(&text, &proxy_host);
            let frame = Ok(Frame::data(Bytes::from(rewritten)));
            Some((frame, (state, proxy_host)))
        }
        Err(e) => {
            tracing::warn!(error = %e, "script rewrite stream read failed, truncating body");
            None
        }
    }
}

fn floor_char_boundary(buf: &[u8], mut idx: usize) -> usize {
    if idx >= buf.len() {
        return buf.len();
    }
    while idx > 0 && (buf[idx] & 0xC0) == 0x80 {
        idx -= 1;
    }
    idx
}

/// Prefix every matched URL in `text` with `proxy_host + "/"`, skipping any
/// match already immediately preceded by that exact prefix — idempotence.
fn apply_rewrite(text: &str, proxy_host: &str) -> String {
    let spans = patterns::find_all(text);
    if spans.is_empty() {
        return text.to_string();
    }

    let prefix = format!("{proxy_host}/");
    let mut out = String::with_capacity(text.len() + spans.len() * prefix.len());
    let mut last = 0usize;
    for (range, _name) in spans {
        out.push_str(&text[last..range.start]);
        if !text[..range.start].ends_with(&prefix) {
            out.push_str(&prefix);
        }
        out.push_str(&text[range.start..range.end]);
        last = range.end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_rewrite_prefixes_single_url() {
        let text = "curl -sL https://raw.githubusercontent.com/u/r/main/install.sh | sh";
        let out = apply_rewrite(text, "https://proxy.example.com");
        assert_eq!(
            out,
            "curl -sL https://proxy.example.com/https://raw.githubusercontent.com/u/r/main/install.sh | sh"
        );
    }

    #[test]
    fn test_apply_rewrite_is_idempotent() {
        let text = "fetch https://github.com/u/r/releases/download/v1/x.tar.gz";
        let once = apply_rewrite(text, "https://proxy.example.com");
        let twice = apply_rewrite(&once, "https://proxy.example.com");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_rewrite_no_match_passes_through() {
        let text = "echo hello world";
        assert_eq!(apply_rewrite(text, "https://proxy.example.com"), text);
    }

    #[test]
    fn test_apply_rewrite_multiple_urls() {
        let text = "https://github.com/a/b/raw/x and https://huggingface.co/c/d/resolve/y";
        let out = apply_rewrite(text, "https://p");
        assert_eq!(
            out,
            "https://p/https://github.com/a/b/raw/x and https://p/https://huggingface.co/c/d/resolve/y"
        );
    }

    #[test]
    fn test_floor_char_boundary_walks_back_over_continuation_bytes() {
        let s = "a\u{00e9}b"; // 'é' is 2 bytes in UTF-8
        let bytes = s.as_bytes();
        // splitting right after the first byte of 'é' should walk back to 1
        assert_eq!(floor_char_boundary(bytes, 2), 1);
    }
}

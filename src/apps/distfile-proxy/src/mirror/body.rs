//! Response bodies produced by the mirror links.

use crate::blob::{BlobError, BlobStream};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error};

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;
pub type MirrorBody = UnsyncBoxBody<Bytes, BodyError>;

pub fn empty() -> MirrorBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> MirrorBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Streams blob chunks straight into the response without buffering.
pub fn stream<S>(chunks: S) -> MirrorBody
where
    S: Stream<Item = Result<Bytes, BlobError>> + Send + 'static,
{
    StreamBody::new(
        chunks
            .map_ok(Frame::data)
            .map_err(|e| -> BodyError { Box::new(e) }),
    )
    .boxed_unsync()
}

/// Plain-text response for errors and refusals. The message gets a trailing
/// newline, like most HTTP servers' canned error pages.
pub fn text_response(status: StatusCode, message: &str) -> Response<MirrorBody> {
    let mut response = Response::new(full(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// Counts the bytes of a blob as they are handed to the client and reports
/// a mismatch with the recorded size once the blob ends. By then the status
/// line has been sent, so the mismatch can only be logged.
pub struct SizeCheckedStream {
    inner: BlobStream,
    uri: String,
    expected: u64,
    written: u64,
    finished: bool,
}

impl SizeCheckedStream {
    pub fn new(inner: BlobStream, uri: impl Into<String>, expected: u64) -> Self {
        Self {
            inner,
            uri: uri.into(),
            expected,
            written: 0,
            finished: false,
        }
    }
}

impl Stream for SizeCheckedStream {
    type Item = Result<Bytes, BlobError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.written += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                error!(
                    "Reading {} from blob storage failed after {} bytes: {}",
                    this.uri, this.written, e
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                if this.written != this.expected {
                    error!(
                        "Returned {} bytes for {}, whereas {} were expected",
                        this.written, this.uri, this.expected
                    );
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SizeCheckedStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Client went away after {} of {} bytes of {}",
                self.written, self.expected, self.uri
            );
        }
    }
}

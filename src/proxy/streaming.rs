//! Streaming support for SSE and chunked responses

use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::Response,
};
use futures::{ready, Stream, StreamExt};
use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, info};

use super::build_response;
use super::request::Endpoint;

/// Relay an upstream byte stream to the client chunk by chunk.
///
/// A failed upstream read ends the client body with an error, so hyper aborts
/// the connection instead of closing the stream like a finished response.
pub fn relay_stream<S, E>(
    upstream: S,
    status: StatusCode,
    headers: &[(String, String)],
    endpoint: Endpoint,
) -> Response
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display,
{
    let relay = RelayStream {
        inner: upstream,
        path: endpoint.path(),
        chunks: 0,
        finished: false,
    };

    info!("Proxied (stream) POST {} ({})", endpoint.path(), status);
    build_response(status, headers, Body::from_stream(relay))
}

/// Dropping this drops `inner`, which cancels the backend read.
struct RelayStream<S> {
    inner: S,
    path: &'static str,
    chunks: u64,
    finished: bool,
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match ready!(this.inner.poll_next_unpin(cx)) {
            Some(Ok(bytes)) => {
                this.chunks += 1;
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => {
                this.finished = true;
                error!(
                    path = this.path,
                    chunks = this.chunks,
                    "Backend stream failed: {}", e
                );
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Stream error: {}", e),
                ))))
            }
            None => {
                this.finished = true;
                debug!(path = this.path, chunks = this.chunks, "Backend stream completed");
                Poll::Ready(None)
            }
        }
    }
}

impl<S> Drop for RelayStream<S> {
    fn drop(&mut self) {
        if !self.finished {
            info!(
                path = self.path,
                chunks = self.chunks,
                "Client disconnected, cancelling backend stream"
            );
        }
    }
}

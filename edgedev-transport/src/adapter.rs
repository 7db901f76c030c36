//! Protocol adapter
//!
//! Converts between the host server's socket-level requests (axum/hyper) and
//! the fetch-style [`FetchRequest`]/[`FetchResponse`] the sandbox speaks.
//! Response bodies are piped through a [`TrackedBody`] so the caller can
//! observe how the pipe ended.

use axum::body::Body as AxumBody;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use edgedev_common::{Body, BodyStream, FetchRequest, FetchResponse};
use edgedev_sandbox::Sandbox;
use futures::{Stream, StreamExt};
use hyper::ext::ReasonPhrase;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request has neither a usable Origin nor a Host header")]
    MissingHost,

    #[error("cannot build a request url from '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("sandbox answered with invalid status code {0}")]
    InvalidStatus(u16),
}

impl AdapterError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdapterError::MissingHost | AdapterError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            AdapterError::InvalidStatus(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// How a response body pipe ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeOutcome {
    /// Every chunk was written and the stream ended
    Completed,
    /// The source stream yielded an error; the connection is aborted
    Failed(String),
    /// The client went away before the stream ended
    Aborted,
}

/// Resolves once the response body pipe has ended
#[derive(Debug)]
pub struct PipeCompletion {
    rx: oneshot::Receiver<PipeOutcome>,
}

impl PipeCompletion {
    fn ready(outcome: PipeOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// A pipe whose body was dropped unpolled counts as aborted
    pub async fn wait(self) -> PipeOutcome {
        self.rx.await.unwrap_or(PipeOutcome::Aborted)
    }
}

/// Body stream that reports its end through a [`PipeCompletion`]
pub struct TrackedBody {
    inner: BodyStream,
    done: Option<oneshot::Sender<PipeOutcome>>,
}

impl TrackedBody {
    pub fn new(inner: BodyStream) -> (Self, PipeCompletion) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                done: Some(tx),
            },
            PipeCompletion { rx },
        )
    }

    fn finish(&mut self, outcome: PipeOutcome) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

impl Stream for TrackedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(None) => self.finish(PipeOutcome::Completed),
            Poll::Ready(Some(Err(err))) => self.finish(PipeOutcome::Failed(err.to_string())),
            _ => {}
        }
        polled
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.finish(PipeOutcome::Aborted);
    }
}

/// Origin of an inbound request: the `Origin` header unless it is absent or
/// the literal `null`, else `http://<Host>`
fn request_origin(request: &Request) -> Result<String, AdapterError> {
    let headers = request.headers();
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|origin| !origin.is_empty() && *origin != "null");
    if let Some(origin) = origin {
        return Ok(origin.trim_end_matches('/').to_string());
    }
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
        .filter(|host| !host.is_empty())
        .ok_or(AdapterError::MissingHost)?;
    Ok(format!("http://{}", host))
}

/// Translate an inbound host request into a fetch request
pub fn to_request(request: Request) -> Result<FetchRequest, AdapterError> {
    let origin = request_origin(&request)?;
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let raw = format!("{}{}", origin, path);
    let url = Url::parse(&raw).map_err(|source| AdapterError::InvalidUrl { url: raw, source })?;

    let (parts, body) = request.into_parts();
    let mut fetch = FetchRequest::new(parts.method.as_str(), url);
    for (name, value) in parts.headers.iter() {
        match value.to_str() {
            Ok(value) => fetch.headers_mut().append(name.as_str(), value),
            Err(_) => debug!(header = %name, "Skipping non-string header value"),
        }
    }

    if FetchRequest::method_allows_body(parts.method.as_str()) {
        let stream = body
            .into_data_stream()
            .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));
        fetch = fetch.with_streaming_body(Body::from_stream(stream));
    }
    Ok(fetch)
}

/// Translate a fetch response into a host response. Status and headers are
/// fixed before the first body byte is written.
pub fn to_response(response: FetchResponse) -> Result<(Response, PipeCompletion), AdapterError> {
    let (status, status_text, headers, body) = response.into_parts();
    let code = StatusCode::from_u16(status).map_err(|_| AdapterError::InvalidStatus(status))?;

    let (body, completion) = match body {
        Some(body) => {
            let (tracked, completion) = TrackedBody::new(body.into_stream());
            (AxumBody::from_stream(tracked), completion)
        }
        None => (AxumBody::empty(), PipeCompletion::ready(PipeOutcome::Completed)),
    };

    let mut out = Response::new(body);
    *out.status_mut() = code;
    for (name, value) in headers.iter() {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => warn!(header = name, "Dropping invalid response header"),
        }
    }
    if !status_text.is_empty() && code.canonical_reason() != Some(status_text.as_str()) {
        match ReasonPhrase::try_from(status_text) {
            Ok(reason) => {
                out.extensions_mut().insert(reason);
            }
            Err(_) => warn!(status, "Dropping invalid status text"),
        }
    }
    Ok((out, completion))
}

/// Translate `request`, name `entry` in `entry_header`, dispatch it to the
/// sandbox and translate the answer back.
pub async fn bridge(
    sandbox: &dyn Sandbox,
    request: Request,
    entry_header: &str,
    entry: Option<&str>,
) -> Result<(Response, PipeCompletion), AdapterError> {
    let mut fetch = to_request(request)?;
    if let Some(entry) = entry {
        fetch.headers_mut().set(entry_header, entry);
    }
    let response = sandbox.dispatch_fetch(fetch).await;
    to_response(response)
}

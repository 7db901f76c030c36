//! Sandbox running out of process
//!
//! Forwards each fetch request over HTTP to an external worker runtime. The
//! runtime evaluates modules with its own runner and calls back into the dev
//! server's fetch-module and resolve endpoints.

use async_trait::async_trait;
use edgedev_common::{Body, FetchRequest, FetchResponse};
use edgedev_sandbox::Sandbox;
use futures::StreamExt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

/// Hop-by-hop headers that are never forwarded
const HOP_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid sandbox url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid request method '{0}'")]
    InvalidMethod(String),

    #[error("failed to read request body: {0}")]
    Body(#[from] io::Error),

    #[error("sandbox request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug)]
pub struct RemoteSandbox {
    base: Url,
    client: reqwest::Client,
}

impl RemoteSandbox {
    pub fn new(base: &str) -> Result<Self, RemoteError> {
        let base = Url::parse(base).map_err(|source| RemoteError::InvalidUrl {
            url: base.to_string(),
            source,
        })?;
        // Redirects are part of the worker's answer, not something to follow.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Target url: the request's path and query on the sandbox origin
    fn target(&self, request: &FetchRequest) -> Url {
        let mut target = self.base.clone();
        target.set_path(request.url().path());
        target.set_query(request.url().query());
        target
    }

    async fn forward(&self, mut request: FetchRequest) -> Result<FetchResponse, RemoteError> {
        let method = reqwest::Method::from_bytes(request.method().as_bytes())
            .map_err(|_| RemoteError::InvalidMethod(request.method().to_string()))?;
        let target = self.target(&request);

        let mut builder = self.client.request(method, target.clone());
        for (name, value) in request.headers().iter() {
            if !HOP_HEADERS.contains(&name) {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = request.take_body() {
            builder = builder.body(body.bytes().await?);
        }

        debug!(url = %target, "Forwarding request to sandbox");
        let response = builder.send().await?;

        let status = response.status();
        let mut out = FetchResponse::new(status.as_u16());
        for (name, value) in response.headers() {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                out = out.with_header(name.as_str(), value);
            }
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        Ok(out.with_body(Body::from_stream(stream)))
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    async fn dispatch_fetch(&self, request: FetchRequest) -> FetchResponse {
        let url = request.url().to_string();
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(url = %url, error = %err, "Remote sandbox unavailable");
                FetchResponse::text(502, err.to_string())
            }
        }
    }

    fn name(&self) -> &str {
        "remote"
    }
}

//! Outbound HTTP dispatch pipeline contract.
//!
//! A [`Dispatcher`] drives one request through a [`DispatchHandler`]'s
//! streaming callbacks. The callback order is a correctness contract: any
//! HTTP client built against the pipeline assumes headers, then data, then
//! completion (or a single error). The proxied path replays responses
//! through [`SequencedHandler`], a small state machine that refuses
//! out-of-order transitions.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The mesh RPC failed; carries the remote failure's message.
    #[error("{0}")]
    Remote(String),

    #[error("invalid request target: {0}")]
    Target(#[from] url::ParseError),

    #[error("network dispatch failed: {0}")]
    Network(String),
}

/// One outbound HTTP call.
#[derive(Clone)]
pub struct DispatchRequest {
    /// Scheme and authority, e.g. `http://svc.plt.local:3042`.
    pub origin: String,
    pub method: String,
    /// Path plus query, resolved against `origin`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Per-request dispatcher override, honored on the network path only.
    /// Never forwarded over the mesh.
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl DispatchRequest {
    pub fn new(
        origin: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
            dispatcher: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Full request URL: `path` resolved against `origin`.
    pub fn target_url(&self) -> Result<Url, DispatchError> {
        let base = Url::parse(&self.origin)?;
        Ok(base.join(&self.path)?)
    }
}

impl std::fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("origin", &self.origin)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(Bytes::len))
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}

/// Streaming callbacks for one response.
///
/// Contract: `on_headers`, then exactly one `on_data` per body chunk, then
/// `on_complete`, or `on_error` at any point before completion, terminally.
pub trait DispatchHandler: Send + 'static {
    fn on_headers(&mut self, status: u16, headers: &[(String, String)], status_message: &str);
    fn on_data(&mut self, chunk: Bytes);
    fn on_complete(&mut self, trailers: &[(String, String)]);
    fn on_error(&mut self, error: DispatchError);
}

/// A dispatch pipeline stage. The interceptor and the network dispatcher both
/// implement this, so stages compose.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest, handler: Box<dyn DispatchHandler>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayState {
    AwaitingHeaders,
    StreamingBody,
    Done,
    Failed,
}

/// Enforces the callback-order contract around a [`DispatchHandler`].
///
/// An out-of-order transition is a bug in the driving dispatcher; the wrapped
/// handler is protected from it and the violation is logged instead of
/// propagated.
pub struct SequencedHandler {
    state: ReplayState,
    inner: Box<dyn DispatchHandler>,
}

impl SequencedHandler {
    pub fn new(inner: Box<dyn DispatchHandler>) -> Self {
        Self {
            state: ReplayState::AwaitingHeaders,
            inner,
        }
    }

    pub fn headers(&mut self, status: u16, headers: &[(String, String)], status_message: &str) {
        if self.state != ReplayState::AwaitingHeaders {
            tracing::error!(state = ?self.state, "headers callback out of order, dropped");
            return;
        }
        self.state = ReplayState::StreamingBody;
        self.inner.on_headers(status, headers, status_message);
    }

    pub fn data(&mut self, chunk: Bytes) {
        if self.state != ReplayState::StreamingBody {
            tracing::error!(state = ?self.state, "data callback out of order, dropped");
            return;
        }
        self.inner.on_data(chunk);
    }

    pub fn complete(&mut self, trailers: &[(String, String)]) {
        if self.state != ReplayState::StreamingBody {
            tracing::error!(state = ?self.state, "completion callback out of order, dropped");
            return;
        }
        self.state = ReplayState::Done;
        self.inner.on_complete(trailers);
    }

    pub fn error(&mut self, error: DispatchError) {
        if matches!(self.state, ReplayState::Done | ReplayState::Failed) {
            tracing::error!(state = ?self.state, "error callback after terminal state, dropped");
            return;
        }
        self.state = ReplayState::Failed;
        self.inner.on_error(error);
    }
}

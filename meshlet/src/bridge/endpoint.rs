//! Control endpoint: request/response/notification API over the duplex
//! channel.
//!
//! One endpoint exists per worker process. Outbound requests correlate to
//! responses through a pending table; inbound requests dispatch to registered
//! command handlers; notifications fan out to local listeners. Channel loss
//! fails every outstanding request and then runs the loss policy, which by
//! default terminates the process with [`CHANNEL_LOST_EXIT_CODE`].
//!
//! [`CHANNEL_LOST_EXIT_CODE`]: crate::bridge::channel::CHANNEL_LOST_EXIT_CODE

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::channel::{
    CHANNEL_LOST_EXIT_CODE, ChannelError, ChannelEvent, ChannelLost, DuplexChannel,
};
use crate::bridge::envelope::{Envelope, EnvelopeId, EnvelopeKind, WireError};

/// Handler for one inbound command. Failures are wrapped into the response
/// envelope's `error` and surfaced to the remote caller; they never crash the
/// endpoint.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, data: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, data: Value) -> anyhow::Result<Value> {
        (self.0)(data).await
    }
}

type NotificationListener = Arc<dyn Fn(Value) + Send + Sync>;
type LossHook = Box<dyn Fn(&ChannelLost) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The channel closed (voluntarily or through loss) while the request was
    /// outstanding.
    #[error("control channel closed while request was outstanding")]
    ChannelClosed,

    /// The peer answered with a populated `error` field.
    #[error("{0}")]
    Remote(#[from] WireError),
}

pub struct EndpointOptions {
    /// When set, an inbound command with no registered handler is a silent
    /// no-op instead of an error response. The worker side runs with this on:
    /// not every parent command needs a worker-side handler.
    pub tolerate_missing_handlers: bool,

    /// Runs after channel loss, once every outstanding request has been
    /// failed. The default policy exits the process with the reserved
    /// disconnect code: there is nowhere left to report to.
    pub on_channel_lost: LossHook,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            tolerate_missing_handlers: false,
            on_channel_lost: Box::new(|_| std::process::exit(CHANNEL_LOST_EXIT_CODE)),
        }
    }
}

struct EndpointInner {
    channel: DuplexChannel,
    next_id: AtomicU64,
    pending: DashMap<EnvelopeId, oneshot::Sender<Result<Value, RequestError>>>,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    listeners: RwLock<HashMap<String, Vec<NotificationListener>>>,
    tolerate_missing_handlers: bool,
    on_channel_lost: LossHook,
}

#[derive(Clone)]
pub struct ControlEndpoint {
    inner: Arc<EndpointInner>,
}

impl ControlEndpoint {
    /// Connects to the parent's control socket and starts the dispatch loop.
    pub fn connect(socket_path: impl AsRef<Path>, options: EndpointOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = DuplexChannel::connect(socket_path, events_tx);
        Self::attach(channel, events_rx, options)
    }

    /// Binds an endpoint to an already-constructed channel. The receiver must
    /// be the listener end the channel was built with.
    pub fn attach(
        channel: DuplexChannel,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        options: EndpointOptions,
    ) -> Self {
        let inner = Arc::new(EndpointInner {
            channel,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            tolerate_missing_handlers: options.tolerate_missing_handlers,
            on_channel_lost: options.on_channel_lost,
        });

        tokio::spawn(dispatch_loop(Arc::clone(&inner), events));

        Self { inner }
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Resolves with the response's data, the remote error's message, or a
    /// channel-closed failure. The control layer enforces no timeout: callers
    /// needing bounded latency layer their own.
    pub async fn send(&self, command: &str, data: Value) -> Result<Value, RequestError> {
        let id = EnvelopeId::from(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);

        let envelope = Envelope::request(id.clone(), command, data);
        if self.inner.channel.transmit(envelope).is_err() {
            self.inner.pending.remove(&id);
            return Err(RequestError::ChannelClosed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::ChannelClosed),
        }
    }

    /// Sends a request without registering a completion. The peer's response
    /// falls into the unmatched-id path and is dropped silently. This is the
    /// fire-and-forget shape the log path uses.
    pub fn send_detached(&self, command: &str, data: Value) -> Result<(), ChannelError> {
        let id = EnvelopeId::from(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .channel
            .transmit(Envelope::request(id, command, data))
    }

    /// Fire-and-forget notification. No id, no response.
    pub fn notify(&self, command: &str, data: Value) -> Result<(), ChannelError> {
        self.inner
            .channel
            .transmit(Envelope::notification(command, data))
    }

    /// Registers the handler for a command, replacing any previous one.
    pub fn handle<H: CommandHandler>(&self, command: impl Into<String>, handler: H) {
        self.handle_arc(command, Arc::new(handler));
    }

    /// Closure form of [`ControlEndpoint::handle`].
    pub fn handle_fn<F, Fut>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handle_arc(command, Arc::new(FnHandler(handler)));
    }

    fn handle_arc(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let mut handlers = match self.inner.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(command.into(), handler);
    }

    /// Subscribes to inbound notifications for a command. Listener failures
    /// never round-trip to the sender; there is no response to carry them.
    pub fn on_notification(
        &self,
        command: impl Into<String>,
        listener: impl Fn(Value) + Send + Sync + 'static,
    ) {
        let mut listeners = match self.inner.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners
            .entry(command.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Sends the final `close` notification carrying the termination signal,
    /// then runs the transport's close handshake and releases it.
    pub async fn close(&self, signal: &str) {
        let _ = self.notify("close", Value::String(signal.to_string()));
        self.inner.channel.close().await;
    }
}

async fn dispatch_loop(
    inner: Arc<EndpointInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Frame(envelope) => process_frame(&inner, envelope),
            ChannelEvent::Lost(lost) => {
                fail_outstanding(&inner);
                (inner.on_channel_lost)(&lost);
                return;
            }
        }
    }

    // Channel closed voluntarily: anything still outstanding fails with the
    // channel-closed condition, exactly once.
    fail_outstanding(&inner);
}

/// Envelopes are dispatched strictly in arrival order. Request handlers are
/// spawned so a handler that itself calls `send` cannot wedge this loop;
/// responses and notifications are processed inline.
fn process_frame(inner: &Arc<EndpointInner>, envelope: Envelope) {
    match envelope.kind {
        EnvelopeKind::Response => {
            let Some(id) = envelope.id else {
                tracing::trace!("dropping response without id");
                return;
            };
            match inner.pending.remove(&id) {
                Some((_, tx)) => {
                    let result = match envelope.error {
                        Some(error) => Err(RequestError::Remote(error)),
                        None => Ok(envelope.data),
                    };
                    let _ = tx.send(result);
                }
                // Stray response (or the ack for a detached request):
                // dropped silently.
                None => tracing::trace!(id = %id, "dropping response with no pending request"),
            }
        }

        EnvelopeKind::Request => {
            let handler = {
                let handlers = match inner.handlers.read() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                handlers.get(&envelope.command).cloned()
            };

            let Some(id) = envelope.id else {
                tracing::warn!(command = %envelope.command, "dropping request without id");
                return;
            };

            match handler {
                Some(handler) => {
                    let inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        let result = handler
                            .handle(envelope.data)
                            .await
                            .map_err(|e| WireError::new(e.to_string()));
                        let response = Envelope::response(id, envelope.command, result);
                        let _ = inner.channel.transmit(response);
                    });
                }
                None if inner.tolerate_missing_handlers => {
                    tracing::trace!(command = %envelope.command, "no handler, tolerated");
                }
                None => {
                    let error = WireError::new(format!(
                        "no handler registered for command '{}'",
                        envelope.command
                    ));
                    let response = Envelope::response(id, envelope.command, Err(error));
                    let _ = inner.channel.transmit(response);
                }
            }
        }

        EnvelopeKind::Notification => {
            let listeners = {
                let map = match inner.listeners.read() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                map.get(&envelope.command).cloned().unwrap_or_default()
            };
            for listener in listeners {
                listener(envelope.data.clone());
            }
        }
    }
}

fn fail_outstanding(inner: &EndpointInner) {
    let ids: Vec<EnvelopeId> = inner.pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = inner.pending.remove(&id) {
            let _ = tx.send(Err(RequestError::ChannelClosed));
        }
    }
}

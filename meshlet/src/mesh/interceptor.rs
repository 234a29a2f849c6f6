//! Rewrites internal-mesh HTTP calls into control-channel RPCs.
//!
//! Classification is per-request and stateless: a hostname ending in the
//! reserved suffix never touches a real socket. The RPC result is replayed
//! through the client's streaming callback sequence byte for byte (headers,
//! one data delivery, completion) so arbitrary HTTP clients keep working.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bytes::Bytes;

use crate::bridge::endpoint::ControlEndpoint;
use crate::mesh::dispatch::{
    DispatchError, DispatchHandler, DispatchRequest, Dispatcher, SequencedHandler,
};

use async_trait::async_trait;
use std::sync::Arc;

/// Hostnames ending in this suffix resolve over the control channel.
pub const INTERNAL_HOST_SUFFIX: &str = ".plt.local";

/// Response payload bytes as they travel in JSON: either a UTF-8 string or
/// the byte-array-object form `{"type":"Buffer","data":[..]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPayload {
    Text(String),
    Bytes(ByteBuffer),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteBuffer {
    #[serde(rename = "type")]
    pub tag: String,
    pub data: Vec<u8>,
}

impl RawPayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_string()),
            Err(_) => Self::Bytes(ByteBuffer {
                tag: "Buffer".to_string(),
                data: bytes.to_vec(),
            }),
        }
    }

    /// Reconstitutes the wire form into bytes.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Bytes(buffer) => Bytes::from(buffer.data),
        }
    }
}

/// `fetch` command payload: the request, minus hop-by-hop headers and any
/// dispatcher override.
#[derive(Debug, Serialize, Deserialize)]
struct FetchPayload {
    origin: String,
    method: String,
    path: String,
    headers: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<RawPayload>,
}

/// `fetch` command result from the parent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResponse {
    status_code: u16,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
    #[serde(default)]
    raw_payload: Option<RawPayload>,
}

pub struct MeshInterceptor {
    endpoint: ControlEndpoint,
    inner: Arc<dyn Dispatcher>,
    suffix: String,
}

impl MeshInterceptor {
    pub fn new(endpoint: ControlEndpoint, inner: Arc<dyn Dispatcher>) -> Self {
        Self::with_suffix(endpoint, inner, INTERNAL_HOST_SUFFIX)
    }

    pub fn with_suffix(
        endpoint: ControlEndpoint,
        inner: Arc<dyn Dispatcher>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            inner,
            suffix: suffix.into(),
        }
    }
}

#[async_trait]
impl Dispatcher for MeshInterceptor {
    async fn dispatch(&self, mut request: DispatchRequest, mut handler: Box<dyn DispatchHandler>) {
        let url = match request.target_url() {
            Ok(url) => url,
            Err(e) => {
                handler.on_error(e);
                return;
            }
        };

        let internal = url
            .host_str()
            .is_some_and(|host| host.ends_with(self.suffix.as_str()));

        // Other destinations are dispatched normally.
        if !internal {
            match request.dispatcher.take() {
                Some(dispatcher) => dispatcher.dispatch(request, handler).await,
                None => self.inner.dispatch(request, handler).await,
            }
            return;
        }

        let mut handler = SequencedHandler::new(handler);

        let host = url.host_str().unwrap_or_default();
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut headers = serde_json::Map::new();
        for (key, value) in &request.headers {
            let lowered = key.to_ascii_lowercase();
            if lowered == "connection" || lowered == "transfer-encoding" || lowered == "host" {
                continue;
            }
            headers.insert(key.clone(), Value::String(value.clone()));
        }
        headers.insert("host".to_string(), Value::String(authority));

        let payload = FetchPayload {
            origin: url.origin().ascii_serialization(),
            method: request.method.clone(),
            path: request.path.clone(),
            headers,
            body: request.body.as_deref().map(RawPayload::from_bytes),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                handler.error(DispatchError::Remote(format!(
                    "failed to encode fetch payload: {}",
                    e
                )));
                return;
            }
        };

        match self.endpoint.send("fetch", payload).await {
            Ok(value) => match serde_json::from_value::<FetchResponse>(value) {
                Ok(response) => replay(response, &mut handler),
                Err(e) => handler.error(DispatchError::Remote(format!(
                    "malformed fetch response: {}",
                    e
                ))),
            },
            Err(e) => handler.error(DispatchError::Remote(e.to_string())),
        }
    }
}

/// Replays an RPC result through the streaming callback contract: headers
/// (multi-valued headers repeat the key), a single data delivery of the full
/// payload, completion with no trailers.
fn replay(response: FetchResponse, handler: &mut SequencedHandler) {
    let headers = flatten_headers(&response.headers);
    let status_message = response.status_message.unwrap_or_default();
    handler.headers(response.status_code, &headers, &status_message);

    let payload = response
        .raw_payload
        .map(RawPayload::into_bytes)
        .unwrap_or_default();
    handler.data(payload);
    handler.complete(&[]);
}

fn flatten_headers(headers: &serde_json::Map<String, Value>) -> Vec<(String, String)> {
    let mut flat = Vec::new();
    for (key, value) in headers {
        match value {
            Value::Array(items) => {
                for item in items {
                    flat.push((key.clone(), header_value(item)));
                }
            }
            other => flat.push((key.clone(), header_value(other))),
        }
    }
    flat
}

fn header_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use crate::bridge::channel::DuplexChannel;
    use crate::bridge::codec::FrameCodec;
    use crate::bridge::endpoint::EndpointOptions;
    use crate::bridge::envelope::{Envelope, EnvelopeKind};
    use crate::mesh::dispatch::recording::{Recorded, RecordingHandler};

    type PeerRead = FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, FrameCodec<Envelope>>;
    type PeerWrite =
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, FrameCodec<Envelope>>;

    fn endpoint_with_peer() -> (ControlEndpoint, PeerRead, PeerWrite) {
        let (worker_side, parent_side) = tokio::io::duplex(64 * 1024);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = DuplexChannel::establish(async move { Ok(worker_side) }, events_tx);
        let endpoint = ControlEndpoint::attach(
            channel,
            events_rx,
            EndpointOptions {
                tolerate_missing_handlers: true,
                on_channel_lost: Box::new(|_| {}),
            },
        );

        let (read_half, write_half) = tokio::io::split(parent_side);
        (
            endpoint,
            FramedRead::new(read_half, FrameCodec::new()),
            FramedWrite::new(write_half, FrameCodec::new()),
        )
    }

    struct CountingDispatcher {
        calls: Arc<std::sync::Mutex<Vec<String>>>,
        label: &'static str,
    }

    #[async_trait]
    impl Dispatcher for CountingDispatcher {
        async fn dispatch(&self, request: DispatchRequest, mut handler: Box<dyn DispatchHandler>) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}{}", self.label, request.origin, request.path));
            handler.on_headers(204, &[], "No Content");
            handler.on_data(Bytes::new());
            handler.on_complete(&[]);
        }
    }

    fn counting(label: &'static str) -> (Arc<CountingDispatcher>, Arc<std::sync::Mutex<Vec<String>>>) {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Arc::new(CountingDispatcher {
                calls: Arc::clone(&calls),
                label,
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn internal_host_is_proxied_and_replayed_in_order() {
        let (endpoint, mut peer_rx, mut peer_tx) = endpoint_with_peer();
        let (network, network_calls) = counting("net");
        let interceptor = MeshInterceptor::new(endpoint, network);

        let request = DispatchRequest::new("http://svc.plt.local:3042", "GET", "/hello")
            .header("accept", "application/json")
            .header("Connection", "keep-alive")
            .header("transfer-encoding", "chunked");
        let (recorder, events) = RecordingHandler::new();

        let peer = tokio::spawn(async move {
            let env = peer_rx.next().await.unwrap().unwrap();
            assert_eq!(env.kind, EnvelopeKind::Request);
            assert_eq!(env.command, "fetch");

            let payload = &env.data;
            assert_eq!(payload["method"], "GET");
            assert_eq!(payload["path"], "/hello");
            assert_eq!(payload["headers"]["host"], "svc.plt.local:3042");
            assert_eq!(payload["headers"]["accept"], "application/json");
            assert!(payload["headers"].get("Connection").is_none());
            assert!(payload["headers"].get("transfer-encoding").is_none());
            assert!(payload.get("dispatcher").is_none());

            peer_tx
                .send(Envelope::response(
                    env.id.unwrap(),
                    "fetch",
                    Ok(json!({
                        "statusCode": 200,
                        "statusMessage": "OK",
                        "headers": {"content-type": "application/json"},
                        "rawPayload": {
                            "type": "Buffer",
                            "data": b"{\"ok\":true}".to_vec(),
                        },
                    })),
                ))
                .await
                .unwrap();
        });

        interceptor.dispatch(request, recorder).await;
        peer.await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            Recorded::Headers {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                message: "OK".to_string(),
            }
        );
        assert_eq!(events[1], Recorded::Data(b"{\"ok\":true}".to_vec()));
        assert_eq!(events[2], Recorded::Complete(vec![]));

        assert!(network_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_host_passes_through_without_an_rpc() {
        let (endpoint, mut peer_rx, mut peer_tx) = endpoint_with_peer();
        let (network, network_calls) = counting("net");
        let interceptor = MeshInterceptor::new(endpoint.clone(), network);

        let (recorder, _events) = RecordingHandler::new();
        interceptor
            .dispatch(
                DispatchRequest::new("http://example.com", "GET", "/hello"),
                recorder,
            )
            .await;

        assert_eq!(
            &*network_calls.lock().unwrap(),
            &["net:http://example.com/hello".to_string()]
        );

        // The first envelope the parent ever sees is this probe, proving the
        // passthrough produced no control-channel traffic.
        let probe = tokio::spawn(async move { endpoint.send("ping", json!(null)).await });
        let env = peer_rx.next().await.unwrap().unwrap();
        assert_eq!(env.command, "ping");
        peer_tx
            .send(Envelope::response(env.id.unwrap(), "ping", Ok(json!(null))))
            .await
            .unwrap();
        probe.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn per_request_dispatcher_override_wins_on_passthrough() {
        let (endpoint, _peer_rx, _peer_tx) = endpoint_with_peer();
        let (network, network_calls) = counting("net");
        let (custom, custom_calls) = counting("custom");
        let interceptor = MeshInterceptor::new(endpoint, network);

        let mut request = DispatchRequest::new("http://example.com", "GET", "/");
        request.dispatcher = Some(custom);
        let (recorder, _events) = RecordingHandler::new();
        interceptor.dispatch(request, recorder).await;

        assert!(network_calls.lock().unwrap().is_empty());
        assert_eq!(custom_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rpc_failure_reaches_the_error_callback() {
        let (endpoint, mut peer_rx, mut peer_tx) = endpoint_with_peer();
        let (network, _calls) = counting("net");
        let interceptor = MeshInterceptor::new(endpoint, network);

        let (recorder, events) = RecordingHandler::new();
        let peer = tokio::spawn(async move {
            let env = peer_rx.next().await.unwrap().unwrap();
            peer_tx
                .send(Envelope::response(
                    env.id.unwrap(),
                    "fetch",
                    Err(crate::bridge::envelope::WireError::new("boom")),
                ))
                .await
                .unwrap();
        });

        interceptor
            .dispatch(
                DispatchRequest::new("http://svc.plt.local", "GET", "/hello"),
                recorder,
            )
            .await;
        peer.await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(&*events, &[Recorded::Error("boom".to_string())]);
    }

    #[tokio::test]
    async fn string_payloads_and_multi_valued_headers_replay() {
        let (endpoint, mut peer_rx, mut peer_tx) = endpoint_with_peer();
        let (network, _calls) = counting("net");
        let interceptor = MeshInterceptor::new(endpoint, network);

        let (recorder, events) = RecordingHandler::new();
        let peer = tokio::spawn(async move {
            let env = peer_rx.next().await.unwrap().unwrap();
            peer_tx
                .send(Envelope::response(
                    env.id.unwrap(),
                    "fetch",
                    Ok(json!({
                        "statusCode": 201,
                        "headers": {"set-cookie": ["a=1", "b=2"]},
                        "rawPayload": "created",
                    })),
                ))
                .await
                .unwrap();
        });

        interceptor
            .dispatch(
                DispatchRequest::new("http://db.plt.local", "POST", "/rows"),
                recorder,
            )
            .await;
        peer.await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            Recorded::Headers {
                status: 201,
                headers: vec![
                    ("set-cookie".to_string(), "a=1".to_string()),
                    ("set-cookie".to_string(), "b=2".to_string()),
                ],
                message: String::new(),
            }
        );
        assert_eq!(events[1], Recorded::Data(b"created".to_vec()));
    }

    #[test]
    fn raw_payload_reconstitutes_binary_forms() {
        let buffer: RawPayload =
            serde_json::from_value(json!({"type": "Buffer", "data": [1, 2, 255]})).unwrap();
        assert_eq!(buffer.into_bytes(), Bytes::from_static(&[1, 2, 255]));

        let text: RawPayload = serde_json::from_value(json!("plain")).unwrap();
        assert_eq!(text.into_bytes(), Bytes::from_static(b"plain"));

        assert!(matches!(
            RawPayload::from_bytes(&[0xff, 0xfe]),
            RawPayload::Bytes(_)
        ));
    }
}

//! Reports the worker's server bind outcome to the parent, exactly once.
//!
//! The reporter observes the bind-starting/bind-finished pair around the
//! worker's own listen call: on start it applies the parent's port directive,
//! on finish it sends a `url` (or `error`) notification and disarms. A second
//! bind in the same process reports nothing unless a new reporter is
//! installed.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};

use crate::bridge::endpoint::ControlEndpoint;
use crate::config::PortPlan;

/// The worker's requested bind target, mutable before the bind happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOptions {
    pub host: String,
    pub port: u16,
}

pub struct ListenReporter {
    endpoint: ControlEndpoint,
    port: PortPlan,
    armed: AtomicBool,
}

impl ListenReporter {
    pub fn new(endpoint: ControlEndpoint, port: PortPlan) -> Self {
        Self {
            endpoint,
            port,
            armed: AtomicBool::new(true),
        }
    }

    /// Applies the parent's port directive to the requested bind target.
    pub fn bind_starting(&self, options: &mut BindOptions) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }
        match self.port {
            PortPlan::DoNotBind => {}
            PortPlan::Fixed(port) => options.port = port,
            PortPlan::Ephemeral => options.port = 0,
        }
    }

    /// Sends the canonical origin URL for the bound address and disarms.
    pub fn bind_succeeded(&self, addr: SocketAddr) {
        if !self.disarm() {
            return;
        }
        let _ = self
            .endpoint
            .notify("url", Value::String(origin_url(&addr)));
    }

    /// Sends the bind failure and disarms.
    pub fn bind_failed(&self, error: &io::Error) {
        if !self.disarm() {
            return;
        }
        let _ = self
            .endpoint
            .notify("error", json!({ "message": error.to_string() }));
    }

    // Idempotent unsubscribe: true only for the first caller.
    fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }
}

/// Canonical origin for a bound address; IPv6 literals are bracketed.
fn origin_url(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("http://{}:{}", ip, addr.port()),
        IpAddr::V6(ip) => format!("http://[{}]:{}", ip, addr.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_util::codec::FramedRead;

    use crate::bridge::channel::DuplexChannel;
    use crate::bridge::codec::FrameCodec;
    use crate::bridge::endpoint::EndpointOptions;
    use crate::bridge::envelope::{Envelope, EnvelopeKind};

    fn reporter_with_peer(
        port: PortPlan,
    ) -> (
        ListenReporter,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, FrameCodec<Envelope>>,
    ) {
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

        let (read_half, _write_half) = tokio::io::split(parent_side);
        let reporter = ListenReporter::new(endpoint, port);
        (reporter, FramedRead::new(read_half, FrameCodec::new()))
    }

    #[tokio::test]
    async fn fixed_and_ephemeral_plans_override_do_not_bind_does_not() {
        let (reporter, _peer) = reporter_with_peer(PortPlan::Fixed(3042));
        let mut options = BindOptions {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        reporter.bind_starting(&mut options);
        assert_eq!(options.port, 3042);

        let (reporter, _peer) = reporter_with_peer(PortPlan::Ephemeral);
        let mut options = BindOptions {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        reporter.bind_starting(&mut options);
        assert_eq!(options.port, 0);

        let (reporter, _peer) = reporter_with_peer(PortPlan::DoNotBind);
        let mut options = BindOptions {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        reporter.bind_starting(&mut options);
        assert_eq!(options.port, 3000);
    }

    #[tokio::test]
    async fn successful_bind_notifies_the_origin_url_once() {
        let (reporter, mut peer) = reporter_with_peer(PortPlan::Ephemeral);

        let addr: SocketAddr = "127.0.0.1:3042".parse().unwrap();
        reporter.bind_succeeded(addr);
        // One-shot: a second bind reports nothing.
        reporter.bind_succeeded("127.0.0.1:9999".parse().unwrap());
        reporter.bind_failed(&io::Error::other("late failure"));

        let env = peer.next().await.unwrap().unwrap();
        assert_eq!(env.kind, EnvelopeKind::Notification);
        assert_eq!(env.command, "url");
        assert_eq!(env.data, serde_json::json!("http://127.0.0.1:3042"));

        // After disarm the port directive no longer applies either.
        let mut options = BindOptions {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        reporter.bind_starting(&mut options);
        assert_eq!(options.port, 3000);
    }

    #[tokio::test]
    async fn failed_bind_notifies_the_error() {
        let (reporter, mut peer) = reporter_with_peer(PortPlan::Ephemeral);

        reporter.bind_failed(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "address already in use",
        ));

        let env = peer.next().await.unwrap().unwrap();
        assert_eq!(env.command, "error");
        assert_eq!(
            env.data["message"],
            serde_json::json!("address already in use")
        );
    }

    #[test]
    fn ipv6_origins_are_bracketed() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(origin_url(&addr), "http://[::1]:8080");

        let addr: SocketAddr = "0.0.0.0:3042".parse().unwrap();
        assert_eq!(origin_url(&addr), "http://0.0.0.0:3042");
    }
}

//! Worker-side bootstrap.
//!
//! Mirrors the boot sequence of a hosted worker: construct the control
//! endpoint over the parent's socket, redirect logging through it, install
//! the mesh interceptor over a network passthrough, arm the listen reporter,
//! and wire the close protocol. Must run inside a tokio runtime.

use std::io;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::endpoint::{ControlEndpoint, EndpointOptions};
use crate::config::{LoggerOptions, WorkerContext};
use crate::fd_redirect::redirect_standard_streams;
use crate::listen::ListenReporter;
use crate::logging::{ControlTracingLayer, LogRecord, spawn_log_forwarder};
use crate::mesh::interceptor::MeshInterceptor;
use crate::mesh::network::NetworkDispatcher;

/// One worker's view of the control plane. Created once at startup and
/// threaded explicitly to whatever needs to talk to the parent.
pub struct WorkerRuntime {
    endpoint: ControlEndpoint,
    dispatcher: Arc<MeshInterceptor>,
    listen: Arc<ListenReporter>,
    log_tx: mpsc::UnboundedSender<LogRecord>,
    logger: LoggerOptions,
}

impl WorkerRuntime {
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    /// The worker's outbound HTTP pipeline: mesh hosts over the channel,
    /// everything else over the network.
    pub fn dispatcher(&self) -> Arc<MeshInterceptor> {
        Arc::clone(&self.dispatcher)
    }

    pub fn listen_reporter(&self) -> Arc<ListenReporter> {
        Arc::clone(&self.listen)
    }

    pub fn log_sender(&self) -> mpsc::UnboundedSender<LogRecord> {
        self.log_tx.clone()
    }

    /// Layer for the worker's tracing subscriber; events ship to the parent
    /// as `log` commands.
    pub fn tracing_layer(&self) -> ControlTracingLayer {
        ControlTracingLayer::new(self.log_tx.clone(), &self.logger)
    }

    /// Sends the final close notification and runs the transport handshake.
    pub async fn close(&self, signal: &str) {
        self.endpoint.close(signal).await;
    }
}

/// Wires every control-plane component for this worker process.
///
/// The channel connects lazily; anything sent before the parent accepts is
/// queued and flushed in order, so callers can use the runtime immediately.
pub fn attach(context: &WorkerContext) -> io::Result<WorkerRuntime> {
    let endpoint = ControlEndpoint::connect(
        &context.socket_path,
        EndpointOptions {
            tolerate_missing_handlers: true,
            ..Default::default()
        },
    );

    // The parent asks us to die with a specific signal; honor it rather than
    // swallowing it.
    endpoint.on_notification("close", |data| {
        terminate_with_signal(&data);
    });

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    spawn_log_forwarder(endpoint.clone(), log_rx);
    redirect_standard_streams(log_tx.clone(), context.logger.name.clone())?;

    let dispatcher = Arc::new(MeshInterceptor::new(
        endpoint.clone(),
        NetworkDispatcher::shared(),
    ));
    let listen = Arc::new(ListenReporter::new(endpoint.clone(), context.port));

    Ok(WorkerRuntime {
        endpoint,
        dispatcher,
        listen,
        log_tx,
        logger: context.logger.clone(),
    })
}

fn terminate_with_signal(data: &Value) {
    let name = signal_name(data);

    #[cfg(unix)]
    {
        use std::str::FromStr;
        use nix::sys::signal::{Signal, raise};

        let signal = Signal::from_str(name).unwrap_or(Signal::SIGTERM);
        let _ = raise(signal);
    }

    #[cfg(not(unix))]
    {
        let _ = name;
        std::process::exit(0);
    }
}

fn signal_name(data: &Value) -> &str {
    data.as_str().unwrap_or("SIGTERM")
}

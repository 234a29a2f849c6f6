//! Duplex control channel between a worker and its parent orchestrator.
//!
//! The channel connects lazily: envelopes transmitted before the socket is
//! established queue in FIFO order and are flushed exactly once on the open
//! transition, atomically before any post-open write. Inbound frames and the
//! loss signal go to a single listener. There is no reconnection; losing the
//! channel is fatal to the worker process.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Mutex as StdMutex;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::envelope::Envelope;

/// Process exit status reserved for "control channel lost, parent
/// unreachable", distinct from application-error exit codes so a supervisor
/// can tell the two apart.
pub const CHANNEL_LOST_EXIT_CODE: i32 = 2;

/// Inbound events surfaced to the channel's single listener.
#[derive(Debug)]
pub enum ChannelEvent {
    Frame(Envelope),
    /// Transport-level failure. Terminal: no frame follows it.
    Lost(ChannelLost),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("control channel lost: {reason}")]
pub struct ChannelLost {
    pub reason: String,
}

impl ChannelLost {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("control channel is closed")]
    Closed,
}

enum WriteState {
    /// Transport not yet established: outbound envelopes queue here.
    Connecting(VecDeque<Envelope>),
    Open(mpsc::UnboundedSender<Envelope>),
    Closed,
}

fn lock_state(state: &StdMutex<WriteState>) -> std::sync::MutexGuard<'_, WriteState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct DuplexChannel {
    state: std::sync::Arc<StdMutex<WriteState>>,
    close_tx: watch::Sender<bool>,
    io_task: StdMutex<Option<JoinHandle<()>>>,
}

impl DuplexChannel {
    /// Connects to the parent's control socket. Returns immediately; the
    /// socket is established in the background while writes queue.
    pub fn connect(
        socket_path: impl AsRef<Path>,
        listener: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let path = socket_path.as_ref().to_path_buf();
        Self::establish(async move { UnixStream::connect(&path).await }, listener)
    }

    /// Builds a channel over any connection future. The production path is
    /// [`DuplexChannel::connect`]; tests gate the future to observe the
    /// CONNECTING state.
    pub fn establish<S, F>(connect: F, listener: mpsc::UnboundedSender<ChannelEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: Future<Output = io::Result<S>> + Send + 'static,
    {
        let state = std::sync::Arc::new(StdMutex::new(WriteState::Connecting(VecDeque::new())));
        let (close_tx, close_rx) = watch::channel(false);

        let io_state = std::sync::Arc::clone(&state);
        let io_task = tokio::spawn(run_io(connect, io_state, listener, close_rx));

        Self {
            state,
            close_tx,
            io_task: StdMutex::new(Some(io_task)),
        }
    }

    /// Queues the envelope while CONNECTING, writes it through once OPEN.
    pub fn transmit(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let mut state = lock_state(&self.state);
        match &mut *state {
            WriteState::Connecting(pending) => {
                pending.push_back(envelope);
                Ok(())
            }
            WriteState::Open(tx) => tx.send(envelope).map_err(|_| ChannelError::Closed),
            WriteState::Closed => Err(ChannelError::Closed),
        }
    }

    /// Closes the channel: flushes queued writes, shuts down the write half,
    /// and waits for the peer to close its end. Idempotent, and resolves even
    /// when the connection was never established.
    pub async fn close(&self) {
        {
            let mut state = lock_state(&self.state);
            *state = WriteState::Closed;
        }
        let _ = self.close_tx.send(true);

        let task = {
            let mut guard = match self.io_task.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run_io<S, F>(
    connect: F,
    state: std::sync::Arc<StdMutex<WriteState>>,
    listener: mpsc::UnboundedSender<ChannelEvent>,
    mut close_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Future<Output = io::Result<S>> + Send + 'static,
{
    let stream = tokio::select! {
        result = connect => match result {
            Ok(stream) => stream,
            Err(e) => {
                *lock_state(&state) = WriteState::Closed;
                let _ = listener.send(ChannelEvent::Lost(ChannelLost::new(format!(
                    "connect failed: {}",
                    e
                ))));
                return;
            }
        },
        _ = close_rx.changed() => {
            // Closed before the socket ever opened; pending writes are dropped.
            *lock_state(&state) = WriteState::Closed;
            return;
        }
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = FramedWrite::new(write_half, FrameCodec::<Envelope>::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // Open transition: flush the pending queue in enqueue order, then route
    // all further writes straight through. The queue is emptied exactly once.
    {
        let mut state = lock_state(&state);
        match std::mem::replace(&mut *state, WriteState::Open(tx.clone())) {
            WriteState::Connecting(pending) => {
                for envelope in pending {
                    let _ = tx.send(envelope);
                }
            }
            WriteState::Closed => {
                // close() raced the connect; stay closed.
                *state = WriteState::Closed;
                return;
            }
            WriteState::Open(_) => unreachable!("channel opened twice"),
        }
    }
    drop(tx);

    let write_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if writer.send(envelope).await.is_err() {
                return;
            }
        }
        // Sender gone: the channel was closed. Flush and signal EOF to the
        // peer so it can complete the close handshake.
        let _ = writer.flush().await;
        let _ = writer.get_mut().shutdown().await;
    });

    let mut reader = FramedRead::new(read_half, FrameCodec::<Envelope>::new());
    let mut closing = *close_rx.borrow();

    loop {
        if closing {
            // Drain until the peer closes its end.
            match reader.next().await {
                Some(Ok(envelope)) => {
                    let _ = listener.send(ChannelEvent::Frame(envelope));
                }
                Some(Err(_)) | None => break,
            }
            continue;
        }

        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(envelope)) => {
                    let _ = listener.send(ChannelEvent::Frame(envelope));
                }
                Some(Err(e)) => {
                    *lock_state(&state) = WriteState::Closed;
                    let _ = listener.send(ChannelEvent::Lost(ChannelLost::new(format!(
                        "protocol desync: {}",
                        e
                    ))));
                    break;
                }
                None => {
                    *lock_state(&state) = WriteState::Closed;
                    let _ = listener.send(ChannelEvent::Lost(ChannelLost::new(
                        "connection closed by peer",
                    )));
                    break;
                }
            },
            _ = close_rx.changed() => {
                closing = true;
            }
        }
    }

    let _ = write_task.await;
}

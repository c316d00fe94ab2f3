//! Per-connection message channel.
//!
//! A [`PayloadStream`] decouples the coordinators from the transport: they
//! push outgoing payloads into a bounded send queue and pull incoming ones
//! from a bounded receive queue, while a dedicated pump task
//! ([`PayloadStream::handle_send_recv`]) moves frames between the queues and
//! the socket. When the transport fails the registered disconnect callback
//! fires so the owning job can abort instead of waiting on a dead peer.
//!
//! A graceful close flushes the send queue; closing after a failure, or
//! [`PayloadStream::disconnect`], stops the pump right away even when the
//! peer has stopped reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DbspError, Result};
use crate::proto::codec::PayloadTransport;
use crate::proto::{MasterPayload, WorkerPayload};

/// Capacity of the send and receive queues of every stream.
pub const QUEUE_CAPACITY: usize = 64;

/// Master-side handle of a connected worker.
pub type RemoteWorkerStream = PayloadStream<MasterPayload, WorkerPayload>;

/// Worker-side handle of the connection to the master.
pub type RemoteMasterStream = PayloadStream<WorkerPayload, MasterPayload>;

type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// The remote end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Worker(u64),
    Master,
}

impl Peer {
    fn disconnected(self) -> DbspError {
        match self {
            Peer::Worker(id) => DbspError::WorkerDisconnected(id),
            Peer::Master => DbspError::MasterDisconnected,
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Worker(id) => write!(f, "worker {}", id),
            Peer::Master => write!(f, "master"),
        }
    }
}

#[derive(Default)]
struct DisconnectState {
    disconnected: bool,
    callback: Option<DisconnectCallback>,
}

struct PumpEnds<Out, In> {
    send_rx: mpsc::Receiver<Out>,
    recv_tx: mpsc::Sender<In>,
}

/// Bidirectional payload channel to a single peer.
pub struct PayloadStream<Out, In> {
    peer: Peer,
    send_tx: mpsc::Sender<Out>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<In>>,
    pump_ends: Mutex<Option<PumpEnds<Out, In>>>,
    disconnect: Mutex<DisconnectState>,
    close_token: CancellationToken,
    /// Cancelling this also cancels `close_token`.
    force_token: CancellationToken,
    closed: AtomicBool,
}

impl<Out, In> PayloadStream<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    pub fn new(peer: Peer) -> Self {
        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let force_token = CancellationToken::new();
        Self {
            peer,
            send_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            pump_ends: Mutex::new(Some(PumpEnds { send_rx, recv_tx })),
            disconnect: Mutex::new(DisconnectState::default()),
            close_token: force_token.child_token(),
            force_token,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Queues a payload for the peer. Blocks while the send queue is full.
    pub async fn send(&self, payload: Out, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            res = self.send_tx.send(payload) => res.map_err(|_| self.peer.disconnected()),
            _ = cancel.cancelled() => Err(DbspError::Cancelled),
        }
    }

    /// Waits for the next payload from the peer.
    pub async fn recv(&self, cancel: &CancellationToken) -> Result<In> {
        tokio::select! {
            payload = async { self.recv_rx.lock().await.recv().await } => {
                payload.ok_or_else(|| self.peer.disconnected())
            }
            _ = cancel.cancelled() => Err(DbspError::Cancelled),
        }
    }

    /// Registers the function to run when the transport fails. If the stream
    /// is already gone the callback runs immediately.
    pub fn set_disconnect_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.lock_disconnect();
        if state.disconnected {
            drop(state);
            callback();
            return;
        }
        state.callback = Some(Box::new(callback));
    }

    pub fn is_disconnected(&self) -> bool {
        self.lock_disconnect().disconnected
    }

    /// Terminates the stream. `reason` is the outcome of the job that used
    /// the stream: after a success, payloads that are already queued are
    /// flushed before the pump exits; after a failure they are dropped.
    /// Closing twice is a no-op, while closing a stream whose transport
    /// already failed reports the disconnect.
    pub fn close(&self, reason: Option<&DbspError>) -> Result<()> {
        if reason.is_some() {
            self.force_token.cancel();
        }
        self.mark_closed(reason)
    }

    /// Terminates the stream without flushing, even if a graceful close is
    /// already waiting on a peer that stopped reading.
    pub fn disconnect(&self) -> Result<()> {
        self.force_token.cancel();
        self.mark_closed(None)
    }

    fn mark_closed(&self, reason: Option<&DbspError>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_disconnected() {
            return Err(self.peer.disconnected());
        }
        match reason {
            Some(err) => tracing::debug!(peer = %self.peer, error = %err, "Closing stream after failure"),
            None => tracing::debug!(peer = %self.peer, "Closing stream"),
        }
        self.close_token.cancel();
        Ok(())
    }

    /// Drops payloads that arrived while no job was reading the stream.
    /// Returns how many were discarded.
    pub fn discard_received(&self) -> usize {
        let Ok(mut recv_rx) = self.recv_rx.try_lock() else {
            return 0;
        };
        let mut discarded = 0;
        while recv_rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Pumps payloads between the queues and `transport` until the stream is
    /// closed or the transport fails.
    ///
    /// Reading and writing run as two halves polled side by side, so a full
    /// receive queue never holds up outgoing payloads and vice versa.
    pub async fn handle_send_recv<T>(&self, transport: PayloadTransport<T, Out, In>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        Out: Unpin,
    {
        let PumpEnds {
            mut send_rx,
            recv_tx,
        } = self
            .pump_ends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| DbspError::Internal(format!("stream to {} is already pumped", self.peer)))?;

        let (mut sink, mut source) = transport.split::<Out>();
        let result = tokio::try_join!(
            self.write_payloads(&mut send_rx, &mut sink),
            self.read_payloads(&recv_tx, &mut source),
        )
        .map(|_| ());

        let callback = {
            let mut state = self.lock_disconnect();
            state.disconnected = true;
            state.callback.take()
        };
        match &result {
            Err(e) if !self.close_token.is_cancelled() => {
                tracing::warn!(peer = %self.peer, error = %e, "Stream disconnected");
                if let Some(callback) = callback {
                    callback();
                }
            }
            _ => tracing::debug!(peer = %self.peer, "Stream closed"),
        }
        result
    }

    async fn write_payloads<S>(&self, send_rx: &mut mpsc::Receiver<Out>, sink: &mut S) -> Result<()>
    where
        S: Sink<Out, Error = DbspError> + Unpin,
    {
        loop {
            let payload = tokio::select! {
                biased;

                _ = self.close_token.cancelled() => return self.flush_pending(send_rx, sink).await,
                payload = send_rx.recv() => match payload {
                    Some(payload) => payload,
                    None => return self.flush_pending(send_rx, sink).await,
                },
            };

            tokio::select! {
                res = sink.send(payload) => res?,
                _ = self.force_token.cancelled() => return Ok(()),
            }
        }
    }

    async fn read_payloads<St>(&self, recv_tx: &mpsc::Sender<In>, source: &mut St) -> Result<()>
    where
        St: Stream<Item = Result<In>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = self.close_token.cancelled() => return Ok(()),
            };
            let payload = match frame {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => return Err(e),
                None => return Err(self.peer.disconnected()),
            };

            tokio::select! {
                res = recv_tx.send(payload) => res.map_err(|_| self.peer.disconnected())?,
                _ = self.close_token.cancelled() => return Ok(()),
            }
        }
    }

    /// Writes out whatever is still queued, unless the stream is forced shut.
    async fn flush_pending<S>(&self, send_rx: &mut mpsc::Receiver<Out>, sink: &mut S) -> Result<()>
    where
        S: Sink<Out, Error = DbspError> + Unpin,
    {
        let flush = async {
            while let Ok(payload) = send_rx.try_recv() {
                sink.feed(payload).await?;
            }
            sink.flush().await
        };
        tokio::select! {
            res = flush => res,
            _ = self.force_token.cancelled() => {
                tracing::debug!(peer = %self.peer, "Dropping queued payloads");
                Ok(())
            }
        }
    }

    fn lock_disconnect(&self) -> std::sync::MutexGuard<'_, DisconnectState> {
        self.disconnect.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Worker node.
//!
//! A worker keeps one connection to the master per job: it dials, waits for
//! its job assignment, runs the job through a [`WorkerJobCoordinator`] and
//! then waits for the master to hang up. Dialing again re-registers the
//! worker as idle for the next job.

pub mod coordinator;
mod relayer;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::WorkerConfig;
use crate::error::{DbspError, Result};
use crate::job::{JobDetails, JobRunner, Serializer};
use crate::proto::codec::{framed, PayloadTransport};
use crate::proto::{MasterPayload, WorkerPayload};
use crate::stream::{Peer, RemoteMasterStream};

pub use coordinator::{WorkerJobCoordinator, WorkerJobCoordinatorConfig};
pub use relayer::MessageRelayer;

/// How long a closed master stream may take to stop pumping.
const PUMP_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Worker {
    cfg: WorkerConfig,
    job_runner: Arc<dyn JobRunner>,
    serializer: Arc<dyn Serializer>,
    master_addr: Mutex<Option<String>>,
    pending: tokio::sync::Mutex<Option<TcpStream>>,
}

impl Worker {
    pub fn new(cfg: WorkerConfig) -> Result<Self> {
        cfg.validate()?;
        let job_runner = cfg
            .job_runner
            .clone()
            .ok_or_else(|| DbspError::Internal("job runner missing".to_string()))?;
        let serializer = cfg
            .serializer
            .clone()
            .ok_or_else(|| DbspError::Internal("serializer missing".to_string()))?;
        Ok(Self {
            cfg,
            job_runner,
            serializer,
            master_addr: Mutex::new(None),
            pending: tokio::sync::Mutex::new(None),
        })
    }

    /// Connects to the master, which registers this worker as idle.
    pub async fn dial(&self, master_addr: &str) -> Result<()> {
        let conn = self.connect(master_addr).await?;
        *self.master_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(master_addr.to_string());
        *self.pending.lock().await = Some(conn);
        tracing::info!(master = %master_addr, "Connected to master");
        Ok(())
    }

    /// Waits for the master to assign a job and runs it.
    ///
    /// Uses the connection opened by [`dial`](Self::dial) or reconnects to
    /// the last dialed master when that connection was consumed by a
    /// previous job.
    pub async fn run_job(&self, cancel: &CancellationToken) -> Result<()> {
        let pending = self.pending.lock().await.take();
        let conn = match pending {
            Some(conn) => conn,
            None => {
                let addr = self
                    .master_addr
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .ok_or_else(|| {
                        DbspError::Internal("worker has not dialed a master".to_string())
                    })?;
                self.connect(&addr).await?
            }
        };
        self.run_job_over(conn, cancel).await
    }

    /// Runs a single job over an already established connection.
    pub async fn run_job_over<T>(&self, io: T, cancel: &CancellationToken) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut transport = framed::<T, WorkerPayload, MasterPayload>(io);
        let job_details = wait_for_job(&mut transport, cancel).await?;

        let span = tracing::info_span!("job", job_id = %job_details.job_id);
        tracing::info!(
            parent: &span,
            from = %job_details.partition_from_id,
            to = %job_details.partition_to_id,
            "Received job assignment"
        );

        let stream = Arc::new(RemoteMasterStream::new(Peer::Master));
        let coordinator = WorkerJobCoordinator::new(
            cancel,
            WorkerJobCoordinatorConfig {
                job_details,
                master_stream: stream.clone(),
                job_runner: self.job_runner.clone(),
                serializer: self.serializer.clone(),
                span: span.clone(),
            },
        );

        let scope = coordinator.scope().clone();
        stream.set_disconnect_callback(move || scope.abort("lost connection to master"));

        let pump_stream = stream.clone();
        let mut pump = tokio::spawn(
            async move { pump_stream.handle_send_recv(transport).await }.instrument(span.clone()),
        );

        let result = coordinator.run_job().await;
        let pumped = match &result {
            Err(err) => {
                close_master_stream(&stream, err, &span);
                join_pump(pump).await
            }
            // The master hangs up once every worker has completed.
            Ok(()) => {
                let hung_up = tokio::select! {
                    joined = &mut pump => Some(joined),
                    _ = cancel.cancelled() => None,
                };
                match hung_up {
                    Some(joined) => joined,
                    None => {
                        close_master_stream(&stream, &DbspError::Cancelled, &span);
                        join_pump(pump).await
                    }
                }
            }
        };
        log_pump_exit(&span, pumped);
        result
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let conn = tokio::time::timeout(self.cfg.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                DbspError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out connecting to master at {addr}"),
                ))
            })??;
        conn.set_nodelay(true)?;
        Ok(conn)
    }

    /// Drops any idle connection to the master.
    pub async fn close(&self) -> Result<()> {
        if self.pending.lock().await.take().is_some() {
            tracing::info!("Closed idle connection to master");
        }
        Ok(())
    }
}

/// Reads the job assignment, which must be the first payload on a fresh
/// connection.
async fn wait_for_job<T>(
    transport: &mut PayloadTransport<T, WorkerPayload, MasterPayload>,
    cancel: &CancellationToken,
) -> Result<JobDetails>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::select! {
        frame = transport.next() => frame,
        _ = cancel.cancelled() => return Err(DbspError::Cancelled),
    };

    match frame {
        Some(Ok(MasterPayload::JobDetails(msg))) => JobDetails::try_from(msg),
        Some(Ok(other)) => Err(DbspError::ProtocolViolation(format!(
            "expected job details as the first payload, got {}",
            other.kind()
        ))),
        Some(Err(e)) => Err(e),
        None => Err(DbspError::MasterDisconnected),
    }
}

fn close_master_stream(stream: &RemoteMasterStream, reason: &DbspError, span: &tracing::Span) {
    if let Err(e) = stream.close(Some(reason)) {
        tracing::debug!(parent: span, error = %e, "Master stream already gone");
    }
}

/// Waits for a closed stream's pump to exit, aborting it after
/// [`PUMP_EXIT_TIMEOUT`].
async fn join_pump(mut pump: JoinHandle<Result<()>>) -> std::result::Result<Result<()>, JoinError> {
    match tokio::time::timeout(PUMP_EXIT_TIMEOUT, &mut pump).await {
        Ok(joined) => joined,
        Err(_) => {
            pump.abort();
            pump.await
        }
    }
}

fn log_pump_exit(span: &tracing::Span, joined: std::result::Result<Result<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => tracing::debug!(parent: span, "Master stream closed"),
        Ok(Err(e)) => tracing::debug!(parent: span, error = %e, "Master stream ended"),
        Err(e) if e.is_cancelled() => {
            tracing::warn!(parent: span, "Master stream pump did not stop in time, aborted")
        }
        Err(e) => tracing::warn!(parent: span, error = %e, "Master stream pump panicked"),
    }
}

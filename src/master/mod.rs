//! Master node.
//!
//! The master accepts worker connections, keeps them in a [`WorkerPool`]
//! and runs jobs across a reserved subset of them with a
//! [`MasterJobCoordinator`]. Every job runs over the full UUID keyspace.

pub mod coordinator;
pub mod pool;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MasterConfig;
use crate::error::{DbspError, Result};
use crate::job::{JobDetails, JobRunner, Serializer};
use crate::proto::codec::framed;
use crate::stream::{Peer, RemoteWorkerStream};

pub use coordinator::{MasterJobCoordinator, MasterJobCoordinatorConfig};
pub use pool::WorkerPool;

pub struct Master {
    cfg: MasterConfig,
    job_runner: Arc<dyn JobRunner>,
    serializer: Arc<dyn Serializer>,
    pool: Arc<WorkerPool>,
    next_worker_id: Arc<AtomicU64>,
    listener: Mutex<Option<ListenerHandle>>,
}

struct ListenerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Master {
    pub fn new(cfg: MasterConfig) -> Result<Self> {
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
            pool: Arc::new(WorkerPool::new()),
            next_worker_id: Arc::new(AtomicU64::new(1)),
            listener: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Binds the listen address and starts accepting workers in the
    /// background. Returns the bound address.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.cfg.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Master listening for workers");

        let shutdown = shutdown.child_token();
        let task = tokio::spawn(accept_workers(
            listener,
            self.pool.clone(),
            self.next_worker_id.clone(),
            shutdown.clone(),
        ));
        *self.lock_listener() = Some(ListenerHandle { shutdown, task });
        Ok(local_addr)
    }

    /// Registers a worker connected over `io` and pumps its stream in the
    /// background until the connection ends.
    pub fn serve_worker<T>(&self, io: T) -> JoinHandle<Result<()>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(serve_worker_connection(self.pool.clone(), id, io))
    }

    /// Runs one job across `min_workers` workers.
    ///
    /// Reserved workers are closed once the job is over, whatever the
    /// outcome; they reconnect to become available for the next job.
    pub async fn run_job(&self, cancel: &CancellationToken) -> Result<()> {
        let workers = self
            .pool
            .reserve_workers_within(
                cancel,
                self.cfg.min_workers,
                self.cfg.worker_acquire_timeout,
            )
            .await?;

        let job_details = JobDetails::new(Uuid::nil(), Uuid::from_u128(u128::MAX));
        let span = tracing::info_span!(
            "job",
            job_id = %job_details.job_id,
            workers = workers.len()
        );
        tracing::info!(parent: &span, created_at = %job_details.created_at, "Starting job");

        let result = match MasterJobCoordinator::new(
            cancel,
            MasterJobCoordinatorConfig {
                job_details,
                workers: workers.clone(),
                job_runner: self.job_runner.clone(),
                serializer: self.serializer.clone(),
                span: span.clone(),
            },
        ) {
            Ok(coordinator) => coordinator.run_job().await,
            Err(err) => Err(err),
        };

        for worker in &workers {
            if let Err(e) = worker.close(result.as_ref().err()) {
                tracing::debug!(parent: &span, peer = %worker.peer(), error = %e, "Worker already disconnected");
            }
        }

        match &result {
            Ok(()) => tracing::info!(parent: &span, "Job completed"),
            Err(e) => tracing::error!(parent: &span, error = %e, "Job failed"),
        }
        result
    }

    /// Stops accepting workers and disconnects every connected one.
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        let listener = self.lock_listener().take();
        if let Some(ListenerHandle { shutdown, task }) = listener {
            shutdown.cancel();
            if let Err(e) = task.await {
                errors.push(DbspError::Internal(format!("listener task failed: {e}")));
            }
        }
        if let Err(e) = self.pool.close() {
            errors.push(e);
        }
        DbspError::from_many(errors)
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<ListenerHandle>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn accept_workers(
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    next_worker_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, peer_addr)) => {
                    if let Err(e) = conn.set_nodelay(true) {
                        tracing::debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let id = next_worker_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(worker_id = id, %peer_addr, "Accepted worker connection");
                    tokio::spawn(serve_worker_connection(pool.clone(), id, conn));
                }
                Err(e) => tracing::error!(error = %e, "Failed to accept worker connection"),
            },
            _ = shutdown.cancelled() => {
                tracing::info!("Master stopped accepting workers");
                return;
            }
        }
    }
}

async fn serve_worker_connection<T>(pool: Arc<WorkerPool>, id: u64, io: T) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stream = Arc::new(RemoteWorkerStream::new(Peer::Worker(id)));
    pool.add_worker(stream.clone());
    let result = stream.handle_send_recv(framed(io)).await;
    pool.remove_worker(id);
    result
}

use std::sync::{Arc, Weak};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::barrier::StepBarrier;
use crate::error::{DbspError, Result};
use crate::job::{Executor, ExecutorFactory, JobDetails, JobRunner, JobScope, Serializer};
use crate::partition::PartitionRange;
use crate::proto::{
    parse_destination, JobDetailsMsg, MasterPayload, RelayMessage, StepType, WorkerPayload,
};
use crate::stream::{Peer, RemoteWorkerStream};

pub struct MasterJobCoordinatorConfig {
    pub job_details: JobDetails,
    /// Reserved workers; worker `i` is assigned partition `i`.
    pub workers: Vec<Arc<RemoteWorkerStream>>,
    pub job_runner: Arc<dyn JobRunner>,
    pub serializer: Arc<dyn Serializer>,
    /// Span that every event of this job is recorded under.
    pub span: tracing::Span,
}

/// State shared between the coordinator and the per-worker receive tasks.
struct JobContext {
    scope: JobScope,
    barrier: StepBarrier,
    partitions: PartitionRange,
    workers: Vec<Arc<RemoteWorkerStream>>,
}

/// Coordinates the workers of a single job so the job phases run in
/// lock-step across the cluster.
pub struct MasterJobCoordinator {
    ctx: Arc<JobContext>,
    job_details: JobDetails,
    job_runner: Arc<dyn JobRunner>,
    serializer: Arc<dyn Serializer>,
    span: tracing::Span,
}

impl MasterJobCoordinator {
    pub fn new(parent: &CancellationToken, cfg: MasterJobCoordinatorConfig) -> Result<Self> {
        let partitions = PartitionRange::new(
            cfg.job_details.partition_from_id,
            cfg.job_details.partition_to_id,
            cfg.workers.len(),
        )?;

        let scope = JobScope::new(parent, cfg.job_details.job_id.clone());
        let barrier = StepBarrier::new(cfg.workers.len(), scope.token().clone());

        Ok(Self {
            ctx: Arc::new(JobContext {
                scope,
                barrier,
                partitions,
                workers: cfg.workers,
            }),
            job_details: cfg.job_details,
            job_runner: cfg.job_runner,
            serializer: cfg.serializer,
            span: cfg.span,
        })
    }

    pub fn partitions(&self) -> &PartitionRange {
        &self.ctx.partitions
    }

    /// Runs the job to completion.
    ///
    /// Every receive task has exited by the time this returns, whatever the
    /// outcome. Failures are reported as [`DbspError::JobAborted`] when they
    /// stem from the job being cancelled.
    pub async fn run_job(&self) -> Result<()> {
        let factory = ExecutorFactory::master(self.serializer.clone());
        let mut executor = match self.job_runner.start_job(&self.job_details, factory).await {
            Ok(executor) => executor,
            Err(err) => {
                self.ctx.scope.finish();
                return Err(err);
            }
        };

        for (partition, worker) in self.ctx.workers.iter().enumerate() {
            let ctx = Arc::downgrade(&self.ctx);
            let peer = worker.peer();
            worker.set_disconnect_callback(move || handle_worker_disconnect(&ctx, peer));

            if let Err(err) = self.publish_job_details(worker, partition).await {
                self.job_runner.abort_job(&self.job_details);
                self.ctx.scope.abort(format!("unable to publish job details: {err}"));
                return Err(self.ctx.scope.job_error(err));
            }
        }

        let mut receivers = JoinSet::new();
        for (index, worker) in self.ctx.workers.iter().enumerate() {
            let ctx = self.ctx.clone();
            let worker = worker.clone();
            receivers.spawn(
                async move { ctx.handle_worker_payloads(index, worker).await }
                    .instrument(self.span.clone()),
            );
        }

        let mut result = self.run_job_to_completion(executor.as_mut()).await;
        if let Err(err) = result {
            self.job_runner.abort_job(&self.job_details);
            result = Err(self.ctx.scope.job_error(err));
        }

        self.ctx.scope.finish();
        while let Some(joined) = receivers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(parent: &self.span, error = %e, "Worker receive task panicked");
            }
        }
        result
    }

    async fn run_job_to_completion(&self, executor: &mut dyn Executor) -> Result<()> {
        let token = self.ctx.scope.token();
        let barrier = &self.ctx.barrier;

        tokio::select! {
            res = executor.run_to_completion(token.clone()) => {
                res.map_err(|e| DbspError::during("executed_graph", e))?
            }
            _ = token.cancelled() => return Err(DbspError::Cancelled),
        }
        tracing::info!(parent: &self.span, "Local graph execution finished");

        barrier.wait_for_workers(StepType::ExecutedGraph).await?;
        barrier.notify_workers(StepType::ExecutedGraph)?;
        tracing::debug!(parent: &self.span, step = %StepType::ExecutedGraph, "Step released");

        tokio::select! {
            res = self.job_runner.complete_job(&self.job_details) => {
                res.map_err(|e| DbspError::during("persisted_results", e))?
            }
            _ = token.cancelled() => return Err(DbspError::Cancelled),
        }

        barrier.wait_for_workers(StepType::PersistedResults).await?;
        barrier.notify_workers(StepType::PersistedResults)?;
        tracing::debug!(parent: &self.span, step = %StepType::PersistedResults, "Step released");

        barrier.wait_for_workers(StepType::CompletedJob).await?;
        tracing::info!(parent: &self.span, "All workers completed the job");
        Ok(())
    }

    /// Sends a worker the job details narrowed to its partition.
    async fn publish_job_details(&self, worker: &RemoteWorkerStream, partition: usize) -> Result<()> {
        let (from, to) = self.ctx.partitions.partition_extents(partition)?;
        let details = self.job_details.with_partition(from, to);
        tracing::debug!(
            parent: &self.span,
            peer = %worker.peer(),
            partition,
            %from,
            %to,
            "Publishing job details"
        );
        worker
            .send(
                MasterPayload::JobDetails(JobDetailsMsg::from(&details)),
                self.ctx.scope.token(),
            )
            .await
    }
}

fn handle_worker_disconnect(ctx: &Weak<JobContext>, peer: Peer) {
    let Some(ctx) = ctx.upgrade() else {
        return;
    };
    if !ctx.scope.is_cancelled() {
        ctx.scope.abort(format!("lost connection to {peer}"));
    }
}

impl JobContext {
    async fn handle_worker_payloads(&self, index: usize, worker: Arc<RemoteWorkerStream>) {
        let token = self.scope.token();
        loop {
            let payload = match worker.recv(token).await {
                Ok(payload) => payload,
                Err(DbspError::Cancelled) => return,
                Err(err) => {
                    self.scope.abort(err.to_string());
                    return;
                }
            };

            match payload {
                WorkerPayload::RelayMessage(msg) => {
                    if let Err(err) = self.relay_message_to_worker(index, msg).await {
                        self.scope.abort(format!("{} sent a bad relay message: {err}", worker.peer()));
                        return;
                    }
                }
                WorkerPayload::Step(StepType::CompletedJob) => {
                    if let Err(err) = self.barrier.arrive(index, StepType::CompletedJob) {
                        self.scope.abort(err.to_string());
                        return;
                    }
                }
                WorkerPayload::Step(step) => {
                    let released = match self.barrier.wait(index, step).await {
                        Ok(released) => released,
                        Err(DbspError::Cancelled) => return,
                        Err(err) => {
                            self.scope.abort(err.to_string());
                            return;
                        }
                    };
                    self.send_to_worker(&worker, MasterPayload::Step(released)).await;
                }
            }
        }
    }

    /// Forwards a relay message to the worker owning its destination.
    async fn relay_message_to_worker(&self, src_index: usize, msg: RelayMessage) -> Result<()> {
        let destination = parse_destination(&msg)?;
        let partition = self.partitions.partition_for_id(destination).map_err(|e| {
            DbspError::ProtocolViolation(format!("unable to identify target partition for message: {e}"))
        })?;

        // Relaying only exists for destinations outside the sender's own
        // partition, so a self-addressed relay points at a missing vertex.
        if partition == src_index {
            return Err(DbspError::ProtocolViolation(format!(
                "received relay request for message to a vertex that does not exist: {destination}"
            )));
        }

        self.send_to_worker(&self.workers[partition], MasterPayload::RelayMessage(msg))
            .await;
        Ok(())
    }

    async fn send_to_worker(&self, worker: &RemoteWorkerStream, payload: MasterPayload) {
        if let Err(e) = worker.send(payload, self.scope.token()).await {
            // A dead worker aborts the job through its disconnect callback.
            tracing::debug!(peer = %worker.peer(), error = %e, "Dropping payload for worker");
        }
    }
}

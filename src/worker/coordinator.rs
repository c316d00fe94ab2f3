use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{DbspError, Result};
use crate::job::{Executor, ExecutorFactory, Graph, JobDetails, JobRunner, JobScope, Serializer};
use crate::proto::{parse_destination, MasterPayload, RelayMessage, StepType, WorkerPayload};
use crate::stream::RemoteMasterStream;
use crate::worker::MessageRelayer;

pub struct WorkerJobCoordinatorConfig {
    pub job_details: JobDetails,
    pub master_stream: Arc<RemoteMasterStream>,
    pub job_runner: Arc<dyn JobRunner>,
    pub serializer: Arc<dyn Serializer>,
    pub span: tracing::Span,
}

/// Runs one job on a worker: executes the local partition and follows the
/// master through the step handshake.
pub struct WorkerJobCoordinator {
    scope: Arc<JobScope>,
    job_details: JobDetails,
    master_stream: Arc<RemoteMasterStream>,
    job_runner: Arc<dyn JobRunner>,
    serializer: Arc<dyn Serializer>,
    span: tracing::Span,
}

impl WorkerJobCoordinator {
    pub fn new(parent: &CancellationToken, cfg: WorkerJobCoordinatorConfig) -> Self {
        Self {
            scope: Arc::new(JobScope::new(parent, cfg.job_details.job_id.clone())),
            job_details: cfg.job_details,
            master_stream: cfg.master_stream,
            job_runner: cfg.job_runner,
            serializer: cfg.serializer,
            span: cfg.span,
        }
    }

    pub fn scope(&self) -> &Arc<JobScope> {
        &self.scope
    }

    pub async fn run_job(&self) -> Result<()> {
        let relayer = MessageRelayer::new(
            self.master_stream.clone(),
            self.serializer.clone(),
            self.scope.token().clone(),
        );
        let factory = ExecutorFactory::worker(self.serializer.clone(), relayer);
        let mut executor = match self.job_runner.start_job(&self.job_details, factory).await {
            Ok(executor) => executor,
            Err(err) => {
                self.scope.finish();
                return Err(err);
            }
        };

        let (ack_tx, mut ack_rx) = mpsc::channel(StepType::ALL.len());
        let handler = MasterPayloadHandler {
            scope: self.scope.clone(),
            stream: self.master_stream.clone(),
            serializer: self.serializer.clone(),
            graph: executor.graph(),
            acks: ack_tx,
        };
        let payload_task = tokio::spawn(handler.run().instrument(self.span.clone()));

        let mut result = self
            .run_job_to_completion(executor.as_mut(), &mut ack_rx)
            .await;
        if let Err(err) = result {
            self.job_runner.abort_job(&self.job_details);
            result = Err(self.scope.job_error(err));
        }

        self.scope.finish();
        if let Err(e) = payload_task.await {
            tracing::warn!(parent: &self.span, error = %e, "Master payload task panicked");
        }
        result
    }

    async fn run_job_to_completion(
        &self,
        executor: &mut dyn Executor,
        acks: &mut mpsc::Receiver<StepType>,
    ) -> Result<()> {
        let token = self.scope.token();

        tokio::select! {
            res = executor.run_to_completion(token.clone()) => {
                res.map_err(|e| DbspError::during("executed_graph", e))?
            }
            _ = token.cancelled() => return Err(DbspError::Cancelled),
        }
        self.sync_step(StepType::ExecutedGraph, acks).await?;

        tokio::select! {
            res = self.job_runner.complete_job(&self.job_details) => {
                res.map_err(|e| DbspError::during("persisted_results", e))?
            }
            _ = token.cancelled() => return Err(DbspError::Cancelled),
        }
        self.sync_step(StepType::PersistedResults, acks).await?;

        // The terminal step is never acknowledged; the master closes the
        // stream once every worker has reported it.
        self.master_stream
            .send(WorkerPayload::Step(StepType::CompletedJob), token)
            .await?;
        tracing::info!(parent: &self.span, "Job completed");
        Ok(())
    }

    /// Reports `step` to the master and waits until it is released.
    async fn sync_step(&self, step: StepType, acks: &mut mpsc::Receiver<StepType>) -> Result<()> {
        let token = self.scope.token();
        self.master_stream
            .send(WorkerPayload::Step(step), token)
            .await?;

        let ack = tokio::select! {
            ack = acks.recv() => ack.ok_or(DbspError::Cancelled)?,
            _ = token.cancelled() => return Err(DbspError::Cancelled),
        };
        if ack != step {
            return Err(DbspError::ProtocolViolation(format!(
                "expected master to acknowledge {step}, got {ack}"
            )));
        }
        tracing::debug!(parent: &self.span, %step, "Step acknowledged");
        Ok(())
    }
}

/// Drains the master stream for the lifetime of a job.
struct MasterPayloadHandler {
    scope: Arc<JobScope>,
    stream: Arc<RemoteMasterStream>,
    serializer: Arc<dyn Serializer>,
    graph: Arc<dyn Graph>,
    acks: mpsc::Sender<StepType>,
}

impl MasterPayloadHandler {
    async fn run(self) {
        let token = self.scope.token();
        loop {
            let payload = match self.stream.recv(token).await {
                Ok(payload) => payload,
                Err(DbspError::Cancelled) => return,
                Err(err) => {
                    self.scope.abort(err.to_string());
                    return;
                }
            };

            match payload {
                MasterPayload::RelayMessage(msg) => {
                    if let Err(err) = self.deliver(&msg) {
                        self.scope
                            .abort(format!("unable to deliver relayed message: {err}"));
                        return;
                    }
                }
                MasterPayload::Step(step) => {
                    if self.acks.send(step).await.is_err() {
                        return;
                    }
                }
                MasterPayload::JobDetails(_) => {
                    self.scope
                        .abort("received job details while a job is already running");
                    return;
                }
            }
        }
    }

    fn deliver(&self, msg: &RelayMessage) -> Result<()> {
        let destination = parse_destination(msg)?;
        let message = self.serializer.unserialize(&msg.payload)?;
        self.graph.deliver_message(destination, message)
    }
}

//! Test harness for master/worker job integration tests.
//!
//! Wires masters and workers together over in-memory duplex pipes and
//! provides a scriptable job runner that records every call it receives.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dbsp_lite::config::{MasterConfig, WorkerConfig};
use dbsp_lite::job::serializer::JsonSerializer;
use dbsp_lite::job::{Executor, ExecutorFactory, Graph, JobDetails, JobRunner, Message};
use dbsp_lite::master::Master;
use dbsp_lite::proto::codec::{framed, PayloadTransport};
use dbsp_lite::proto::{MasterPayload, WorkerPayload};
use dbsp_lite::worker::{MessageRelayer, Worker};
use dbsp_lite::{DbspError, Result};

/// Buffer size of the in-memory pipes between master and workers.
const PIPE_CAPACITY: usize = 64 * 1024;

/// What the executor handed out by [`TestJobRunner`] does.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Finish immediately.
    Succeed,
    /// Fail the local graph execution.
    FailExecution,
    /// Never finish; only returns once the job is cancelled.
    HangUntilCancelled,
    /// Relay one message to each of these vertices that is not owned by the
    /// local partition, then finish.
    RelayTo(Vec<Uuid>),
}

/// Everything a [`TestJobRunner`] observed.
#[derive(Debug, Default)]
pub struct RunnerStats {
    pub started: AtomicUsize,
    pub aborted: AtomicUsize,
    pub completed: AtomicUsize,
    pub jobs: Mutex<Vec<JobDetails>>,
    pub delivered: Mutex<Vec<(Uuid, serde_json::Value)>>,
}

impl RunnerStats {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<JobDetails> {
        self.jobs.lock().unwrap().last().cloned()
    }

    pub fn delivered(&self) -> Vec<(Uuid, serde_json::Value)> {
        self.delivered.lock().unwrap().clone()
    }
}

pub struct TestJobRunner {
    behavior: Behavior,
    pub stats: Arc<RunnerStats>,
}

impl TestJobRunner {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            stats: Arc::new(RunnerStats::default()),
        })
    }
}

#[async_trait]
impl JobRunner for TestJobRunner {
    async fn start_job(
        &self,
        details: &JobDetails,
        factory: ExecutorFactory,
    ) -> Result<Box<dyn Executor>> {
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        self.stats.jobs.lock().unwrap().push(details.clone());
        Ok(Box::new(TestExecutor {
            behavior: self.behavior.clone(),
            details: details.clone(),
            relayer: factory.relayer().cloned(),
            graph: Arc::new(RecordingGraph {
                stats: self.stats.clone(),
            }),
        }))
    }

    fn abort_job(&self, _details: &JobDetails) {
        self.stats.aborted.fetch_add(1, Ordering::SeqCst);
    }

    async fn complete_job(&self, _details: &JobDetails) -> Result<()> {
        self.stats.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestExecutor {
    behavior: Behavior,
    details: JobDetails,
    relayer: Option<MessageRelayer>,
    graph: Arc<RecordingGraph>,
}

#[async_trait]
impl Executor for TestExecutor {
    async fn run_to_completion(&mut self, cancel: CancellationToken) -> Result<()> {
        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::FailExecution => Err(DbspError::Internal("superstep failed".to_string())),
            Behavior::HangUntilCancelled => {
                cancel.cancelled().await;
                Err(DbspError::Cancelled)
            }
            Behavior::RelayTo(targets) => {
                let Some(relayer) = &self.relayer else {
                    return Ok(());
                };
                let from = self.details.partition_from_id;
                let to = self.details.partition_to_id;
                for target in targets.iter().filter(|t| **t < from || **t >= to) {
                    relayer
                        .relay(*target, Box::new(json!({ "from": from.to_string() })))
                        .await?;
                }
                Ok(())
            }
        }
    }

    fn graph(&self) -> Arc<dyn Graph> {
        self.graph.clone()
    }
}

struct RecordingGraph {
    stats: Arc<RunnerStats>,
}

impl Graph for RecordingGraph {
    fn deliver_message(&self, destination: Uuid, message: Message) -> Result<()> {
        let value = message
            .downcast::<serde_json::Value>()
            .map_err(|_| DbspError::Internal("unexpected message type".to_string()))?;
        self.stats.delivered.lock().unwrap().push((destination, *value));
        Ok(())
    }
}

pub fn test_master(runner: Arc<TestJobRunner>, min_workers: usize) -> Arc<Master> {
    let cfg = MasterConfig::new("127.0.0.1:0", runner, Arc::new(JsonSerializer))
        .with_min_workers(min_workers);
    Arc::new(Master::new(cfg).unwrap())
}

pub fn test_worker(runner: Arc<TestJobRunner>) -> Arc<Worker> {
    let cfg = WorkerConfig::new(runner, Arc::new(JsonSerializer))
        .with_dial_timeout(Duration::from_secs(2));
    Arc::new(Worker::new(cfg).unwrap())
}

/// Connects `worker` to `master` over an in-memory pipe and starts waiting
/// for a job in the background.
pub fn connect_worker(
    master: &Master,
    worker: Arc<Worker>,
    cancel: &CancellationToken,
) -> JoinHandle<Result<()>> {
    let (master_io, worker_io) = tokio::io::duplex(PIPE_CAPACITY);
    master.serve_worker(master_io);
    let cancel = cancel.clone();
    tokio::spawn(async move { worker.run_job_over(worker_io, &cancel).await })
}

/// A worker connection driven by hand from the test.
pub type RawWorker = PayloadTransport<DuplexStream, WorkerPayload, MasterPayload>;

pub fn connect_raw_worker(master: &Master) -> RawWorker {
    let (master_io, worker_io) = tokio::io::duplex(PIPE_CAPACITY);
    master.serve_worker(master_io);
    framed(worker_io)
}

/// Waits until the master has registered `count` idle workers.
pub async fn wait_for_idle_workers(master: &Master, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while master.pool().idle_count() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} idle workers"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until the master no longer holds reserved workers.
pub async fn wait_for_released_workers(master: &Master) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while master.pool().reserved_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for reserved workers to disconnect"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits for a spawned job future, failing the test if it hangs.
pub async fn join_within<T>(handle: JoinHandle<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("task did not finish in time")
        .expect("task panicked")
}

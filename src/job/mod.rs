//! Job description and the collaborators that run the graph computation.
//!
//! The coordinators never touch vertices themselves. They drive a
//! [`JobRunner`] which hands back an [`Executor`] for the local slice of the
//! graph, and move opaque messages around with the help of a
//! [`Serializer`].
//!
//! # Components
//!
//! - [`JobDetails`]: identity and keyspace slice of a job
//! - [`ExecutorFactory`]: what the coordinator gives the runner to wire the
//!   executor into the cluster (serializer, message relaying)
//! - [`JobScope`](scope::JobScope): per-job cancellation plus first abort
//!   cause
//! - [`JsonSerializer`](serializer::JsonSerializer) and
//!   [`DryRunJobRunner`](dry_run::DryRunJobRunner): concrete collaborators
//!   used by the CLI

pub mod dry_run;
pub mod scope;
pub mod serializer;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::proto::WirePayload;
use crate::worker::MessageRelayer;

pub use scope::JobScope;

/// An application message produced or consumed by the graph computation.
pub type Message = Box<dyn Any + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub partition_from_id: Uuid,
    pub partition_to_id: Uuid,
}

impl JobDetails {
    /// Creates a job with a fresh ID spanning `[from, to]`.
    pub fn new(partition_from_id: Uuid, partition_to_id: Uuid) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            created_at: Utc::now().trunc_subsecs(3),
            partition_from_id,
            partition_to_id,
        }
    }

    /// Same job, narrowed to a single partition's extents.
    pub fn with_partition(&self, from: Uuid, to: Uuid) -> Self {
        Self {
            partition_from_id: from,
            partition_to_id: to,
            ..self.clone()
        }
    }
}

/// Encodes application messages into a generic wire container.
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &(dyn Any + Send)) -> Result<WirePayload>;
    fn unserialize(&self, payload: &WirePayload) -> Result<Message>;
}

/// The local vertex store of a running job.
pub trait Graph: Send + Sync {
    /// Hands a message relayed from another partition to a local vertex.
    fn deliver_message(&self, destination: Uuid, message: Message) -> Result<()>;
}

#[async_trait]
pub trait Executor: Send {
    /// Runs supersteps until the computation converges or `cancel` fires.
    async fn run_to_completion(&mut self, cancel: CancellationToken) -> Result<()>;

    fn graph(&self) -> Arc<dyn Graph>;
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn start_job(
        &self,
        details: &JobDetails,
        factory: ExecutorFactory,
    ) -> Result<Box<dyn Executor>>;

    /// Discards any state of a failed job.
    fn abort_job(&self, details: &JobDetails);

    /// Persists the results of a job whose graph has been executed.
    async fn complete_job(&self, details: &JobDetails) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorRole {
    Master,
    Worker,
}

/// Handed to [`JobRunner::start_job`] so the executor can take part in the
/// distributed job.
#[derive(Clone)]
pub struct ExecutorFactory {
    role: ExecutorRole,
    serializer: Arc<dyn Serializer>,
    relayer: Option<MessageRelayer>,
}

impl ExecutorFactory {
    pub fn master(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            role: ExecutorRole::Master,
            serializer,
            relayer: None,
        }
    }

    pub fn worker(serializer: Arc<dyn Serializer>, relayer: MessageRelayer) -> Self {
        Self {
            role: ExecutorRole::Worker,
            serializer,
            relayer: Some(relayer),
        }
    }

    pub fn role(&self) -> ExecutorRole {
        self.role
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Sends messages for non-local vertices back to the master. Only
    /// workers get one.
    pub fn relayer(&self) -> Option<&MessageRelayer> {
        self.relayer.as_ref()
    }
}

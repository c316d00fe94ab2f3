use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DbspError, Result};
use crate::job::{JobRunner, Serializer};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7070";

/// Configuration of a master node.
#[derive(Clone)]
pub struct MasterConfig {
    /// Address the master accepts worker connections on.
    pub listen_addr: String,
    pub job_runner: Option<Arc<dyn JobRunner>>,
    pub serializer: Option<Arc<dyn Serializer>>,
    /// Number of workers every job is spread across.
    pub min_workers: usize,
    /// How long a job waits for enough idle workers. `None` waits until the
    /// caller gives up.
    pub worker_acquire_timeout: Option<Duration>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            job_runner: None,
            serializer: None,
            min_workers: 1,
            worker_acquire_timeout: None,
        }
    }
}

impl fmt::Debug for MasterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterConfig")
            .field("listen_addr", &self.listen_addr)
            .field("job_runner", &self.job_runner.is_some())
            .field("serializer", &self.serializer.is_some())
            .field("min_workers", &self.min_workers)
            .field("worker_acquire_timeout", &self.worker_acquire_timeout)
            .finish()
    }
}

impl MasterConfig {
    pub fn new(
        listen_addr: impl Into<String>,
        job_runner: Arc<dyn JobRunner>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            job_runner: Some(job_runner),
            serializer: Some(serializer),
            ..Default::default()
        }
    }

    pub fn with_min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers;
        self
    }

    pub fn with_worker_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.worker_acquire_timeout = Some(timeout);
        self
    }

    /// Checks the config, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.listen_addr.is_empty() {
            problems.push("listen address not specified".to_string());
        }
        if self.job_runner.is_none() {
            problems.push("job runner not specified".to_string());
        }
        if self.serializer.is_none() {
            problems.push("serializer not specified".to_string());
        }
        if self.min_workers == 0 {
            problems.push("at least one worker is required per job".to_string());
        }
        into_result(problems)
    }
}

/// Configuration of a worker node.
#[derive(Clone)]
pub struct WorkerConfig {
    pub job_runner: Option<Arc<dyn JobRunner>>,
    pub serializer: Option<Arc<dyn Serializer>>,
    /// Upper bound for establishing the connection to the master.
    pub dial_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_runner: None,
            serializer: None,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("job_runner", &self.job_runner.is_some())
            .field("serializer", &self.serializer.is_some())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

impl WorkerConfig {
    pub fn new(job_runner: Arc<dyn JobRunner>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            job_runner: Some(job_runner),
            serializer: Some(serializer),
            ..Default::default()
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.job_runner.is_none() {
            problems.push("job runner not specified".to_string());
        }
        if self.serializer.is_none() {
            problems.push("message serializer not specified".to_string());
        }
        if self.dial_timeout.is_zero() {
            problems.push("dial timeout must be positive".to_string());
        }
        into_result(problems)
    }
}

fn into_result(problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DbspError::ConfigInvalid(problems))
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbspError {
    #[error("config validation failed: {}", .0.join("; "))]
    ConfigInvalid(Vec<String>),

    #[error("partition error: {0}")]
    Partition(String),

    #[error("unable to reserve {requested} workers")]
    ReservationFailed { requested: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker {0} disconnected")]
    WorkerDisconnected(u64),

    #[error("master disconnected")]
    MasterDisconnected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("job {job_id} aborted: {reason}")]
    JobAborted { job_id: String, reason: String },

    #[error("executor failed during {phase}: {reason}")]
    ExecutorFailed { phase: &'static str, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<DbspError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbspError {
    /// Wraps an opaque collaborator failure for the given job phase.
    pub fn executor(phase: &'static str, err: impl std::fmt::Display) -> Self {
        DbspError::ExecutorFailed {
            phase,
            reason: err.to_string(),
        }
    }

    /// Attributes a collaborator failure to `phase`. Cancellation and
    /// failures that already carry a phase pass through unchanged.
    pub fn during(phase: &'static str, err: DbspError) -> Self {
        match err {
            DbspError::Cancelled
            | DbspError::ExecutorFailed { .. }
            | DbspError::JobAborted { .. } => err,
            other => DbspError::executor(phase, other),
        }
    }

    /// Collapses a list of errors into a single result.
    pub fn from_many(mut errors: Vec<DbspError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DbspError::Multiple(errors)),
        }
    }

    pub fn is_job_aborted(&self) -> bool {
        matches!(self, DbspError::JobAborted { .. })
    }
}

fn join_errors(errors: &[DbspError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, DbspError>;

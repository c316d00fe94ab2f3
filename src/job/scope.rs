use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

use crate::error::DbspError;

/// Cancellation scope of a single job.
///
/// Child of the caller's token, so cancelling the process cancels every job.
/// The first recorded abort reason wins and is reported in
/// [`DbspError::JobAborted`].
#[derive(Debug)]
pub struct JobScope {
    job_id: String,
    token: CancellationToken,
    abort_reason: OnceLock<String>,
}

impl JobScope {
    pub fn new(parent: &CancellationToken, job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            token: parent.child_token(),
            abort_reason: OnceLock::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the job, remembering `reason` if it is the first one.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.token.is_cancelled() && self.abort_reason.set(reason.clone()).is_ok() {
            tracing::error!(job_id = %self.job_id, reason = %reason, "Aborting job");
        }
        self.token.cancel();
    }

    /// Cancels the job without recording a failure.
    pub fn finish(&self) {
        self.token.cancel();
    }

    /// Maps an error observed while running the job to the error reported to
    /// the caller. Anything that happened after cancellation is an abort.
    pub fn job_error(&self, err: DbspError) -> DbspError {
        if matches!(err, DbspError::Cancelled) || self.token.is_cancelled() {
            let reason = self
                .abort_reason
                .get()
                .cloned()
                .unwrap_or_else(|| match err {
                    DbspError::Cancelled => "job context cancelled".to_string(),
                    other => other.to_string(),
                });
            DbspError::JobAborted {
                job_id: self.job_id.clone(),
                reason,
            }
        } else {
            err
        }
    }
}

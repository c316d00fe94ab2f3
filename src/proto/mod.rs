//! Messages exchanged between the master and its workers.
//!
//! Every worker holds one bidirectional stream to the master for the
//! lifetime of a job. The master writes [`MasterPayload`]s and the worker
//! writes [`WorkerPayload`]s; both are framed by [`codec::PayloadCodec`].

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DbspError, Result};
use crate::job::JobDetails;

/// Job phases that all participants must agree on before moving forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    ExecutedGraph,
    PersistedResults,
    CompletedJob,
}

impl StepType {
    pub const ALL: [StepType; 3] = [
        StepType::ExecutedGraph,
        StepType::PersistedResults,
        StepType::CompletedJob,
    ];

    pub fn index(self) -> usize {
        match self {
            StepType::ExecutedGraph => 0,
            StepType::PersistedResults => 1,
            StepType::CompletedJob => 2,
        }
    }

    /// The step that follows this one, if any.
    pub fn next(self) -> Option<StepType> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::ExecutedGraph => write!(f, "EXECUTED_GRAPH"),
            StepType::PersistedResults => write!(f, "PERSISTED_RESULTS"),
            StepType::CompletedJob => write!(f, "COMPLETED_JOB"),
        }
    }
}

/// Serialized application message, tagged with the name of its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub type_name: String,
    pub value: Vec<u8>,
}

/// A message addressed to a vertex owned by another partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub destination: String,
    pub payload: WirePayload,
}

/// Job assignment sent to a worker before anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetailsMsg {
    pub job_id: String,
    pub created_at_ms: i64,
    pub partition_from_id: Vec<u8>,
    pub partition_to_id: Vec<u8>,
}

impl From<&JobDetails> for JobDetailsMsg {
    fn from(details: &JobDetails) -> Self {
        Self {
            job_id: details.job_id.clone(),
            created_at_ms: details.created_at.timestamp_millis(),
            partition_from_id: details.partition_from_id.as_bytes().to_vec(),
            partition_to_id: details.partition_to_id.as_bytes().to_vec(),
        }
    }
}

impl TryFrom<JobDetailsMsg> for JobDetails {
    type Error = DbspError;

    fn try_from(msg: JobDetailsMsg) -> Result<Self> {
        if msg.job_id.is_empty() {
            return Err(DbspError::ProtocolViolation(
                "job details carry an empty job ID".to_string(),
            ));
        }
        let created_at = DateTime::<Utc>::from_timestamp_millis(msg.created_at_ms).ok_or_else(
            || {
                DbspError::ProtocolViolation(format!(
                    "unable to parse job creation time: {}",
                    msg.created_at_ms
                ))
            },
        )?;
        let partition_from_id = Uuid::from_slice(&msg.partition_from_id).map_err(|e| {
            DbspError::ProtocolViolation(format!("unable to parse partition start UUID: {e}"))
        })?;
        let partition_to_id = Uuid::from_slice(&msg.partition_to_id).map_err(|e| {
            DbspError::ProtocolViolation(format!("unable to parse partition end UUID: {e}"))
        })?;

        Ok(JobDetails {
            job_id: msg.job_id,
            created_at,
            partition_from_id,
            partition_to_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum MasterPayload {
    JobDetails(JobDetailsMsg),
    RelayMessage(RelayMessage),
    Step(StepType),
}

impl MasterPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            MasterPayload::JobDetails(_) => "job_details",
            MasterPayload::RelayMessage(_) => "relay_message",
            MasterPayload::Step(_) => "step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum WorkerPayload {
    RelayMessage(RelayMessage),
    Step(StepType),
}

/// Parses the textual destination of a relay message.
pub fn parse_destination(msg: &RelayMessage) -> Result<Uuid> {
    Uuid::parse_str(&msg.destination).map_err(|e| {
        DbspError::ProtocolViolation(format!(
            "unable to parse message destination UUID {:?}: {e}",
            msg.destination
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details_msg() -> JobDetailsMsg {
        JobDetailsMsg {
            job_id: "job-1".to_string(),
            created_at_ms: 1_700_000_000_123,
            partition_from_id: Uuid::from_u128(1).as_bytes().to_vec(),
            partition_to_id: Uuid::from_u128(99).as_bytes().to_vec(),
        }
    }

    #[test]
    fn step_ordering_is_strict() {
        assert!(StepType::ExecutedGraph < StepType::PersistedResults);
        assert!(StepType::PersistedResults < StepType::CompletedJob);
        assert_eq!(StepType::ExecutedGraph.next(), Some(StepType::PersistedResults));
        assert_eq!(StepType::CompletedJob.next(), None);
    }

    #[test]
    fn job_details_msg_converts_back() {
        let details = JobDetails::try_from(details_msg()).unwrap();
        assert_eq!(details.job_id, "job-1");
        assert_eq!(details.created_at.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(details.partition_from_id, Uuid::from_u128(1));
        assert_eq!(details.partition_to_id, Uuid::from_u128(99));
    }

    #[test]
    fn malformed_partition_id_is_protocol_violation() {
        let mut msg = details_msg();
        msg.partition_to_id = vec![1, 2, 3];
        let err = JobDetails::try_from(msg).unwrap_err();
        assert!(matches!(err, DbspError::ProtocolViolation(_)));
    }

    #[test]
    fn malformed_timestamp_is_protocol_violation() {
        let mut msg = details_msg();
        msg.created_at_ms = i64::MAX;
        let err = JobDetails::try_from(msg).unwrap_err();
        assert!(matches!(err, DbspError::ProtocolViolation(_)));
    }

    #[test]
    fn bad_destination_is_rejected() {
        let msg = RelayMessage {
            destination: "not-a-uuid".to_string(),
            payload: WirePayload {
                type_name: "json".to_string(),
                value: Vec::new(),
            },
        };
        assert!(matches!(
            parse_destination(&msg),
            Err(DbspError::ProtocolViolation(_))
        ));
    }
}

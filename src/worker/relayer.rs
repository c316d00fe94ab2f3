use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Message, Serializer};
use crate::proto::{RelayMessage, WorkerPayload};
use crate::stream::RemoteMasterStream;

/// Sends messages for vertices outside the local partition to the master,
/// which forwards them to the owning worker.
#[derive(Clone)]
pub struct MessageRelayer {
    stream: Arc<RemoteMasterStream>,
    serializer: Arc<dyn Serializer>,
    cancel: CancellationToken,
}

impl MessageRelayer {
    pub(crate) fn new(
        stream: Arc<RemoteMasterStream>,
        serializer: Arc<dyn Serializer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            serializer,
            cancel,
        }
    }

    /// Serializes `message` and queues it for `destination`. The worker does
    /// not know which partition owns the destination; the master resolves it.
    pub async fn relay(&self, destination: Uuid, message: Message) -> Result<()> {
        let payload = self.serializer.serialize(&*message)?;
        let msg = RelayMessage {
            destination: destination.to_string(),
            payload,
        };
        self.stream
            .send(WorkerPayload::RelayMessage(msg), &self.cancel)
            .await
    }
}

//! Offset commits for one consumer group member

use fluxgate::engine::CLIENT_BINDING;
use fluxgate::frame::{KafkaBeginEx, KafkaDataEx, KafkaOffset};
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::FluxgateClientError;
use crate::stream::ClientStream;

/// Credit charged per commit; completion is observed as its acknowledgement.
const COMMIT_RESERVED: i32 = 1;

pub struct OffsetCommitter {
    stream: ClientStream,
    generation_id: i32,
}

impl OffsetCommitter {
    pub fn open(
        connection: &Arc<Connection>,
        group_id: &str,
        member_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Self, FluxgateClientError> {
        let stream = connection.open(
            CLIENT_BINDING,
            0,
            KafkaBeginEx::OffsetCommit {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                instance_id: instance_id.map(str::to_string),
            },
        )?;
        Ok(Self {
            stream,
            generation_id: -1,
        })
    }

    pub fn with_generation_id(mut self, generation_id: i32) -> Self {
        self.generation_id = generation_id;
        self
    }

    /// Commits `offset` and waits until the broker accepted it
    pub async fn commit(
        &mut self,
        topic: &str,
        offset: KafkaOffset,
        leader_epoch: i32,
    ) -> Result<(), FluxgateClientError> {
        let extension = KafkaDataEx::OffsetCommit {
            topic: topic.to_string(),
            partition: offset,
            generation_id: self.generation_id,
            leader_epoch,
        };
        self.stream.write_control(COMMIT_RESERVED, extension).await?;
        self.stream.flushed().await
    }

    pub fn close(mut self) -> Result<(), FluxgateClientError> {
        self.stream.end()
    }
}

//! Producer bound to one topic partition

use bytes::Bytes;
use fluxgate::engine::CLIENT_BINDING;
use fluxgate::frame::{Frame, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaHeader, KafkaOffset};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::connection::Connection;
use crate::error::FluxgateClientError;
use crate::stream::ClientStream;

/// Record to be produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<KafkaHeader>,
    /// Milliseconds since the epoch, `None` for now
    pub timestamp: Option<i64>,
}

impl ProduceRecord {
    pub fn new<V: Into<Bytes>>(value: V) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn with_key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header<V: Into<Bytes>>(mut self, name: &str, value: V) -> Self {
        self.headers.push((name.to_string(), Some(value.into())));
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

pub struct Producer {
    stream: ClientStream,
    topic: String,
    partition_id: i32,
}

impl Producer {
    pub async fn open(
        connection: &Arc<Connection>,
        topic: &str,
        partition_id: i32,
    ) -> Result<Self, FluxgateClientError> {
        let mut stream = connection.open(
            CLIENT_BINDING,
            0,
            KafkaBeginEx::Produce {
                transaction: None,
                topic: topic.to_string(),
                partition: KafkaOffset::new(partition_id, -1),
            },
        )?;
        stream.opened().await?;
        debug!("producer for {}-{} ready", topic, partition_id);
        Ok(Self {
            stream,
            topic: topic.to_string(),
            partition_id,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// Sends one record and waits for its base offset
    pub async fn send(&mut self, record: ProduceRecord) -> Result<i64, FluxgateClientError> {
        let timestamp = record.timestamp.unwrap_or_else(now_ms);
        let extension = KafkaDataEx::Produce {
            deferred: 0,
            timestamp,
            key: record.key,
            headers: record.headers,
        };
        self.stream.write(Some(record.value), Some(extension)).await?;

        loop {
            match self.stream.recv().await? {
                Frame::Flush(flush) => match flush.extension {
                    Some(KafkaFlushEx::Produce { partition, error }) => {
                        if error != 0 {
                            return Err(FluxgateClientError::rejected(error));
                        }
                        return Ok(partition.partition_offset);
                    }
                    other => debug!("producer ignoring flush {:?}", other),
                },
                Frame::End(_) => {
                    return Err(FluxgateClientError::closed("producer stream ended"));
                }
                _ => {}
            }
        }
    }

    pub fn close(mut self) -> Result<(), FluxgateClientError> {
        self.stream.end()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = ProduceRecord::new("value")
            .with_key("key")
            .with_header("trace", "abc")
            .with_timestamp(42);
        assert_eq!(record.value, Bytes::from_static(b"value"));
        assert_eq!(record.key, Some(Bytes::from_static(b"key")));
        assert_eq!(
            record.headers,
            vec![("trace".to_string(), Some(Bytes::from_static(b"abc")))]
        );
        assert_eq!(record.timestamp, Some(42));
    }
}

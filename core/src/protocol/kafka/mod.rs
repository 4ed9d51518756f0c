//! Kafka Wire Protocol
//!
//! Requests written by the gateway have the following layout:
//! ```text
//! RequestMessage => length RequestHeader RequestBody
//! length => int32 (bytes following the length field)
//! RequestHeader => api_key api_version correlation_id client_id
//! api_key => int16
//! api_version => int16
//! correlation_id => int32
//! client_id => nullable_string
//! ```
//!
//! Responses start with `length => int32` and `correlation_id => int32`.

pub mod codec;
pub mod errors;
pub mod messages;
pub mod records;

pub use codec::{partial, KafkaCodecError, WireReader};
pub use errors::*;
pub use messages::*;

/// Kafka API keys used by the gateway clients
pub const API_KEY_PRODUCE: i16 = 0;
pub const API_KEY_FETCH: i16 = 1;
pub const API_KEY_OFFSET_COMMIT: i16 = 8;
pub const API_KEY_OFFSET_FETCH: i16 = 9;
pub const API_KEY_SASL_HANDSHAKE: i16 = 17;
pub const API_KEY_CREATE_TOPICS: i16 = 19;
pub const API_KEY_DELETE_TOPICS: i16 = 20;
pub const API_KEY_DESCRIBE_CONFIGS: i16 = 32;
pub const API_KEY_SASL_AUTHENTICATE: i16 = 36;
pub const API_KEY_DESCRIBE_CLUSTER: i16 = 60;

/// API versions, one per key
pub const API_VERSION_PRODUCE: i16 = 3;
pub const API_VERSION_FETCH: i16 = 5;
pub const API_VERSION_OFFSET_COMMIT: i16 = 7;
pub const API_VERSION_OFFSET_FETCH: i16 = 0;
pub const API_VERSION_SASL_HANDSHAKE: i16 = 1;
pub const API_VERSION_CREATE_TOPICS: i16 = 3;
pub const API_VERSION_DELETE_TOPICS: i16 = 3;
pub const API_VERSION_DESCRIBE_CONFIGS: i16 = 0;
pub const API_VERSION_SASL_AUTHENTICATE: i16 = 1;
pub const API_VERSION_DESCRIBE_CLUSTER: i16 = 0;

/// Size of the leading length field of every request and response.
pub const KAFKA_FRAME_LENGTH_FIELD_OFFSET: usize = 4;

/// Describe configs resource type for topics.
pub const RESOURCE_TYPE_TOPIC: i8 = 2;

/// Human readable API name for logging.
pub fn api_name(api_key: i16) -> &'static str {
    match api_key {
        API_KEY_PRODUCE => "Produce",
        API_KEY_FETCH => "Fetch",
        API_KEY_OFFSET_COMMIT => "OffsetCommit",
        API_KEY_OFFSET_FETCH => "OffsetFetch",
        API_KEY_SASL_HANDSHAKE => "SaslHandshake",
        API_KEY_CREATE_TOPICS => "CreateTopics",
        API_KEY_DELETE_TOPICS => "DeleteTopics",
        API_KEY_DESCRIBE_CONFIGS => "DescribeConfigs",
        API_KEY_SASL_AUTHENTICATE => "SaslAuthenticate",
        API_KEY_DESCRIBE_CLUSTER => "DescribeCluster",
        _ => "Unknown",
    }
}

/// Whether the response to this API uses the flexible (v1) response header.
pub fn has_flexible_response_header(api_key: i16, api_version: i16) -> bool {
    match api_key {
        API_KEY_DESCRIBE_CLUSTER => true,
        API_KEY_CREATE_TOPICS => api_version >= 5,
        API_KEY_DELETE_TOPICS => api_version >= 4,
        API_KEY_DESCRIBE_CONFIGS => api_version >= 4,
        API_KEY_OFFSET_COMMIT => api_version >= 8,
        API_KEY_OFFSET_FETCH => api_version >= 6,
        API_KEY_FETCH => api_version >= 12,
        API_KEY_PRODUCE => api_version >= 9,
        API_KEY_SASL_HANDSHAKE => false,
        API_KEY_SASL_AUTHENTICATE => api_version >= 2,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_names() {
        assert_eq!(api_name(API_KEY_DESCRIBE_CONFIGS), "DescribeConfigs");
        assert_eq!(api_name(API_KEY_SASL_HANDSHAKE), "SaslHandshake");
        assert_eq!(api_name(999), "Unknown");
    }

    #[test]
    fn test_flexible_headers() {
        assert!(has_flexible_response_header(
            API_KEY_DESCRIBE_CLUSTER,
            API_VERSION_DESCRIBE_CLUSTER
        ));
        assert!(!has_flexible_response_header(
            API_KEY_DELETE_TOPICS,
            API_VERSION_DELETE_TOPICS
        ));
        assert!(!has_flexible_response_header(
            API_KEY_OFFSET_COMMIT,
            API_VERSION_OFFSET_COMMIT
        ));
    }
}

//! # FluxGate Protocol Module
//!
//! Wire-level encoding and decoding of the Kafka APIs the gateway speaks to
//! brokers. Every decoder here is *partial*: it accepts an arbitrary window of
//! a byte stream and either yields a complete structure or reports that more
//! bytes are needed, so the network clients can feed it chunks of any size.
//!
//! ## Supported APIs
//!
//! - **API 0**: Produce (v3) with record batch v2
//! - **API 1**: Fetch (v5) with record batch v2
//! - **API 8**: OffsetCommit (v7)
//! - **API 9**: OffsetFetch (v0)
//! - **API 17**: SaslHandshake (v1)
//! - **API 19**: CreateTopics (v3)
//! - **API 20**: DeleteTopics (v3)
//! - **API 32**: DescribeConfigs (v0)
//! - **API 36**: SaslAuthenticate (v1)
//! - **API 60**: DescribeCluster (v0, flexible)

pub mod kafka;

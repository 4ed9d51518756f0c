//! DescribeConfigs (v0) for one topic, repeated until the stream ends.
//!
//! The response is decoded only once it is complete. Each response is
//! compared with the previous one and only configs whose value changed are
//! sent to the application; the next request is scheduled after
//! `min(describe_max_age, max_idle / 2)`.

use bytes::BytesMut;
use std::collections::HashMap;
use tracing::debug;

use super::{complete, read_response, DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::BindingKind;
use crate::frame::{Begin, KafkaBeginEx, KafkaDataEx, KafkaKind, FLAGS_COMPLETE};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    DescribeConfigsRequest, DescribeConfigsResponse, RequestHeader, WireReader,
    API_KEY_DESCRIBE_CONFIGS, API_VERSION_DESCRIBE_CONFIGS, RESOURCE_TYPE_TOPIC,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeStep {
    Response,
}

pub struct DescribeProtocol {
    topic: String,
    config_names: Vec<String>,
    values: HashMap<String, Option<String>>,
    refresh_due: bool,
    refresh_interval_ms: i64,
}

impl DescribeProtocol {
    pub fn new(topic: String, config_names: Vec<String>, config: &GatewayConfig) -> Self {
        Self {
            topic,
            config_names,
            values: HashMap::new(),
            refresh_due: true,
            refresh_interval_ms: config
                .client_describe_max_age_ms
                .min(config.client_max_idle_ms / 2),
        }
    }
}

impl RequestProtocol for DescribeProtocol {
    type Step = DescribeStep;

    const NAME: &'static str = "describe";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::Describe)]
    }

    fn open(config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::Describe { topic, configs } => {
                Some(Self::new(topic.clone(), configs.clone(), config))
            }
            _ => None,
        }
    }

    fn has_request(&self) -> bool {
        self.refresh_due
    }

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32) {
        let request = DescribeConfigsRequest {
            resource_type: RESOURCE_TYPE_TOPIC,
            resource_name: self.topic.clone(),
            config_names: self.config_names.clone(),
        };
        RequestHeader::new(
            API_KEY_DESCRIBE_CONFIGS,
            API_VERSION_DESCRIBE_CONFIGS,
            correlation_id,
        )
        .with_client_id(Some(&config.client_id))
        .encode_with(buf, |buf| request.encode(buf));
        self.refresh_due = false;
    }

    fn first_step(&self) -> DescribeStep {
        DescribeStep::Response
    }

    fn decode(
        &mut self,
        _step: DescribeStep,
        r: &mut WireReader<'_>,
        dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<DescribeStep>> {
        let (_, mut body) =
            read_response(r, API_KEY_DESCRIBE_CONFIGS, API_VERSION_DESCRIBE_CONFIGS)?;
        let response = complete(DescribeConfigsResponse::decode(&mut body))?;

        let Some(resource) = response.resources.into_iter().next() else {
            return Ok(Step::Reject(0));
        };
        if resource.error_code != 0 {
            return Ok(Step::Reject(resource.error_code as i32));
        }
        if resource.resource_name != self.topic {
            debug!(
                "describe response for {} on stream of {}",
                resource.resource_name, self.topic
            );
            return Ok(Step::Reject(0));
        }

        let mut changed = Vec::new();
        for entry in resource.configs {
            if self.values.get(&entry.name) != Some(&entry.value) {
                self.values.insert(entry.name.clone(), entry.value.clone());
                changed.push((entry.name, entry.value));
            }
        }

        effects.push(Effect::AppWindow);
        effects.push(Effect::AppBegin(KafkaBeginEx::Describe {
            topic: self.topic.clone(),
            configs: self.config_names.clone(),
        }));
        if !changed.is_empty() {
            effects.push(Effect::AppData {
                flags: FLAGS_COMPLETE,
                payload: None,
                extension: Some(KafkaDataEx::Describe { configs: changed }),
            });
        }
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NextRequestAt(dcx.now_ms + self.refresh_interval_ms));
        Ok(Step::Idle)
    }

    fn on_refresh(&mut self) {
        self.refresh_due = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{context, decode_all, response};
    use crate::protocol::kafka::{DescribeConfigsEntry, DescribeConfigsResource};

    fn body(topic: &str, error_code: i16, value: &str) -> BytesMut {
        let message = DescribeConfigsResponse {
            throttle_time_ms: 0,
            resources: vec![DescribeConfigsResource {
                error_code,
                error_message: None,
                resource_type: RESOURCE_TYPE_TOPIC,
                resource_name: topic.to_string(),
                configs: vec![DescribeConfigsEntry {
                    name: "retention.ms".to_string(),
                    value: Some(value.to_string()),
                    read_only: false,
                    is_default: false,
                    is_sensitive: false,
                }],
            }],
        };
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        response(0, &buf)
    }

    fn protocol() -> DescribeProtocol {
        let config = GatewayConfig::default()
            .with_describe_max_age_ms(1_000)
            .with_max_idle_ms(60_000);
        DescribeProtocol::new("events".to_string(), vec!["retention.ms".to_string()], &config)
    }

    #[test]
    fn test_partial_response_waits() {
        let mut protocol = protocol();
        let bytes = body("events", 0, "86400000");
        let (step, progress, effects) = decode_all(
            &mut protocol,
            Step::Protocol(DescribeStep::Response),
            &bytes[..bytes.len() - 1],
            &context(0),
        );
        assert_eq!(step, Step::Protocol(DescribeStep::Response));
        assert_eq!(progress, 0);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_only_changes_are_reported() {
        let mut protocol = protocol();
        let bytes = body("events", 0, "86400000");
        let (step, _, effects) = decode_all(
            &mut protocol,
            Step::Protocol(DescribeStep::Response),
            &bytes,
            &context(5_000),
        );
        assert_eq!(step, Step::Idle);
        assert!(effects.contains(&Effect::AppData {
            flags: FLAGS_COMPLETE,
            payload: None,
            extension: Some(KafkaDataEx::Describe {
                configs: vec![("retention.ms".to_string(), Some("86400000".to_string()))],
            }),
        }));
        assert_eq!(effects.last(), Some(&Effect::NextRequestAt(6_000)));

        protocol.on_refresh();
        assert!(protocol.has_request());
        let (_, _, effects) = decode_all(
            &mut protocol,
            Step::Protocol(DescribeStep::Response),
            &bytes,
            &context(6_000),
        );
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::AppData { .. })));
    }

    #[test]
    fn test_error_and_mismatch_reject() {
        let mut protocol = protocol();
        let (step, _, _) = decode_all(
            &mut protocol,
            Step::Protocol(DescribeStep::Response),
            &body("events", 3, "1"),
            &context(0),
        );
        assert_eq!(step, Step::Reject(3));

        let (step, _, _) = decode_all(
            &mut protocol,
            Step::Protocol(DescribeStep::Response),
            &body("other", 0, "1"),
            &context(0),
        );
        assert_eq!(step, Step::Reject(0));
    }
}

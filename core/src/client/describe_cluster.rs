//! DescribeCluster (v0), one request per stream.
//!
//! The only flexible API the gateway speaks: the response header carries
//! tagged fields and the body uses compact strings and arrays.

use bytes::BytesMut;

use super::{complete, read_response, DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::{BindingKind, RequestKind};
use crate::frame::{Begin, KafkaBeginEx, KafkaRequestBeginEx, KafkaResponseBeginEx};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    DescribeClusterRequest, DescribeClusterResponse, RequestHeader, WireReader,
    API_KEY_DESCRIBE_CLUSTER, API_VERSION_DESCRIBE_CLUSTER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeClusterStep {
    Response,
}

pub struct DescribeClusterProtocol {
    request: Option<DescribeClusterRequest>,
}

impl RequestProtocol for DescribeClusterProtocol {
    type Step = DescribeClusterStep;

    const NAME: &'static str = "describe-cluster";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Request(RequestKind::DescribeCluster)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::Request(KafkaRequestBeginEx::DescribeCluster {
                include_authorized_operations,
            }) => Some(Self {
                request: Some(DescribeClusterRequest {
                    include_cluster_authorized_operations: *include_authorized_operations,
                }),
            }),
            _ => None,
        }
    }

    fn opened(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::AppWindow);
    }

    fn has_request(&self) -> bool {
        self.request.is_some()
    }

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32) {
        if let Some(request) = self.request.take() {
            RequestHeader::new(
                API_KEY_DESCRIBE_CLUSTER,
                API_VERSION_DESCRIBE_CLUSTER,
                correlation_id,
            )
            .with_client_id(Some(&config.client_id))
            .encode_with(buf, |buf| request.encode(buf));
        }
    }

    fn first_step(&self) -> DescribeClusterStep {
        DescribeClusterStep::Response
    }

    fn decode(
        &mut self,
        _step: DescribeClusterStep,
        r: &mut WireReader<'_>,
        _dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<DescribeClusterStep>> {
        let (_, mut body) =
            read_response(r, API_KEY_DESCRIBE_CLUSTER, API_VERSION_DESCRIBE_CLUSTER)?;
        let response = complete(DescribeClusterResponse::decode(&mut body))?;
        effects.push(Effect::AppBegin(KafkaBeginEx::Response(
            KafkaResponseBeginEx::DescribeCluster {
                throttle_time_ms: response.throttle_time_ms,
                error_code: response.error_code,
                cluster_id: response.cluster_id,
                controller_id: response.controller_id,
                brokers: response.brokers,
            },
        )));
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NetworkEnd);
        Ok(Step::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{context, decode_all};
    use crate::protocol::kafka::codec::put_empty_tagged_fields;
    use crate::protocol::kafka::ClusterBroker;
    use bytes::BufMut;

    #[test]
    fn test_flexible_response() {
        let brokers = vec![ClusterBroker {
            broker_id: 1,
            host: "kafka-1".to_string(),
            port: 9092,
            rack: None,
        }];
        let mut body = BytesMut::new();
        DescribeClusterResponse {
            throttle_time_ms: 0,
            error_code: 0,
            error_message: None,
            cluster_id: "cluster-a".to_string(),
            controller_id: 1,
            brokers: brokers.clone(),
            cluster_authorized_operations: i32::MIN,
        }
        .encode(&mut body);

        let mut bytes = BytesMut::new();
        bytes.put_i32(body.len() as i32 + 5);
        bytes.put_i32(9);
        put_empty_tagged_fields(&mut bytes);
        bytes.put_slice(&body);

        let mut protocol = DescribeClusterProtocol {
            request: Some(DescribeClusterRequest::default()),
        };
        let (step, progress, effects) = decode_all(
            &mut protocol,
            Step::Protocol(DescribeClusterStep::Response),
            &bytes,
            &context(0),
        );
        assert_eq!(step, Step::Idle);
        assert_eq!(progress, bytes.len());
        assert_eq!(
            effects[0],
            Effect::AppBegin(KafkaBeginEx::Response(KafkaResponseBeginEx::DescribeCluster {
                throttle_time_ms: 0,
                error_code: 0,
                cluster_id: "cluster-a".to_string(),
                controller_id: 1,
                brokers,
            }))
        );
    }
}

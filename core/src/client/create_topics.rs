//! CreateTopics (v3), one request per stream.

use bytes::BytesMut;

use super::{complete, read_response, DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::{BindingKind, RequestKind};
use crate::frame::{Begin, KafkaBeginEx, KafkaRequestBeginEx, KafkaResponseBeginEx};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    CreateTopicsRequest, CreateTopicsResponse, RequestHeader, WireReader, API_KEY_CREATE_TOPICS,
    API_VERSION_CREATE_TOPICS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateTopicsStep {
    Response,
}

pub struct CreateTopicsProtocol {
    request: Option<CreateTopicsRequest>,
}

impl RequestProtocol for CreateTopicsProtocol {
    type Step = CreateTopicsStep;

    const NAME: &'static str = "create-topics";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Request(RequestKind::CreateTopics)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::Request(KafkaRequestBeginEx::CreateTopics {
                topics,
                timeout_ms,
                validate_only,
            }) => Some(Self {
                request: Some(CreateTopicsRequest {
                    topics: topics.clone(),
                    timeout_ms: *timeout_ms,
                    validate_only: *validate_only,
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
            RequestHeader::new(API_KEY_CREATE_TOPICS, API_VERSION_CREATE_TOPICS, correlation_id)
                .with_client_id(Some(&config.client_id))
                .encode_with(buf, |buf| request.encode(buf));
        }
    }

    fn first_step(&self) -> CreateTopicsStep {
        CreateTopicsStep::Response
    }

    fn decode(
        &mut self,
        _step: CreateTopicsStep,
        r: &mut WireReader<'_>,
        _dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<CreateTopicsStep>> {
        let (_, mut body) = read_response(r, API_KEY_CREATE_TOPICS, API_VERSION_CREATE_TOPICS)?;
        let response = complete(CreateTopicsResponse::decode(&mut body))?;
        effects.push(Effect::AppBegin(KafkaBeginEx::Response(
            KafkaResponseBeginEx::CreateTopics {
                throttle_time_ms: response.throttle_time_ms,
                topics: response.topics,
            },
        )));
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NetworkEnd);
        Ok(Step::Idle)
    }
}

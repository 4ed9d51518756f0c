//! DeleteTopics (v3), one request per stream.

use bytes::BytesMut;

use super::{complete, read_response, DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::{BindingKind, RequestKind};
use crate::frame::{Begin, KafkaBeginEx, KafkaRequestBeginEx, KafkaResponseBeginEx};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    DeleteTopicsRequest, DeleteTopicsResponse, RequestHeader, WireReader, API_KEY_DELETE_TOPICS,
    API_VERSION_DELETE_TOPICS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTopicsStep {
    Response,
}

pub struct DeleteTopicsProtocol {
    request: Option<DeleteTopicsRequest>,
}

impl RequestProtocol for DeleteTopicsProtocol {
    type Step = DeleteTopicsStep;

    const NAME: &'static str = "delete-topics";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Request(RequestKind::DeleteTopics)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::Request(KafkaRequestBeginEx::DeleteTopics { names, timeout_ms }) => {
                Some(Self {
                    request: Some(DeleteTopicsRequest {
                        names: names.clone(),
                        timeout_ms: *timeout_ms,
                    }),
                })
            }
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
            RequestHeader::new(API_KEY_DELETE_TOPICS, API_VERSION_DELETE_TOPICS, correlation_id)
                .with_client_id(Some(&config.client_id))
                .encode_with(buf, |buf| request.encode(buf));
        }
    }

    fn first_step(&self) -> DeleteTopicsStep {
        DeleteTopicsStep::Response
    }

    fn decode(
        &mut self,
        _step: DeleteTopicsStep,
        r: &mut WireReader<'_>,
        _dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<DeleteTopicsStep>> {
        let (_, mut body) = read_response(r, API_KEY_DELETE_TOPICS, API_VERSION_DELETE_TOPICS)?;
        let response = complete(DeleteTopicsResponse::decode(&mut body))?;
        effects.push(Effect::AppBegin(KafkaBeginEx::Response(
            KafkaResponseBeginEx::DeleteTopics {
                throttle_time_ms: response.throttle_time_ms,
                topics: response.topics,
            },
        )));
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NetworkEnd);
        Ok(Step::Idle)
    }
}

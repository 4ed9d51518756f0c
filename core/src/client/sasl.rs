//! SASL PLAIN exchange shared by every request client.
//!
//! The handshake response is decoded in four steps (header, error code,
//! mechanism count, each mechanism) so a response split anywhere resumes
//! where it stopped; the authenticate response is small and decoded whole.

use bytes::BytesMut;

use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    RequestHeader, ResponseHeader, SaslAuthenticateRequest, SaslAuthenticateResponse,
    SaslHandshakeRequest, WireReader, API_KEY_SASL_AUTHENTICATE, API_KEY_SASL_HANDSHAKE,
    API_VERSION_SASL_AUTHENTICATE, API_VERSION_SASL_HANDSHAKE,
};

pub const MECHANISM_PLAIN: &str = "PLAIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslStep {
    HandshakeResponse,
    Handshake,
    HandshakeMechanisms { error_code: i16 },
    HandshakeMechanism { error_code: i16, remaining: usize },
    AuthenticateResponse,
    Authenticate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslOutcome {
    Next(SaslStep),
    HandshakeComplete { error_code: i16 },
    AuthenticateComplete { error_code: i16 },
}

pub fn encode_handshake(buf: &mut BytesMut, correlation_id: i32, mechanism: &str) {
    let request = SaslHandshakeRequest {
        mechanism: mechanism.to_string(),
    };
    RequestHeader::new(API_KEY_SASL_HANDSHAKE, API_VERSION_SASL_HANDSHAKE, correlation_id)
        .encode_with(buf, |buf| request.encode(buf));
}

pub fn encode_authenticate(buf: &mut BytesMut, correlation_id: i32, username: &str, password: &str) {
    let request = SaslAuthenticateRequest::plain(username, password);
    RequestHeader::new(
        API_KEY_SASL_AUTHENTICATE,
        API_VERSION_SASL_AUTHENTICATE,
        correlation_id,
    )
    .encode_with(buf, |buf| request.encode(buf));
}

pub fn decode(step: SaslStep, r: &mut WireReader<'_>) -> Result<SaslOutcome> {
    match step {
        SaslStep::HandshakeResponse => {
            ResponseHeader::decode(r)?;
            Ok(SaslOutcome::Next(SaslStep::Handshake))
        }
        SaslStep::Handshake => {
            let error_code = r.i16()?;
            Ok(SaslOutcome::Next(SaslStep::HandshakeMechanisms { error_code }))
        }
        SaslStep::HandshakeMechanisms { error_code } => match r.array_len()? {
            0 => Ok(SaslOutcome::HandshakeComplete { error_code }),
            remaining => Ok(SaslOutcome::Next(SaslStep::HandshakeMechanism {
                error_code,
                remaining,
            })),
        },
        SaslStep::HandshakeMechanism {
            error_code,
            remaining,
        } => {
            r.string()?;
            match remaining - 1 {
                0 => Ok(SaslOutcome::HandshakeComplete { error_code }),
                remaining => Ok(SaslOutcome::Next(SaslStep::HandshakeMechanism {
                    error_code,
                    remaining,
                })),
            }
        }
        SaslStep::AuthenticateResponse => {
            ResponseHeader::decode(r)?;
            Ok(SaslOutcome::Next(SaslStep::Authenticate))
        }
        SaslStep::Authenticate => {
            let response = SaslAuthenticateResponse::decode(r)?;
            Ok(SaslOutcome::AuthenticateComplete {
                error_code: response.error_code,
            })
        }
    }
}

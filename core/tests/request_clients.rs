mod common;

use common::*;
use fluxgate::engine::CLIENT_BINDING;
use fluxgate::frame::{
    reply_id, Begin, BeginEx, Frame, FrameHeader, KafkaBeginEx, KafkaDataEx, KafkaOffset,
    ProxyBeginEx,
};
use fluxgate::protocol::kafka::{
    KafkaErrorCode, API_KEY_DESCRIBE_CONFIGS, API_KEY_OFFSET_FETCH, API_KEY_SASL_AUTHENTICATE,
    API_KEY_SASL_HANDSHAKE,
};
use fluxgate::GatewayConfig;

fn direct_config() -> GatewayConfig {
    GatewayConfig::default()
        .with_connection_pool(false)
        .with_describe_max_age_ms(1_000)
}

fn describe_data(frames: &[Frame]) -> Vec<KafkaDataEx> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => data.extension.clone(),
            _ => None,
        })
        .collect()
}

fn retention(value: &str) -> KafkaDataEx {
    KafkaDataEx::Describe {
        configs: vec![("retention.ms".to_string(), Some(value.to_string()))],
    }
}

#[test]
fn test_describe_response_in_three_chunks() {
    let mut harness = Harness::new(direct_config());
    harness.send(describe_begin(7, "events"));

    let begins = harness.take_network_begins();
    assert_eq!(begins.len(), 1);
    assert_eq!(begins[0].1, ProxyBeginEx::new("localhost", 9092));
    let mut broker = BrokerPeer::new(begins[0].0);
    broker.accept(&mut harness, 64 * 1024);

    let requests = broker.requests(&mut harness);
    assert_eq!(requests.len(), 1);
    assert_eq!(api_key(&requests[0]), API_KEY_DESCRIBE_CONFIGS);
    assert_eq!(describe_topic(&requests[0]), "events");

    let bytes = response(correlation_id(&requests[0]), &describe_body("events", "86400000"));
    broker.reply_chunks(&mut harness, &bytes, &[3, 11]);

    let app = harness.take_stream(7);
    let app_begins = app
        .iter()
        .filter(|frame| matches!(frame, Frame::Begin(begin) if begin.header.stream_id == reply_id(7)))
        .count();
    assert_eq!(app_begins, 1);
    assert_eq!(describe_data(&app), vec![retention("86400000")]);
    assert_eq!(harness.engine.next_deadline(), Some(START_MS + 1_000));
}

#[test]
fn test_describe_refresh_reports_only_changes() {
    let mut harness = Harness::new(direct_config());
    harness.send(describe_begin(7, "events"));
    let (network_id, _) = harness.take_network_begins()[0].clone();
    let mut broker = BrokerPeer::new(network_id);
    broker.accept(&mut harness, 64 * 1024);

    let request = broker.requests(&mut harness).remove(0);
    broker.reply(
        &mut harness,
        &response(correlation_id(&request), &describe_body("events", "1000")),
    );
    harness.take_stream(7);

    harness.advance(1_000);
    let request = broker.requests(&mut harness).remove(0);
    assert_eq!(correlation_id(&request), 1);
    broker.reply(
        &mut harness,
        &response(correlation_id(&request), &describe_body("events", "1000")),
    );
    assert!(describe_data(&harness.take_stream(7)).is_empty());

    harness.advance(1_000);
    let request = broker.requests(&mut harness).remove(0);
    broker.reply(
        &mut harness,
        &response(correlation_id(&request), &describe_body("events", "2000")),
    );
    assert_eq!(describe_data(&harness.take_stream(7)), vec![retention("2000")]);
}

#[test]
fn test_sasl_precedes_request() {
    let config = direct_config().with_sasl_plain("alice", "secret");
    let mut harness = Harness::new(config);
    harness.send(describe_begin(7, "events"));
    let (network_id, _) = harness.take_network_begins()[0].clone();
    let mut broker = BrokerPeer::new(network_id);
    broker.accept(&mut harness, 64 * 1024);

    let handshake = broker.requests(&mut harness).remove(0);
    assert_eq!(api_key(&handshake), API_KEY_SASL_HANDSHAKE);
    broker.reply(
        &mut harness,
        &response(correlation_id(&handshake), &sasl_handshake_body(0, &["PLAIN"])),
    );

    let authenticate = broker.requests(&mut harness).remove(0);
    assert_eq!(api_key(&authenticate), API_KEY_SASL_AUTHENTICATE);
    // \0alice\0secret travels as the auth bytes
    assert!(authenticate.windows(13).any(|w| w == b"\0alice\0secret"));
    broker.reply(
        &mut harness,
        &response(correlation_id(&authenticate), &sasl_authenticate_body(0)),
    );

    let describe = broker.requests(&mut harness).remove(0);
    assert_eq!(api_key(&describe), API_KEY_DESCRIBE_CONFIGS);
    broker.reply(
        &mut harness,
        &response(correlation_id(&describe), &describe_body("events", "5")),
    );
    assert_eq!(describe_data(&harness.take_stream(7)), vec![retention("5")]);
}

#[test]
fn test_sasl_authenticate_failure_resets_application() {
    let config = direct_config().with_sasl_plain("alice", "wrong");
    let mut harness = Harness::new(config);
    harness.send(describe_begin(7, "events"));
    let (network_id, _) = harness.take_network_begins()[0].clone();
    let mut broker = BrokerPeer::new(network_id);
    broker.accept(&mut harness, 64 * 1024);

    let handshake = broker.requests(&mut harness).remove(0);
    broker.reply(
        &mut harness,
        &response(correlation_id(&handshake), &sasl_handshake_body(0, &["PLAIN"])),
    );
    let authenticate = broker.requests(&mut harness).remove(0);
    broker.reply(
        &mut harness,
        &response(correlation_id(&authenticate), &sasl_authenticate_body(1)),
    );

    let app = harness.take_stream(7);
    assert!(app.iter().any(|frame| matches!(frame,
        Frame::Reset(reset) if reset.header.stream_id == 7
            && reset.error() == KafkaErrorCode::SaslAuthenticationFailed.as_i32())));
    let network = harness.take_stream(network_id);
    assert!(network
        .iter()
        .any(|frame| matches!(frame, Frame::End(end) if end.header.stream_id == network_id)));
    assert!(broker.requests(&mut harness).is_empty());
}

#[test]
fn test_describe_requests_share_pooled_connection() {
    let config = GatewayConfig::default().with_describe_max_age_ms(1_000);
    let mut harness = Harness::new(config);
    harness.send(describe_begin(7, "events"));
    harness.send(describe_begin(9, "orders"));

    let begins = harness.take_network_begins();
    assert_eq!(begins.len(), 1);
    let mut broker = BrokerPeer::new(begins[0].0);
    broker.accept(&mut harness, 64 * 1024);

    let requests = broker.requests(&mut harness);
    assert_eq!(requests.len(), 2);
    assert_ne!(correlation_id(&requests[0]), correlation_id(&requests[1]));

    let mut bytes = Vec::new();
    for request in &requests {
        let topic = describe_topic(request);
        let value = if topic == "events" { "111" } else { "222" };
        bytes.extend_from_slice(&response(correlation_id(request), &describe_body(&topic, value)));
    }
    let middle = bytes.len() / 2;
    broker.reply_chunks(&mut harness, &bytes, &[7, middle, middle + 3]);

    assert_eq!(describe_data(&harness.take_stream(7)), vec![retention("111")]);
    assert_eq!(describe_data(&harness.take_stream(9)), vec![retention("222")]);
}

#[test]
fn test_offset_fetch_skips_unknown_partitions() {
    let mut harness = Harness::new(direct_config());
    harness.send(Frame::Begin(Begin {
        header: FrameHeader::new(0, CLIENT_BINDING, 11),
        affinity: 0,
        extension: BeginEx::Kafka(KafkaBeginEx::OffsetFetch {
            group_id: "billing".to_string(),
            topic: "events".to_string(),
            partitions: vec![0, 1, 2],
        }),
    }));

    let app = harness.take_stream(11);
    assert!(app
        .iter()
        .any(|frame| matches!(frame, Frame::Begin(begin) if begin.header.stream_id == reply_id(11))));

    let (network_id, _) = harness.take_network_begins()[0].clone();
    let mut broker = BrokerPeer::new(network_id);
    broker.accept(&mut harness, 64 * 1024);
    let request = broker.requests(&mut harness).remove(0);
    assert_eq!(api_key(&request), API_KEY_OFFSET_FETCH);

    let unknown = KafkaErrorCode::UnknownTopicOrPartition.as_i16();
    broker.reply_chunks(
        &mut harness,
        &response(
            correlation_id(&request),
            &offset_fetch_body("events", &[(0, 42, 0), (1, -1, unknown), (2, 7, 0)]),
        ),
        &[9, 20, 33],
    );

    assert_eq!(
        describe_data(&harness.take_stream(11)),
        vec![KafkaDataEx::OffsetFetch {
            partitions: vec![KafkaOffset::new(0, 42), KafkaOffset::new(2, 7)],
        }]
    );
}

#[test]
fn test_unrouted_request_is_reset() {
    let mut harness = Harness::new(direct_config());
    harness.send(Frame::Begin(Begin {
        header: FrameHeader::new(0, 42, 13),
        affinity: 0,
        extension: BeginEx::None,
    }));
    let app = harness.take_stream(13);
    assert!(matches!(app.as_slice(), [Frame::Reset(reset)] if reset.header.stream_id == 13));
    assert_eq!(harness.engine.stream_count(), 0);
}

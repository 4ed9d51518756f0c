//! Responses split at arbitrary points must decode exactly like whole ones.

mod common;

use common::*;
use fluxgate::engine::CLIENT_BINDING;
use fluxgate::frame::{Begin, BeginEx, Frame, FrameHeader, KafkaBeginEx};
use fluxgate::GatewayConfig;
use proptest::prelude::*;

fn sasl_describe(cuts: [&[usize]; 3]) -> Vec<Frame> {
    let config = GatewayConfig::default()
        .with_connection_pool(false)
        .with_sasl_plain("alice", "secret");
    let mut harness = Harness::new(config);
    harness.send(describe_begin(7, "events"));
    let (network_id, _) = harness.take_network_begins()[0].clone();
    let mut broker = BrokerPeer::new(network_id);
    broker.accept(&mut harness, 64 * 1024);

    let mut app = Vec::new();
    let bodies = [
        sasl_handshake_body(0, &["PLAIN"]),
        sasl_authenticate_body(0),
        describe_body("events", "604800000"),
    ];
    for (body, cuts) in bodies.iter().zip(cuts) {
        let requests = broker.requests(&mut harness);
        assert_eq!(requests.len(), 1);
        broker.reply_chunks(&mut harness, &response(correlation_id(&requests[0]), body), cuts);
        app.extend(harness.take_stream(7));
    }
    app
}

fn offset_fetch(cuts: &[usize]) -> Vec<Frame> {
    let config = GatewayConfig::default().with_connection_pool(false);
    let mut harness = Harness::new(config);
    harness.send(Frame::Begin(Begin {
        header: FrameHeader::new(0, CLIENT_BINDING, 9),
        affinity: 0,
        extension: BeginEx::Kafka(KafkaBeginEx::OffsetFetch {
            group_id: "billing".to_string(),
            topic: "events".to_string(),
            partitions: vec![0, 1, 2, 3],
        }),
    }));
    let (network_id, _) = harness.take_network_begins()[0].clone();
    let mut broker = BrokerPeer::new(network_id);
    broker.accept(&mut harness, 64 * 1024);

    let request = broker.requests(&mut harness).remove(0);
    let body = offset_fetch_body(
        "events",
        &[(0, 10, 0), (1, -1, 3), (2, 30, 0), (3, -1, 29)],
    );
    broker.reply_chunks(&mut harness, &response(correlation_id(&request), &body), cuts);
    harness.take_stream(9)
}

fn cut_points() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..160, 0..6).prop_map(|mut cuts| {
        cuts.sort_unstable();
        cuts
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sasl_describe_independent_of_fragmentation(
        handshake in cut_points(),
        authenticate in cut_points(),
        describe in cut_points(),
    ) {
        let none: &[usize] = &[];
        let whole = sasl_describe([none, none, none]);
        let split = sasl_describe([
            handshake.as_slice(),
            authenticate.as_slice(),
            describe.as_slice(),
        ]);
        prop_assert_eq!(split, whole);
    }

    #[test]
    fn prop_offset_fetch_independent_of_fragmentation(cuts in cut_points()) {
        prop_assert_eq!(offset_fetch(&cuts), offset_fetch(&[]));
    }
}

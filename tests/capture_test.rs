//! End-to-end capture scenarios over mock transports with a live control
//! socket.

use bytes::Bytes;
use std::time::Duration;
use tokio::net::UdpSocket;
use trigger_dump::app::Observation;
use trigger_dump::config::{Settings, UNIT_BYTES};
use trigger_dump::transport::mock::{MockSink, MockSource};

const BLOCK: u64 = UNIT_BYTES * 4;

/// Settings addressing commands in absolute sequence units (scale 1) on an
/// ephemeral control port.
fn test_settings() -> Settings {
    let text = format!(
        r#"
        [application]
        log_level = "warn"

        [control]
        listen_address = "127.0.0.1"
        listen_port = 0
        scale = 1

        [capture]
        block_size = {BLOCK}
        fill_threshold = 0.7

        [transport]
        input_path = "/tmp/unused_in.ring"
        output_path = "/tmp/unused_out.ring"
        input_blocks = 4
        output_blocks = 4
        "#
    );
    let settings: Settings = toml::from_str(&text).expect("test settings parse");
    settings.validate().expect("test settings valid");
    settings
}

fn stream(n: usize) -> Vec<Bytes> {
    (0..n)
        .map(|i| Bytes::from(vec![i as u8; BLOCK as usize]))
        .collect()
}

#[tokio::test]
async fn dump_command_captures_the_two_covering_blocks() {
    let settings = test_settings();
    let blocks = stream(10);
    let source = MockSource::new("OBS HDR", blocks.clone())
        .with_acquire_delay(Duration::from_millis(50));
    let (sink, handle) = MockSink::new();

    let observation = Observation::prepare(&settings, source, sink)
        .await
        .expect("prepare");
    let addr = observation.control_addr().expect("control addr");
    let run = tokio::spawn(observation.run());

    // Position 9 lies inside block 2 (units 8..12). Sent immediately, the
    // command lands well before block 2 is consumed.
    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
    client.send_to(b"9", addr).await.expect("send dump");

    let outcome = run.await.expect("join").expect("observation");

    assert_eq!(outcome.dumps, 1);
    assert_eq!(outcome.triggers, 1);
    assert_eq!(outcome.blocks_drained, 11);

    let captured = handle.blocks();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0], blocks[2]);
    assert_eq!(captured[1], blocks[3]);
    assert_eq!(&handle.header().expect("header written")[..], b"OBS HDR");
}

#[tokio::test]
async fn second_dump_while_pending_is_rejected() {
    let settings = test_settings();
    let blocks = stream(10);
    let source = MockSource::new("OBS HDR", blocks.clone())
        .with_acquire_delay(Duration::from_millis(50));
    let (sink, handle) = MockSink::new();

    let observation = Observation::prepare(&settings, source, sink)
        .await
        .expect("prepare");
    let addr = observation.control_addr().expect("control addr");
    let state = observation.state();
    let run = tokio::spawn(observation.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
    client.send_to(b"9", addr).await.expect("send first dump");
    // Wait until the first command is armed so the second is a definite
    // reject rather than a race.
    while !state.pending() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.send_to(b"17", addr).await.expect("send second dump");

    let outcome = run.await.expect("join").expect("observation");

    // The rejected command counts as a trigger but produces no dump and
    // does not move the armed target.
    assert_eq!(outcome.triggers, 2);
    assert_eq!(outcome.dumps, 1);
    let captured = handle.blocks();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0], blocks[2]);
    assert_eq!(captured[1], blocks[3]);
}

#[tokio::test]
async fn advisory_and_malformed_commands_leave_the_stream_alone() {
    let settings = test_settings();
    let source =
        MockSource::new("OBS HDR", stream(4)).with_acquire_delay(Duration::from_millis(50));
    let (sink, handle) = MockSink::new();

    let observation = Observation::prepare(&settings, source, sink)
        .await
        .expect("prepare");
    let addr = observation.control_addr().expect("control addr");
    let run = tokio::spawn(observation.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
    client.send_to(b"p 7", addr).await.expect("send advisory");
    client.send_to(b"not a number", addr).await.expect("send junk");

    let outcome = run.await.expect("join").expect("observation");

    assert_eq!(outcome.advisory, 7);
    assert_eq!(outcome.triggers, 2);
    assert_eq!(outcome.dumps, 0);
    assert!(handle.blocks().is_empty());
}

#[tokio::test]
async fn short_final_block_ends_the_observation() {
    let settings = test_settings();
    let mut blocks = stream(3);
    blocks.push(Bytes::from(vec![0xEE; 512]));
    let source = MockSource::new("OBS HDR", blocks);
    let (sink, handle) = MockSink::new();

    let observation = Observation::prepare(&settings, source, sink)
        .await
        .expect("prepare");
    let outcome = observation.run().await.expect("observation");

    assert_eq!(outcome.blocks_drained, 4);
    assert_eq!(outcome.dumps, 0);
    assert!(handle.blocks().is_empty());
}

#[tokio::test]
async fn short_output_write_aborts_the_observation() {
    let settings = test_settings();
    let source =
        MockSource::new("OBS HDR", stream(6)).with_acquire_delay(Duration::from_millis(50));
    let (sink, _handle) = MockSink::new();
    let sink = sink.short_write_at(0);

    let observation = Observation::prepare(&settings, source, sink)
        .await
        .expect("prepare");
    let addr = observation.control_addr().expect("control addr");
    let run = tokio::spawn(observation.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
    client.send_to(b"9", addr).await.expect("send dump");

    // The first forwarded block hits the truncating sink.
    let result = run.await.expect("join");
    assert!(result.is_err());
}

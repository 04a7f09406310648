//! Integration tests for the HTTP proxy transport
//!
//! Runs the transport against a wiremock proxy and checks what it reports:
//! - baseline fetch on connect and diffing of later polls
//! - offline/online reporting when the proxy goes away and comes back
//! - publish request body
//! - request cache for manual refreshes
//! - follow-up poll owed to ticks missed during a slow request
//! - shutdown


use gatelink::clock::TokioClock;
use gatelink::error::GateError;
use gatelink::protocol::{Command, CommandKind, ConnectionQuality, GateState, TransportKind};
use gatelink::resilience::CircuitBreakerConfig;
use gatelink::transport::{
    EventReceiver, HttpProxyTransport, Transport, TransportEvent, TransportId,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn connect(
    server: &MockServer,
    tweak: impl FnOnce(&mut gatelink::config::GateConfig),
) -> Result<(HttpProxyTransport, EventReceiver), GateError> {
    let mut config = proxy_config(&server.uri());
    tweak(&mut config);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = HttpProxyTransport::connect(
        TransportId::next(),
        &config.proxy,
        config.mqtt.topics(),
        events_tx,
        CircuitBreakerConfig::from(&config.resilience),
        Arc::new(TokioClock),
    )
    .await?;
    Ok((transport, events_rx))
}

/// Drain events until one matches, failing after two seconds
async fn wait_for_event(
    rx: &mut EventReceiver,
    mut predicate: impl FnMut(&TransportEvent) -> bool,
) -> TransportEvent {
    loop {
        let event = next_event(rx).await;
        if predicate(&event) {
            return event;
        }
    }
}

async fn request_count(server: &MockServer, method_name: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == method_name)
        .count()
}

fn message(topic: &str, payload: &str) -> TransportEvent {
    TransportEvent::Message {
        topic: topic.to_string(),
        payload: payload.to_string(),
    }
}

#[tokio::test]
async fn test_connect_reports_baseline_payloads() {
    let server = MockServer::start().await;
    mount_status(
        &server,
        status_body(
            true,
            &[(GATE_TOPIC, "P2"), (GARAGE_TOPIC, "P1"), (LOG_TOPIC, "Anna")],
        ),
    )
    .await;

    let (transport, mut events) = connect(&server, |_| {}).await.unwrap();

    assert_eq!(transport.kind(), TransportKind::HttpProxy);
    assert!(transport.is_alive());
    assert_eq!(next_event(&mut events).await, TransportEvent::Online);
    assert_eq!(next_event(&mut events).await, message(GATE_TOPIC, "P2"));
    assert_eq!(next_event(&mut events).await, message(GARAGE_TOPIC, "P1"));
    assert_eq!(next_event(&mut events).await, message(LOG_TOPIC, "Anna"));
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Quality(ConnectionQuality::Excellent)
    );

    transport.shutdown().await;
}

#[tokio::test]
async fn test_later_polls_report_only_changes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(status_body(true, &[(GATE_TOPIC, "P1"), (GARAGE_TOPIC, "P1")])),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_status(
        &server,
        status_body(true, &[(GATE_TOPIC, "P3"), (GARAGE_TOPIC, "P1")]),
    )
    .await;

    let (transport, mut events) = connect(&server, |_| {}).await.unwrap();

    let change = wait_for_event(&mut events, |e| *e == message(GATE_TOPIC, "P3")).await;
    assert_eq!(change, message(GATE_TOPIC, "P3"));

    // Identical snapshots produce nothing further
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(envelope) = events.try_recv() {
        assert!(
            !matches!(envelope.event, TransportEvent::Message { .. }),
            "unexpected event {:?}",
            envelope.event
        );
    }

    transport.shutdown().await;
}

#[tokio::test]
async fn test_broker_disconnect_reported_by_proxy() {
    let server = MockServer::start().await;
    mount_status(&server, status_body(false, &[])).await;

    let (transport, mut events) = connect(&server, |_| {}).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Offline { .. }
    ));
    assert!(!transport.is_alive());
    transport.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_proxy_goes_offline_then_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body(true, &[])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body(true, &[])))
        .with_priority(3)
        .mount(&server)
        .await;

    let (transport, mut events) = connect(&server, |_| {}).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Online);

    wait_for_event(&mut events, |e| matches!(e, TransportEvent::Offline { .. })).await;
    assert!(!transport.is_alive());

    wait_for_event(&mut events, |e| *e == TransportEvent::Online).await;
    assert!(transport.is_alive());

    let stats = transport.stats();
    assert!(stats.failed_requests >= 2);
    transport.shutdown().await;
}

#[tokio::test]
async fn test_connect_fails_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(ResponseTemplate::new(500).set_body_string("broker bridge down"))
        .mount(&server)
        .await;

    let err = connect(&server, |_| {}).await.unwrap_err();
    assert!(matches!(err, GateError::Http { status: 500, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_slow_proxy_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(status_body(true, &[]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = connect(&server, |_| {}).await.unwrap_err();
    assert!(matches!(err, GateError::RequestTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_publish_posts_command_body() {
    let server = MockServer::start().await;
    mount_status(&server, status_body(true, &[])).await;
    Mock::given(method("POST"))
        .and(path("/mqtt-publish"))
        .and(body_partial_json(serde_json::json!({
            "topic": "gate/command",
            "message": "1",
            "user": "ID:Anna",
            "action": "Brána",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (transport, _events) = connect(&server, |_| {}).await.unwrap();
    transport
        .publish_command(&Command::new(CommandKind::Toggle, "Anna"))
        .await
        .unwrap();

    assert!(transport.stats().successful_requests >= 2);
    transport.shutdown().await;
}

#[tokio::test]
async fn test_rejected_publish_is_an_error() {
    let server = MockServer::start().await;
    mount_status(&server, status_body(true, &[])).await;
    Mock::given(method("POST"))
        .and(path("/mqtt-publish"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let (transport, _events) = connect(&server, |_| {}).await.unwrap();
    let err = transport
        .publish_command(&Command::new(CommandKind::Stop, "Anna"))
        .await
        .unwrap_err();

    assert!(matches!(err, GateError::Http { status: 403, .. }));
    assert!(!err.is_retryable());
    transport.shutdown().await;
}

#[tokio::test]
async fn test_manual_refresh_uses_cache() {
    let server = MockServer::start().await;
    mount_status(&server, status_body(true, &[(GATE_TOPIC, "P1")])).await;

    let (transport, _events) = connect(&server, |config| {
        config.proxy.foreground_interval_ms = 10_000;
    })
    .await
    .unwrap();
    assert_eq!(request_count(&server, "GET").await, 1);

    transport.request_refresh();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(request_count(&server, "GET").await, 1);

    transport.shutdown().await;
}

#[tokio::test]
async fn test_slow_poll_is_followed_up_quickly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body(true, &[])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    // Outlasts two regular ticks
    Mock::given(method("GET"))
        .and(path("/mqtt-status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(status_body(true, &[(GATE_TOPIC, "P3")]))
                .set_delay(Duration::from_millis(1_000)),
        )
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&server)
        .await;
    mount_status(&server, status_body(true, &[(GATE_TOPIC, "P3")])).await;

    let (transport, mut events) = connect(&server, |config| {
        config.proxy.foreground_interval_ms = 400;
        config.proxy.request_timeout_ms = 3_000;
    })
    .await
    .unwrap();

    let slow_done = tokio::time::timeout(
        Duration::from_secs(4),
        wait_for_event(&mut events, |e| *e == message(GATE_TOPIC, "P3")),
    )
    .await;
    assert!(slow_done.is_ok(), "slow poll never completed");
    assert_eq!(request_count(&server, "GET").await, 2);

    // The owed follow-up runs well before another full interval
    let followed_up = tokio::time::timeout(Duration::from_millis(250), async {
        while request_count(&server, "GET").await < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(followed_up.is_ok(), "no follow-up poll after the slow one");

    transport.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_polling() {
    let server = MockServer::start().await;
    mount_status(&server, status_body(true, &[])).await;

    let (transport, _events) = connect(&server, |_| {}).await.unwrap();
    transport.shutdown().await;
    assert!(!transport.is_alive());

    let after_shutdown = request_count(&server, "GET").await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(request_count(&server, "GET").await, after_shutdown);

    let err = transport
        .publish_command(&Command::new(CommandKind::Toggle, "Anna"))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::NotConnected));
}

#[tokio::test]
async fn test_client_over_proxy_end_to_end() {
    let server = MockServer::start().await;
    mount_status(
        &server,
        status_body(true, &[(GATE_TOPIC, "P2"), (GARAGE_TOPIC, "P1")]),
    )
    .await;
    mount_publish(&server).await;

    let config = proxy_config(&server.uri());
    let client = gatelink::MessagingClient::new(&config);
    client.connect().await.unwrap();

    let status = client.get_status();
    assert!(status.connected);
    assert_eq!(status.transport, TransportKind::HttpProxy);

    assert!(
        wait_until(Duration::from_secs(2), || {
            client.get_status().gate_state == GateState::Open
        })
        .await
    );

    client
        .publish_command(CommandKind::Toggle, "Anna")
        .await
        .unwrap();
    assert_eq!(request_count(&server, "POST").await, 1);
    assert_eq!(client.get_metrics().messages_sent, 1);

    client.disconnect().await;
    assert!(!client.get_status().connected);
}

//! Endpoint rotation, backoff and recovery after link failures

use std::sync::Arc;
use std::time::Duration;

use feedmux_harness::{
    dispatch_until, init_tracing, EndpointBehavior, MockConnector, RecordingCallbacks,
};
use feedmux_runtime::{
    ChannelEventType, ChannelQueue, ConnectOptions, ConnectionInfo, Endpoint, ErrorCode,
    ReactorBuilder, ReactorConfig, ReconnectConfig,
};
use tokio::time::Instant;

fn create_test_reactor() -> (feedmux_runtime::Reactor, Arc<MockConnector>) {
    init_tracing();
    let connector = Arc::new(MockConnector::new());
    let reactor = ReactorBuilder::new(ReactorConfig::testing())
        .with_connector(connector.clone())
        .build()
        .unwrap();
    (reactor, connector)
}

fn two_endpoints(reconnect: ReconnectConfig) -> ConnectOptions {
    ConnectOptions::new(vec![
        ConnectionInfo::new(Endpoint::new("feed-a", 14002)),
        ConnectionInfo::new(Endpoint::new("feed-b", 14002)),
    ])
    .with_reconnect(reconnect)
}

fn assert_near(actual: Duration, expected: Duration) {
    let slack = Duration::from_millis(100);
    assert!(
        actual >= expected && actual <= expected + slack,
        "expected about {:?}, got {:?}",
        expected,
        actual
    );
}

#[tokio::test(start_paused = true)]
async fn test_refused_endpoints_rotate_with_backoff_until_limit() {
    let (reactor, connector) = create_test_reactor();
    connector.set_default_behavior(EndpointBehavior::Refuse);
    let callbacks = Arc::new(RecordingCallbacks::new());

    let reconnect = ReconnectConfig {
        min_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_factor: 2.0,
        attempt_limit: Some(3),
    };
    let started = Instant::now();
    let channel = reactor.connect(two_endpoints(reconnect), callbacks.clone()).unwrap();

    assert!(
        dispatch_until(&reactor, 1000, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelDown)
        })
        .await
    );

    let attempts = connector.attempts();
    let hosts: Vec<&str> = attempts
        .iter()
        .map(|attempt| attempt.endpoint.host.as_str())
        .collect();
    assert_eq!(hosts, vec!["feed-a", "feed-b", "feed-a"]);
    assert_near(attempts[0].at - started, Duration::ZERO);
    assert_near(attempts[1].at - started, Duration::from_secs(1));
    assert_near(attempts[2].at - started, Duration::from_secs(3));

    let events = callbacks.channel_events(channel);
    let kinds: Vec<ChannelEventType> = events.iter().map(|event| event.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            ChannelEventType::ChannelDownReconnecting,
            ChannelEventType::ChannelDownReconnecting,
            ChannelEventType::ChannelDown,
        ]
    );
    assert!(events.iter().all(|event| event.is_connect_failure));
    assert_eq!(
        events[2].error.as_ref().map(|error| error.code),
        Some(ErrorCode::Transport)
    );
    assert_eq!(reactor.channel_info(channel).unwrap().queue, ChannelQueue::Inactive);

    // Nothing further is attempted after giving up
    dispatch_until(&reactor, 300, || false).await;
    assert_eq!(connector.attempts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_endpoint_used_after_refusal() {
    let (reactor, connector) = create_test_reactor();
    connector.set_behavior(Endpoint::new("feed-a", 14002), EndpointBehavior::Refuse);
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(two_endpoints(ReconnectConfig::testing()), callbacks.clone())
        .unwrap();
    assert!(
        dispatch_until(&reactor, 200, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    assert_eq!(
        callbacks.event_kinds(channel),
        vec![
            ChannelEventType::ChannelDownReconnecting,
            ChannelEventType::ChannelUp,
            ChannelEventType::ChannelReady,
        ]
    );
    assert_eq!(reactor.channel_info(channel).unwrap().connection_index, 1);
    assert_eq!(connector.last_peer().unwrap().endpoint().host, "feed-b");
}

#[tokio::test(start_paused = true)]
async fn test_ready_channel_recovers_from_read_failure() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(two_endpoints(ReconnectConfig::testing()), callbacks.clone())
        .unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    let first = connector.last_peer().unwrap();
    first.fail_reads("connection reset");
    assert!(
        dispatch_until(&reactor, 200, || {
            callbacks.count_events(channel, &ChannelEventType::ChannelReady) == 2
        })
        .await
    );

    let events = callbacks.channel_events(channel);
    let down = events
        .iter()
        .find(|event| event.kind == ChannelEventType::ChannelDownReconnecting)
        .unwrap();
    assert!(!down.is_connect_failure);
    assert!(down.error.as_ref().unwrap().text.contains("connection reset"));

    assert!(first.is_closed());
    let peers = connector.peers();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[1].endpoint().host, "feed-b");
    assert!(!peers[1].is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_fails_ping_timeout() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let options = two_endpoints(ReconnectConfig::testing()).with_ping_timeout(Duration::from_secs(3));
    let channel = reactor.connect(options, callbacks.clone()).unwrap();
    assert!(
        dispatch_until(&reactor, 1000, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelDownReconnecting)
        })
        .await
    );

    let down = callbacks
        .channel_events(channel)
        .into_iter()
        .find(|event| event.kind == ChannelEventType::ChannelDownReconnecting)
        .unwrap();
    assert_eq!(down.error.unwrap().code, ErrorCode::PingTimeout);
    assert!(!down.is_connect_failure);
    assert!(connector.peers()[0].pings() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_link_initialization_times_out() {
    let (reactor, connector) = create_test_reactor();
    connector.set_default_behavior(EndpointBehavior::Accept { init_steps: u32::MAX });
    let callbacks = Arc::new(RecordingCallbacks::new());

    let connection = ConnectionInfo::new(Endpoint::new("feed-a", 14002))
        .with_initialization_timeout(Duration::from_secs(1));
    let options = ConnectOptions::new(vec![connection]).with_reconnect(ReconnectConfig {
        attempt_limit: Some(1),
        ..ReconnectConfig::default()
    });
    let channel = reactor.connect(options, callbacks.clone()).unwrap();
    assert!(
        dispatch_until(&reactor, 500, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelDown)
        })
        .await
    );

    let down = callbacks.channel_events(channel).pop().unwrap();
    assert_eq!(down.error.unwrap().code, ErrorCode::InitializationTimeout);
    assert!(!callbacks.has_event(channel, &ChannelEventType::ChannelUp));
}

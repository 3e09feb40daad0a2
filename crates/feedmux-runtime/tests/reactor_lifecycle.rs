//! Channel lifecycle through the public reactor API: connect, setup,
//! message delivery, close and shutdown

use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedmux_core::codec::LoginResponse;
use feedmux_harness::{
    dispatch_until, init_tracing, EndpointBehavior, MockConnector, RecordingCallbacks,
    SetupResponder,
};
use feedmux_runtime::{
    ChannelEventType, ChannelQueue, ChannelSetupState, ConnectOptions, ConnectionInfo,
    DispatchOptions, Endpoint, ErrorCode, LoginConfig, Message, ReactorBuilder, ReactorConfig,
    ReactorError, ReactorState, ReconnectConfig, SetupPlan, StatisticsFlags,
};
use tokio_test::assert_ok;

fn create_test_reactor() -> (feedmux_runtime::Reactor, Arc<MockConnector>) {
    init_tracing();
    let connector = Arc::new(MockConnector::new());
    let reactor = ReactorBuilder::new(ReactorConfig::testing())
        .with_connector(connector.clone())
        .build()
        .unwrap();
    (reactor, connector)
}

fn full_setup(endpoint: &str) -> ConnectOptions {
    ConnectOptions::single(Endpoint::new(endpoint, 14002))
        .with_setup(SetupPlan::full(LoginConfig::default()))
}

/// One attempt only, so setup failures end in a terminal down event
fn single_attempt() -> ReconnectConfig {
    ReconnectConfig {
        attempt_limit: Some(1),
        ..ReconnectConfig::default()
    }
}

// ----------------------------------------------------------------------------
// Setup
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_channel_walks_setup_to_ready() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor.connect(full_setup("feed-a"), callbacks.clone()).unwrap();
    assert_eq!(reactor.channel_info(channel).unwrap().queue, ChannelQueue::Initializing);

    let ready = dispatch_until(&reactor, 100, || {
        callbacks.has_event(channel, &ChannelEventType::ChannelReady)
    })
    .await;
    assert!(ready);

    assert_eq!(
        callbacks.event_kinds(channel),
        vec![
            ChannelEventType::ChannelUp,
            ChannelEventType::SetupStateChanged(ChannelSetupState::LoggedIn),
            ChannelEventType::SetupStateChanged(ChannelSetupState::HaveDirectory),
            ChannelEventType::SetupStateChanged(ChannelSetupState::HaveSchemaPart1),
            ChannelEventType::SetupStateChanged(ChannelSetupState::HaveSchemaPart2),
            ChannelEventType::ChannelReady,
        ]
    );

    let info = reactor.channel_info(channel).unwrap();
    assert_eq!(info.queue, ChannelQueue::Active);
    assert_eq!(info.setup_state, ChannelSetupState::Ready);

    let peer = connector.last_peer().unwrap();
    let kinds: Vec<&str> = peer.written().iter().map(Message::kind).collect();
    assert_eq!(
        kinds,
        vec!["login request", "directory request", "schema request", "schema request"]
    );
    // Handshake messages never reach the application
    assert!(callbacks.messages(channel).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_channel_without_setup_is_ready_on_link_up() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks.clone())
        .unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    assert_eq!(
        callbacks.event_kinds(channel),
        vec![ChannelEventType::ChannelUp, ChannelEventType::ChannelReady]
    );
    assert!(connector.last_peer().unwrap().written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_fails_channel() {
    let (reactor, connector) = create_test_reactor();
    connector.set_responder(SetupResponder::Reject("not entitled".into()));
    let callbacks = Arc::new(RecordingCallbacks::new());

    let options = full_setup("feed-a").with_reconnect(single_attempt());
    let channel = reactor.connect(options, callbacks.clone()).unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelDown)
        })
        .await
    );

    let down = callbacks.channel_events(channel).pop().unwrap();
    assert_eq!(down.kind, ChannelEventType::ChannelDown);
    assert!(down.is_connect_failure);
    let error = down.error.unwrap();
    assert_eq!(error.code, ErrorCode::Setup);
    assert!(error.text.contains("not entitled"));
    assert_eq!(reactor.channel_info(channel).unwrap().queue, ChannelQueue::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out_setup() {
    let (reactor, connector) = create_test_reactor();
    connector.set_responder(SetupResponder::Silent);
    let callbacks = Arc::new(RecordingCallbacks::new());

    let connection = ConnectionInfo::new(Endpoint::new("feed-a", 14002))
        .with_initialization_timeout(Duration::from_secs(2));
    let options = ConnectOptions::new(vec![connection])
        .with_setup(SetupPlan::full(LoginConfig::default()))
        .with_reconnect(single_attempt());
    let started = tokio::time::Instant::now();
    let channel = reactor.connect(options, callbacks.clone()).unwrap();

    assert!(
        dispatch_until(&reactor, 1000, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelDown)
        })
        .await
    );
    assert!(started.elapsed() >= Duration::from_secs(2));

    let down = callbacks.channel_events(channel).pop().unwrap();
    assert_eq!(down.error.unwrap().code, ErrorCode::InitializationTimeout);
    assert!(down.is_connect_failure);
    assert!(connector.last_peer().unwrap().is_closed());
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_submit_and_receive_messages() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let options = full_setup("feed-a").with_statistics(StatisticsFlags::all());
    let channel = reactor.connect(options, callbacks.clone()).unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );
    let peer = connector.last_peer().unwrap();

    assert_ok!(reactor.submit(channel, &Message::data(7, b"subscribe".to_vec())));
    assert_eq!(peer.written_data(), vec![Message::data(7, b"subscribe".to_vec())]);

    peer.send(&Message::data(7, b"quote".to_vec()));
    peer.send(&Message::LoginResponse(LoginResponse {
        accepted: true,
        text: "refreshed".into(),
    }));
    assert!(dispatch_until(&reactor, 100, || callbacks.messages(channel).len() == 2).await);
    assert_eq!(callbacks.messages(channel)[0], Message::data(7, b"quote".to_vec()));

    let stats = reactor.channel_statistics(channel, true).unwrap();
    assert_eq!(stats.messages_written, 5);
    assert_eq!(stats.messages_read, 6);
    let stats = reactor.channel_statistics(channel, false).unwrap();
    assert_eq!(stats.messages_read, 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_before_link_up_is_refused() {
    let (reactor, _connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks)
        .unwrap();
    let result = reactor.submit(channel, &Message::data(1, b"early".to_vec()));
    assert!(matches!(result, Err(ReactorError::ChannelNotActive { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_peer_pings_reported_with_ping_statistics() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let options = ConnectOptions::single(Endpoint::new("feed-a", 14002))
        .with_statistics(StatisticsFlags::all());
    let channel = reactor.connect(options, callbacks.clone()).unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    connector.last_peer().unwrap().send_ping();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::PingObserved)
        })
        .await
    );
    assert_eq!(reactor.channel_statistics(channel, false).unwrap().pings_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_quiet_link_sends_keep_alives() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let options = ConnectOptions::single(Endpoint::new("feed-a", 14002))
        .with_ping_timeout(Duration::from_secs(3))
        .with_statistics(StatisticsFlags::all());
    let channel = reactor.connect(options, callbacks.clone()).unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );
    let peer = connector.last_peer().unwrap();

    // Keep the peer talking so the link is not failed for silence
    for _ in 0..8 {
        peer.send_ping();
        dispatch_until(&reactor, 60, || false).await;
    }

    assert!(peer.pings() >= 2);
    assert!(reactor.channel_statistics(channel, false).unwrap().pings_sent >= 2);
    assert!(!callbacks.has_event(channel, &ChannelEventType::ChannelDownReconnecting));
}

// ----------------------------------------------------------------------------
// Callback Restrictions
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_refused_inside_callback_but_submit_allowed() {
    let (reactor, connector) = create_test_reactor();
    let connect_result = Arc::new(Mutex::new(None));
    let submit_result = Arc::new(Mutex::new(None));

    let callbacks = Arc::new(RecordingCallbacks::new().with_hook({
        let connect_result = connect_result.clone();
        let submit_result = submit_result.clone();
        move |reactor, event| match event.kind {
            ChannelEventType::ChannelUp => {
                let nested = reactor.connect(
                    ConnectOptions::single(Endpoint::new("feed-b", 14002)),
                    Arc::new(RecordingCallbacks::new()),
                );
                *connect_result.lock().unwrap() =
                    Some(matches!(nested, Err(ReactorError::CalledFromCallback { .. })));
            }
            ChannelEventType::ChannelReady => {
                let sent = reactor.submit(event.channel, &Message::data(3, b"from callback".to_vec()));
                *submit_result.lock().unwrap() = Some(sent.is_ok());
            }
            _ => {}
        }
    }));

    let channel = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks.clone())
        .unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    assert_eq!(*connect_result.lock().unwrap(), Some(true));
    assert_eq!(*submit_result.lock().unwrap(), Some(true));
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(
        connector.last_peer().unwrap().written_data(),
        vec![Message::data(3, b"from callback".to_vec())]
    );
}

// ----------------------------------------------------------------------------
// Close and Shutdown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_close_releases_slot() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks.clone())
        .unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    assert_ok!(reactor.close_channel(channel));
    assert_ok!(reactor.close_channel(channel));
    assert_eq!(reactor.channel_info(channel).unwrap().queue, ChannelQueue::Closing);
    assert!(matches!(
        reactor.submit(channel, &Message::data(1, b"late".to_vec())),
        Err(ReactorError::ChannelNotActive { .. })
    ));

    assert!(
        dispatch_until(&reactor, 100, || reactor.channel_info(channel).is_err()).await
    );
    assert!(matches!(
        reactor.channel_info(channel),
        Err(ReactorError::UnknownChannel { .. })
    ));
    assert!(connector.last_peer().unwrap().is_closed());
    assert_eq!(reactor.stats().channels_closed, 1);

    // The freed slot is handed out again under a new id
    let reopened = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks)
        .unwrap();
    assert_ne!(reopened, channel);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let (reactor, connector) = create_test_reactor();
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks.clone())
        .unwrap();
    assert!(
        dispatch_until(&reactor, 100, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelReady)
        })
        .await
    );

    assert_ok!(reactor.shutdown().await);
    assert_eq!(reactor.state(), ReactorState::ShutDown);
    assert!(connector.last_peer().unwrap().is_closed());

    assert!(matches!(
        reactor.connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks),
        Err(ReactorError::NotActive { .. })
    ));
    assert!(matches!(
        reactor.dispatch(DispatchOptions::poll()).await,
        Err(ReactorError::NotActive { .. })
    ));
    assert_ok!(reactor.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_worker_panic_moves_reactor_to_error() {
    let (reactor, connector) = create_test_reactor();
    connector.set_default_behavior(EndpointBehavior::PanicOnInit);
    let callbacks = Arc::new(RecordingCallbacks::new());

    let channel = reactor
        .connect(ConnectOptions::single(Endpoint::new("feed-a", 14002)), callbacks.clone())
        .unwrap();
    assert!(dispatch_until(&reactor, 200, || reactor.state() == ReactorState::Error).await);

    // The channel learns about it through a terminal down event
    assert!(
        dispatch_until(&reactor, 10, || {
            callbacks.has_event(channel, &ChannelEventType::ChannelDown)
        })
        .await
    );
    let down = callbacks.channel_events(channel).pop().unwrap();
    assert_eq!(down.kind, ChannelEventType::ChannelDown);
    assert!(down.is_connect_failure);
    let error = down.error.unwrap();
    assert_eq!(error.code, ErrorCode::Internal);
    assert!(error.text.contains("failed to initialize"));
    assert_eq!(reactor.channel_info(channel).unwrap().queue, ChannelQueue::Inactive);

    assert!(matches!(
        reactor.connect(ConnectOptions::single(Endpoint::new("feed-b", 14002)), callbacks.clone()),
        Err(ReactorError::NotActive {
            state: ReactorState::Error
        })
    ));
    assert!(matches!(
        reactor.submit(channel, &Message::data(1, b"late".to_vec())),
        Err(ReactorError::NotActive { .. })
    ));

    // Closing still frees the slot without a worker to acknowledge it
    assert_ok!(reactor.close_channel(channel));
    assert!(matches!(
        reactor.channel_info(channel),
        Err(ReactorError::UnknownChannel { .. })
    ));

    assert!(matches!(
        reactor.shutdown().await,
        Err(ReactorError::WorkerFailed { .. })
    ));
    assert_eq!(reactor.state(), ReactorState::ShutDown);
}

#[tokio::test]
async fn test_build_requires_connector() {
    let result = ReactorBuilder::new(ReactorConfig::testing()).build();
    assert!(matches!(result, Err(ReactorError::Config(_))));
}

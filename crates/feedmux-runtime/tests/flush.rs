//! Blocked writes parked on the reactor and completed after the worker flushes

use std::sync::Arc;

use feedmux_harness::{dispatch_until, init_tracing, MockConnector, RecordingCallbacks};
use feedmux_runtime::{
    ChannelEventType, ConnectOptions, Endpoint, Message, ReactorBuilder, ReactorConfig,
    ReactorError,
};
use tokio_test::assert_ok;

#[tokio::test(start_paused = true)]
async fn test_blocked_write_completes_after_flush() {
    init_tracing();
    let connector = Arc::new(MockConnector::new());
    let reactor = ReactorBuilder::new(ReactorConfig::testing())
        .with_connector(connector.clone())
        .build()
        .unwrap();
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
    let peer = connector.last_peer().unwrap();

    peer.set_block_writes(true);
    assert_ok!(reactor.submit(channel, &Message::data(1, b"first".to_vec())));
    let info = reactor.channel_info(channel).unwrap();
    assert!(info.write_pending);
    assert!(info.flush_requested);
    assert!(matches!(
        reactor.submit(channel, &Message::data(1, b"second".to_vec())),
        Err(ReactorError::WritePending { .. })
    ));

    // The worker keeps flushing while the link is still blocked
    dispatch_until(&reactor, 10, || false).await;
    assert!(peer.flushes() >= 1);
    assert!(peer.written_data().is_empty());

    peer.set_block_writes(false);
    assert!(dispatch_until(&reactor, 100, || !peer.written_data().is_empty()).await);
    assert_eq!(peer.written_data(), vec![Message::data(1, b"first".to_vec())]);

    let info = reactor.channel_info(channel).unwrap();
    assert!(!info.write_pending);
    assert!(!info.flush_requested);
    assert_ok!(reactor.submit(channel, &Message::data(1, b"second".to_vec())));
    assert_eq!(peer.written_data().len(), 2);
}

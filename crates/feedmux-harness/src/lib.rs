//! feedmux test harness
//!
//! In-memory collaborators for driving a reactor without sockets or an
//! authentication server:
//! - [`MockConnector`] / [`MockPeer`]: links whose far end is controlled by the test
//! - [`MockTokenService`]: scripted token and discovery responses
//! - [`RecordingCallbacks`]: records every callback for later assertions

pub mod callbacks;
pub mod link;
pub mod token;

use std::time::Duration;

use feedmux_runtime::{DispatchOptions, Reactor};
use tracing::warn;

pub use callbacks::{Recorded, RecordingCallbacks};
pub use link::{ConnectAttempt, EndpointBehavior, MockConnector, MockLink, MockPeer, SetupResponder};
pub use token::{MockTokenService, RecordedTokenRequest};

/// Route `tracing` output through the test writer; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Dispatch in short slices until `done` holds or `limit` dispatch calls pass
///
/// Returns whether `done` was reached.
pub async fn dispatch_until(reactor: &Reactor, limit: usize, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..limit {
        if done() {
            return true;
        }
        if let Err(error) = reactor
            .dispatch(DispatchOptions::timeout(Duration::from_millis(10)))
            .await
        {
            warn!(error = %error, "dispatch failed");
            return done();
        }
    }
    done()
}

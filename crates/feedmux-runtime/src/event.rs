//! Reactor/worker event protocol
//!
//! Both event queues carry [`ReactorEvent`]. Each variant's kinds are split by
//! direction:
//!
//! - reactor → worker: new/close channel, ready, failure reports, reconnect
//!   go-ahead, flush start, timer requests, forced renewals, credential
//!   submissions, session bookkeeping, shutdown
//! - worker → reactor: close acknowledgments, up/down transitions, flush done,
//!   expired timers, token results, credential requests, pings sent, worker
//!   exit
//!
//! An event is owned by exactly one queue at a time; it is moved, never shared.

use std::sync::Arc;
use std::time::Duration;

use feedmux_core::{
    AccessToken, ChannelId, ConnectOptions, CredentialRenewal, ErrorInfo, Link, SessionId,
};
use tokio::time::Instant;

use crate::activity::LinkActivity;

/// Every message crossing between the reactor and the worker
#[derive(Debug)]
pub enum ReactorEvent {
    Channel(ChannelEventImpl),
    Flush(FlushEvent),
    Timer(TimerEvent),
    TokenMgnt(TokenMgntEvent),
    CredentialRenewal(CredentialRenewalEvent),
    Ping(PingEvent),
    TokenSession(TokenSessionEvent),
    Reactor(ReactorStateEvent),
}

// ----------------------------------------------------------------------------
// Channel Lifecycle
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ChannelEventImpl {
    pub channel: ChannelId,
    pub kind: ChannelEventKind,
}

/// Parameters of a channel handed to the worker
#[derive(Debug)]
pub struct NewChannelSpec {
    pub options: ConnectOptions,
    pub session: Option<SessionId>,
}

/// A link that finished initializing
#[derive(Debug)]
pub struct LinkUp {
    pub link: Arc<dyn Link>,
    pub activity: Arc<LinkActivity>,
    /// Increments with every link the channel brings up
    pub epoch: u64,
    /// Position of the endpoint in the connection list
    pub connection_index: usize,
    /// Budget for the setup handshake on this link
    pub setup_timeout: Duration,
}

#[derive(Debug)]
pub enum ChannelEventKind {
    /// reactor → worker: start connecting
    NewChannel(Box<NewChannelSpec>),
    /// reactor → worker: abandon the channel and acknowledge
    CloseChannel,
    /// reactor → worker: the setup handshake completed on `epoch`
    ChannelReady { epoch: u64 },
    /// reactor → worker: the reactor saw the link on `epoch` fail
    ChannelFailed { epoch: u64, error: ErrorInfo },
    /// reactor → worker: the down event was delivered; begin the reconnect delay
    StartReconnect,
    /// worker → reactor: nothing of the channel remains on the worker
    CloseChannelAck,
    /// worker → reactor: link is active
    ChannelUp(Box<LinkUp>),
    /// worker → reactor: terminal failure, no more attempts
    ChannelDown {
        error: ErrorInfo,
        is_connect_failure: bool,
    },
    /// worker → reactor: failure, another attempt will follow
    ChannelDownReconnecting {
        error: ErrorInfo,
        is_connect_failure: bool,
    },
}

impl ChannelEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEventKind::NewChannel(_) => "new-channel",
            ChannelEventKind::CloseChannel => "close-channel",
            ChannelEventKind::ChannelReady { .. } => "channel-ready",
            ChannelEventKind::ChannelFailed { .. } => "channel-failed",
            ChannelEventKind::StartReconnect => "start-reconnect",
            ChannelEventKind::CloseChannelAck => "close-channel-ack",
            ChannelEventKind::ChannelUp(_) => "channel-up",
            ChannelEventKind::ChannelDown { .. } => "channel-down",
            ChannelEventKind::ChannelDownReconnecting { .. } => "channel-down-reconnecting",
        }
    }
}

// ----------------------------------------------------------------------------
// Flush, Timer and Ping
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    /// reactor → worker: a write would block; drain the link
    Start { channel: ChannelId },
    /// worker → reactor: the link drained
    Done { channel: ChannelId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// reactor → worker: deliver `Expired` at `expire_at`
    Request {
        channel: ChannelId,
        expire_at: Instant,
    },
    /// worker → reactor: a requested deadline passed
    Expired {
        channel: ChannelId,
        expire_at: Instant,
    },
}

/// worker → reactor: a keep-alive was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingEvent {
    pub channel: ChannelId,
}

// ----------------------------------------------------------------------------
// Tokens and Credentials
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct TokenMgntEvent {
    pub channel: ChannelId,
    pub session: SessionId,
    pub kind: TokenMgntKind,
}

#[derive(Debug)]
pub enum TokenMgntKind {
    /// reactor → worker: renew now
    RenewToken,
    /// worker → reactor: a fresh token; channels past login resubmit it
    Reissued(AccessToken),
    /// worker → reactor: a renewal attempt failed and will be retried
    RenewalFailed(ErrorInfo),
    /// worker → reactor: retries exhausted
    ChannelWarning(ErrorInfo),
}

#[derive(Debug)]
pub enum CredentialRenewalEvent {
    /// worker → reactor: ask the application for fresh secrets
    Requested {
        session: SessionId,
        channel: ChannelId,
        user_name: String,
    },
    /// reactor → worker: the application's answer
    Submitted {
        session: SessionId,
        renewal: CredentialRenewal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSessionEvent {
    /// reactor → worker: a session was created; fetch its first token
    AddSession { session: SessionId },
    /// reactor → worker: drop the channel from the session's list
    UnregisterChannel {
        session: SessionId,
        channel: ChannelId,
    },
}

// ----------------------------------------------------------------------------
// Reactor Lifecycle
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorStateEvent {
    /// reactor → worker: stop. worker → reactor: the worker stopped, with the
    /// fatal error if it did not stop on request
    Shutdown { error: Option<ErrorInfo> },
}

impl ReactorEvent {
    pub(crate) fn channel(channel: ChannelId, kind: ChannelEventKind) -> Self {
        ReactorEvent::Channel(ChannelEventImpl { channel, kind })
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ReactorEvent::Channel(event) => event.kind.name(),
            ReactorEvent::Flush(FlushEvent::Start { .. }) => "flush-start",
            ReactorEvent::Flush(FlushEvent::Done { .. }) => "flush-done",
            ReactorEvent::Timer(TimerEvent::Request { .. }) => "timer-request",
            ReactorEvent::Timer(TimerEvent::Expired { .. }) => "timer-expired",
            ReactorEvent::TokenMgnt(_) => "token-management",
            ReactorEvent::CredentialRenewal(_) => "credential-renewal",
            ReactorEvent::Ping(_) => "ping",
            ReactorEvent::TokenSession(_) => "token-session",
            ReactorEvent::Reactor(_) => "reactor-state",
        }
    }
}

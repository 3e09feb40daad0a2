//! Application callback contract
//!
//! Callbacks run on the task that calls [`Reactor::dispatch`], never on the
//! worker. While a callback runs, `connect`, `close_channel`, `dispatch` and
//! `shutdown` are refused for that thread; `submit`, `request_token_renewal`,
//! `submit_credential_renewal` and the query calls are allowed.

use feedmux_core::{AccessToken, ChannelId, ChannelSetupState, ErrorInfo, Message, SessionId};

use crate::reactor::Reactor;

/// What happened to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventType {
    /// The link is active; the setup handshake starts
    ChannelUp,
    /// The handshake finished; the channel is usable
    ChannelReady,
    /// Terminal failure; close the channel to release it
    ChannelDown,
    /// Failure; the reactor will try the next endpoint after a delay
    ChannelDownReconnecting,
    /// The handshake advanced
    SetupStateChanged(ChannelSetupState),
    /// Degraded but still running (token renewal exhausted its retries)
    Warning,
    /// The peer sent a keep-alive (only with ping statistics enabled)
    PingObserved,
}

/// Channel event delivered to [`ChannelCallbacks::on_channel_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub channel: ChannelId,
    pub kind: ChannelEventType,
    pub error: Option<ErrorInfo>,
    /// Set on down events for failures before the channel ever became ready
    pub is_connect_failure: bool,
}

impl ChannelEvent {
    pub(crate) fn new(channel: ChannelId, kind: ChannelEventType) -> Self {
        Self {
            channel,
            kind,
            error: None,
            is_connect_failure: false,
        }
    }

    pub(crate) fn down(
        channel: ChannelId,
        kind: ChannelEventType,
        error: ErrorInfo,
        is_connect_failure: bool,
    ) -> Self {
        Self {
            channel,
            kind,
            error: Some(error),
            is_connect_failure,
        }
    }

    pub(crate) fn warning(channel: ChannelId, error: ErrorInfo) -> Self {
        Self {
            channel,
            kind: ChannelEventType::Warning,
            error: Some(error),
            is_connect_failure: false,
        }
    }
}

/// Token renewal result for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokenEvent {
    pub channel: ChannelId,
    pub session: SessionId,
    pub token: Option<AccessToken>,
    pub error: Option<ErrorInfo>,
}

/// Request for fresh credentials before a password grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRenewalRequest {
    pub channel: ChannelId,
    pub session: SessionId,
    pub user_name: String,
}

/// Per-channel application callbacks
pub trait ChannelCallbacks: Send + Sync {
    fn on_channel_event(&self, reactor: &Reactor, event: &ChannelEvent);

    /// One decoded inbound message that is not part of the setup handshake
    fn on_message(&self, _reactor: &Reactor, _channel: ChannelId, _message: &Message) {}

    fn on_auth_token_event(&self, _reactor: &Reactor, _event: &AuthTokenEvent) {}

    /// Answer with [`Reactor::submit_credential_renewal`]
    fn on_credential_renewal(&self, _reactor: &Reactor, _request: &CredentialRenewalRequest) {}
}

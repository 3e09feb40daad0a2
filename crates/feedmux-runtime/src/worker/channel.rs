//! Worker-side channel state: connection attempts, link initialization,
//! failure handling, reconnect scheduling, flushing and keep-alives

use std::sync::Arc;
use std::time::Duration;

use feedmux_core::token::select_endpoint;
use feedmux_core::{
    ChannelId, ConnectOptions, ConnectionCursor, DiscoveryRequest, Endpoint, ErrorCode, ErrorInfo,
    FlushOutcome, InitProgress, Link, ReconnectDecision, ReconnectPolicy, RestError,
    ServiceEndpoint, SessionId, TransportError,
};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{TaskOutcome, Worker};
use crate::activity::LinkActivity;
use crate::event::{ChannelEventKind, FlushEvent, LinkUp, PingEvent, ReactorEvent};

// ----------------------------------------------------------------------------
// Channel State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelPhase {
    /// Session-managed connection waiting for the session's first token
    AwaitingToken,
    Discovering,
    Connecting,
    /// Link connected; driving its handshake
    Initializing,
    Active,
    /// Down event sent; waiting for the reactor to deliver it
    AwaitingReconnect { delay: Duration },
    Reconnecting { at: Instant },
    /// Attempts exhausted; waiting for close
    Failed,
}

pub(crate) struct WorkerChannel {
    pub id: ChannelId,
    pub options: ConnectOptions,
    pub session: Option<SessionId>,
    pub phase: ChannelPhase,
    pub policy: ReconnectPolicy,
    pub cursor: ConnectionCursor,
    /// Links brought up so far
    pub epoch: u64,
    /// Attempts started so far; tags background task results
    pub attempt: u64,
    /// Deadline for the current attempt to bring its link up
    pub deadline: Option<Instant>,
    pub link: Option<Arc<dyn Link>>,
    pub activity: Option<Arc<LinkActivity>>,
    /// The reactor finished setup on the current link
    pub ready: bool,
    pub pending_task: Option<AbortHandle>,
}

impl WorkerChannel {
    pub fn new(id: ChannelId, options: ConnectOptions, session: Option<SessionId>) -> Self {
        let policy = ReconnectPolicy::new(options.reconnect.clone());
        let cursor = ConnectionCursor::new(options.connections.len());
        Self {
            id,
            options,
            session,
            phase: ChannelPhase::Connecting,
            policy,
            cursor,
            epoch: 0,
            attempt: 0,
            deadline: None,
            link: None,
            activity: None,
            ready: false,
            pending_task: None,
        }
    }

    /// Abort background work and close the link
    pub fn release_link(&mut self) {
        if let Some(task) = self.pending_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.activity = None;
        self.deadline = None;
    }

    fn is_attempting(&self) -> bool {
        matches!(
            self.phase,
            ChannelPhase::AwaitingToken
                | ChannelPhase::Discovering
                | ChannelPhase::Connecting
                | ChannelPhase::Initializing
        )
    }
}

// ----------------------------------------------------------------------------
// Attempts
// ----------------------------------------------------------------------------

impl Worker {
    /// Start an attempt against the connection under the channel's cursor
    pub(super) fn begin_attempt(&mut self, channel: ChannelId, now: Instant) {
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        state.policy.record_attempt();
        state.attempt += 1;
        state.ready = false;

        let index = state.cursor.current();
        let Some(connection) = state.options.connections.get(index) else {
            return;
        };
        state.deadline = Some(now + connection.initialization_timeout);
        debug!(
            channel = %channel,
            attempt = state.policy.attempts(),
            connection = index,
            "starting connection attempt"
        );

        if connection.enable_session_management {
            let session = state.session;
            let token = session
                .and_then(|session| self.sessions.get(session))
                .and_then(|session| session.access_token());
            match (token, session) {
                (Some(_), _) => self.continue_attempt(channel),
                (None, Some(session)) => {
                    if let Some(state) = self.channels.get_mut(&channel) {
                        state.phase = ChannelPhase::AwaitingToken;
                    }
                    self.request_token(session, false);
                }
                (None, None) => self.fail_channel(
                    channel,
                    ErrorInfo::new(ErrorCode::TokenRenewal, "channel has no token session"),
                ),
            }
        } else {
            self.continue_attempt(channel);
        }
    }

    /// Proceed past the token wait: discover the endpoint or connect directly
    pub(super) fn continue_attempt(&mut self, channel: ChannelId) {
        let Some(state) = self.channels.get(&channel) else {
            return;
        };
        let Some(connection) = state.options.connections.get(state.cursor.current()) else {
            return;
        };

        match connection.endpoint.clone() {
            Some(endpoint) => self.start_connect(channel, endpoint),
            None => {
                let token = state
                    .session
                    .and_then(|session| self.sessions.get(session))
                    .and_then(|session| session.access_token());
                match (self.token_service.is_some(), token) {
                    (true, Some(token)) => self.start_discovery(channel, token),
                    _ => self.fail_channel(
                        channel,
                        ErrorInfo::new(ErrorCode::Discovery, "no token for service discovery"),
                    ),
                }
            }
        }
    }

    fn start_connect(&mut self, channel: ChannelId, endpoint: Endpoint) {
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        let attempt = state.attempt;
        let connector = self.connector.clone();
        trace!(channel = %channel, endpoint = %endpoint, "connecting");
        let task = self.tasks.spawn(async move {
            let result = connector.connect(&endpoint).await;
            TaskOutcome::Connected {
                channel,
                attempt,
                endpoint,
                result,
            }
        });
        state.phase = ChannelPhase::Connecting;
        state.pending_task = Some(task);
        self.stats.connect_attempts += 1;
    }

    fn start_discovery(&mut self, channel: ChannelId, access_token: String) {
        let Some(service) = self.token_service.clone() else {
            return;
        };
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        let attempt = state.attempt;
        let request = DiscoveryRequest {
            url: self.config.token.service_discovery_url.clone(),
            access_token,
            transport: self.config.token.discovery_transport,
            timeout: self.config.token.request_timeout,
        };
        trace!(channel = %channel, url = %request.url, "discovering endpoints");
        let task = self.tasks.spawn(async move {
            let timeout = request.timeout;
            let result = tokio::time::timeout(timeout, service.discover_endpoints(request))
                .await
                .unwrap_or_else(|_| Err(RestError::new(None, "service discovery timed out")));
            TaskOutcome::Discovered {
                channel,
                attempt,
                result,
            }
        });
        state.phase = ChannelPhase::Discovering;
        state.pending_task = Some(task);
    }

    fn current_attempt(&self, channel: ChannelId, attempt: u64) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|state| state.attempt == attempt && state.is_attempting())
    }

    pub(super) fn on_discovered(
        &mut self,
        channel: ChannelId,
        attempt: u64,
        result: Result<Vec<ServiceEndpoint>, RestError>,
    ) {
        if !self.current_attempt(channel, attempt) {
            return;
        }
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pending_task = None;
        }

        let endpoints = match result {
            Ok(endpoints) => endpoints,
            Err(error) => {
                warn!(channel = %channel, error = %error, "service discovery failed");
                self.fail_channel(channel, ErrorInfo::new(ErrorCode::Discovery, error.to_string()));
                return;
            }
        };

        let location = self.channels.get(&channel).and_then(|state| {
            state
                .options
                .connections
                .get(state.cursor.current())
                .and_then(|connection| connection.location.clone())
        });
        match select_endpoint(
            &endpoints,
            self.config.token.discovery_transport,
            location.as_deref(),
        ) {
            Some(endpoint) => {
                debug!(channel = %channel, endpoint = %endpoint, "endpoint discovered");
                self.start_connect(channel, endpoint);
            }
            None => self.fail_channel(
                channel,
                ErrorInfo::new(
                    ErrorCode::Discovery,
                    format!("no endpoint for location {:?}", location),
                ),
            ),
        }
    }

    pub(super) fn on_connected(
        &mut self,
        channel: ChannelId,
        attempt: u64,
        endpoint: Endpoint,
        result: Result<Arc<dyn Link>, TransportError>,
    ) {
        if !self.current_attempt(channel, attempt) {
            if let Ok(link) = result {
                link.close();
            }
            return;
        }

        match result {
            Ok(link) => {
                debug!(channel = %channel, endpoint = %endpoint, "connected, initializing link");
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.pending_task = None;
                    state.link = Some(link);
                    state.phase = ChannelPhase::Initializing;
                }
                self.poll_initializing_channel(channel, Instant::now());
            }
            Err(error) => {
                warn!(channel = %channel, endpoint = %endpoint, error = %error, "connect failed");
                self.fail_channel(channel, ErrorInfo::from(&error));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------

    /// Drive link handshakes and expire attempts past their deadline
    pub(super) fn poll_initializing(&mut self, now: Instant) {
        let attempting: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|state| state.is_attempting())
            .map(|state| state.id)
            .collect();
        for channel in attempting {
            self.poll_initializing_channel(channel, now);
        }
    }

    fn poll_initializing_channel(&mut self, channel: ChannelId, now: Instant) {
        let Some(state) = self.channels.get(&channel) else {
            return;
        };
        let expired = state.deadline.is_some_and(|deadline| deadline <= now);

        let progress = match (&state.phase, &state.link) {
            (ChannelPhase::Initializing, Some(link)) => Some(link.init()),
            _ => None,
        };
        match progress {
            Some(Ok(InitProgress::Active)) => self.link_up(channel, now),
            Some(Err(error)) => {
                warn!(channel = %channel, error = %error, "link initialization failed");
                self.fail_channel(channel, ErrorInfo::from(&error));
            }
            Some(Ok(InitProgress::InProgress)) | None if expired => {
                let timeout = self
                    .channels
                    .get(&channel)
                    .and_then(|state| state.options.connections.get(state.cursor.current()))
                    .map(|connection| connection.initialization_timeout)
                    .unwrap_or_default();
                let error = TransportError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                };
                warn!(channel = %channel, "connection attempt timed out");
                self.fail_channel(channel, ErrorInfo::from(&error));
            }
            _ => {}
        }
    }

    fn link_up(&mut self, channel: ChannelId, now: Instant) {
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        let Some(link) = state.link.clone() else {
            return;
        };
        let connection_index = state.cursor.current();
        let setup_timeout = state
            .options
            .connections
            .get(connection_index)
            .map(|connection| connection.initialization_timeout)
            .unwrap_or_default();
        let activity = Arc::new(LinkActivity::new(now));

        state.epoch += 1;
        state.phase = ChannelPhase::Active;
        state.deadline = None;
        state.activity = Some(activity.clone());
        let epoch = state.epoch;

        info!(channel = %channel, epoch, connection = connection_index, "link active");
        self.emit(ReactorEvent::channel(
            channel,
            ChannelEventKind::ChannelUp(Box::new(LinkUp {
                link,
                activity,
                epoch,
                connection_index,
                setup_timeout,
            })),
        ));
    }

    // ------------------------------------------------------------------------
    // Failure and Reconnection
    // ------------------------------------------------------------------------

    /// Tear down the current link and report down, reconnecting if allowed
    pub(super) fn fail_channel(&mut self, channel: ChannelId, error: ErrorInfo) {
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        if matches!(
            state.phase,
            ChannelPhase::AwaitingReconnect { .. }
                | ChannelPhase::Reconnecting { .. }
                | ChannelPhase::Failed
        ) {
            return;
        }

        state.release_link();
        let is_connect_failure = !state.ready;
        state.ready = false;

        let kind = match state.policy.record_failure() {
            ReconnectDecision::Retry { delay } => {
                state.phase = ChannelPhase::AwaitingReconnect { delay };
                debug!(channel = %channel, delay = ?delay, "scheduling reconnect");
                ChannelEventKind::ChannelDownReconnecting {
                    error,
                    is_connect_failure,
                }
            }
            ReconnectDecision::GiveUp => {
                state.phase = ChannelPhase::Failed;
                info!(channel = %channel, attempts = state.policy.attempts(), "reconnect attempts exhausted");
                ChannelEventKind::ChannelDown {
                    error,
                    is_connect_failure,
                }
            }
        };

        self.flushing.remove(&channel);
        self.timers.retain(|(_, timer_channel)| *timer_channel != channel);
        self.stats.channel_failures += 1;
        self.emit(ReactorEvent::channel(channel, kind));
    }

    /// The reactor delivered the down event; start the delay
    pub(super) fn on_start_reconnect(&mut self, channel: ChannelId, now: Instant) {
        if let Some(state) = self.channels.get_mut(&channel) {
            if let ChannelPhase::AwaitingReconnect { delay } = state.phase {
                let next = state.cursor.advance();
                state.phase = ChannelPhase::Reconnecting { at: now + delay };
                trace!(channel = %channel, connection = next, delay = ?delay, "reconnect scheduled");
            }
        }
    }

    pub(super) fn poll_reconnects(&mut self, now: Instant) {
        let due: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|state| matches!(state.phase, ChannelPhase::Reconnecting { at } if at <= now))
            .map(|state| state.id)
            .collect();
        for channel in due {
            self.stats.reconnects += 1;
            self.begin_attempt(channel, now);
        }
    }

    /// The reactor finished setup; the reconnect budget starts over
    pub(super) fn on_channel_ready(&mut self, channel: ChannelId, epoch: u64) {
        if let Some(state) = self.channels.get_mut(&channel) {
            if state.epoch == epoch && state.phase == ChannelPhase::Active {
                state.ready = true;
                state.policy.reset();
            }
        }
    }

    /// Failure seen by the reactor on the link of `epoch`
    pub(super) fn on_channel_failed(&mut self, channel: ChannelId, epoch: u64, error: ErrorInfo) {
        let current = self
            .channels
            .get(&channel)
            .is_some_and(|state| state.epoch == epoch && state.phase == ChannelPhase::Active);
        if current {
            self.fail_channel(channel, error);
        } else {
            trace!(channel = %channel, epoch, "stale failure report ignored");
        }
    }

    // ------------------------------------------------------------------------
    // Flushing and Keep-alives
    // ------------------------------------------------------------------------

    pub(super) fn poll_flushing(&mut self) {
        let flushing: Vec<ChannelId> = self.flushing.iter().copied().collect();
        for channel in flushing {
            let link = self
                .channels
                .get(&channel)
                .filter(|state| state.phase == ChannelPhase::Active)
                .and_then(|state| state.link.clone());
            let Some(link) = link else {
                self.flushing.remove(&channel);
                continue;
            };
            match link.flush() {
                Ok(FlushOutcome::Done) => {
                    self.flushing.remove(&channel);
                    self.emit(ReactorEvent::Flush(FlushEvent::Done { channel }));
                }
                Ok(FlushOutcome::Pending(bytes)) => {
                    trace!(channel = %channel, bytes, "flush pending");
                }
                Err(error) => {
                    warn!(channel = %channel, error = %error, "flush failed");
                    self.fail_channel(channel, ErrorInfo::from(&error));
                }
            }
        }
    }

    /// Send keep-alives on quiet links and fail links whose peer went silent
    pub(super) fn poll_pings(&mut self, now: Instant) {
        let active: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|state| state.phase == ChannelPhase::Active)
            .map(|state| state.id)
            .collect();

        for channel in active {
            let Some(state) = self.channels.get(&channel) else {
                continue;
            };
            let (Some(link), Some(activity)) = (state.link.clone(), state.activity.clone()) else {
                continue;
            };
            let ping = state.options.ping;

            if activity.read_idle(now) >= ping.timeout {
                warn!(channel = %channel, timeout = ?ping.timeout, "peer silent, failing link");
                self.fail_channel(
                    channel,
                    ErrorInfo::new(
                        ErrorCode::PingTimeout,
                        format!("nothing received for {:?}", ping.timeout),
                    ),
                );
                continue;
            }

            if activity.write_idle(now) >= ping.send_interval() {
                match link.ping() {
                    Ok(()) => {
                        activity.touch_write(now);
                        self.stats.pings_sent += 1;
                        self.emit(ReactorEvent::Ping(PingEvent { channel }));
                    }
                    Err(error) => {
                        warn!(channel = %channel, error = %error, "ping failed");
                        self.fail_channel(channel, ErrorInfo::from(&error));
                    }
                }
            }
        }
    }

    /// Interval at which keep-alive checks must run
    pub(super) fn ping_tick(&self) -> Option<Duration> {
        self.channels
            .values()
            .filter(|state| state.phase == ChannelPhase::Active)
            .map(|state| state.options.ping.send_interval())
            .min()
    }
}

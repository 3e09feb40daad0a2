//! Background worker
//!
//! The worker is a single tokio task that owns everything slow or periodic:
//! connecting and initializing links, reconnect delays, flushing, keep-alives,
//! setup timers and token renewal. It never calls application code; every
//! outcome is queued to the reactor as a [`ReactorEvent`].
//!
//! Connects, discoveries and token requests run as child tasks in a
//! [`JoinSet`]; their results are handled on the worker task itself, so the
//! worker's own state needs no locking.

mod channel;
mod token;

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use feedmux_core::{
    AccessToken, ChannelId, Connector, Endpoint, ErrorCode, ErrorInfo, EventQueue, Link,
    Notifier, ReactorConfig, RestError, ServiceEndpoint, SessionId, TokenService,
    TransportError,
};
use futures::FutureExt;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::event::{
    ChannelEventImpl, ChannelEventKind, CredentialRenewalEvent, FlushEvent, ReactorEvent,
    ReactorStateEvent, TimerEvent, TokenMgntEvent, TokenMgntKind, TokenSessionEvent,
};
use crate::managers::TokenSessionRegistry;
use channel::{ChannelPhase, WorkerChannel};

/// Result of a child task
pub(crate) enum TaskOutcome {
    Connected {
        channel: ChannelId,
        attempt: u64,
        endpoint: Endpoint,
        result: Result<Arc<dyn Link>, TransportError>,
    },
    Discovered {
        channel: ChannelId,
        attempt: u64,
        result: Result<Vec<ServiceEndpoint>, RestError>,
    },
    Token {
        session: SessionId,
        refresh: bool,
        result: Result<AccessToken, RestError>,
    },
}

/// Counters kept by the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub channel_failures: u64,
    pub pings_sent: u64,
    pub token_requests: u64,
}

/// Run the worker, turning a panic into a failed shutdown the reactor can see
///
/// Link and connector code runs on this task. A panic closes the worker queue
/// and queues `Shutdown` with the panic message for the reactor.
pub(crate) async fn supervise(worker: Worker) -> Result<(), ErrorInfo> {
    let inbound = worker.inbound.clone();
    let reactor_queue = worker.reactor_queue.clone();

    let panic = match AssertUnwindSafe(worker.run()).catch_unwind().await {
        Ok(()) => return Ok(()),
        Err(panic) => panic,
    };

    let error = ErrorInfo::new(
        ErrorCode::Internal,
        format!("worker panicked: {}", panic_message(&*panic)),
    );
    let abandoned = inbound.close();
    error!(error = %error, abandoned = abandoned.len(), "reactor worker failed");
    let _ = reactor_queue.push(ReactorEvent::Reactor(ReactorStateEvent::Shutdown {
        error: Some(error.clone()),
    }));
    Err(error)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic")
    }
}

pub(crate) struct Worker {
    config: ReactorConfig,
    /// worker → reactor
    reactor_queue: Arc<EventQueue<ReactorEvent>>,
    /// reactor → worker
    inbound: Arc<EventQueue<ReactorEvent>>,
    notifier: Notifier,
    connector: Arc<dyn Connector>,
    token_service: Option<Arc<dyn TokenService>>,
    sessions: Arc<TokenSessionRegistry>,
    channels: HashMap<ChannelId, WorkerChannel>,
    timers: BTreeSet<(Instant, ChannelId)>,
    flushing: HashSet<ChannelId>,
    tasks: JoinSet<TaskOutcome>,
    token_requests: HashMap<SessionId, AbortHandle>,
    stats: WorkerStats,
    running: bool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReactorConfig,
        reactor_queue: Arc<EventQueue<ReactorEvent>>,
        inbound: Arc<EventQueue<ReactorEvent>>,
        notifier: Notifier,
        connector: Arc<dyn Connector>,
        token_service: Option<Arc<dyn TokenService>>,
        sessions: Arc<TokenSessionRegistry>,
    ) -> Self {
        Self {
            config,
            reactor_queue,
            inbound,
            notifier,
            connector,
            token_service,
            sessions,
            channels: HashMap::new(),
            timers: BTreeSet::new(),
            flushing: HashSet::new(),
            tasks: JoinSet::new(),
            token_requests: HashMap::new(),
            stats: WorkerStats::default(),
            running: true,
        }
    }

    /// Worker main loop; returns once shutdown is requested or the reactor is gone
    pub async fn run(mut self) {
        info!(channels = self.channels.len(), "reactor worker started");

        while self.running {
            let wait = self.next_wait(Instant::now());
            let joined = if self.tasks.is_empty() {
                self.notifier.wait(Some(wait)).await;
                None
            } else {
                tokio::select! {
                    _ = self.notifier.wait(Some(wait)) => None,
                    joined = self.tasks.join_next() => joined,
                }
            };

            match joined {
                Some(Ok(outcome)) => self.handle_task_outcome(outcome),
                Some(Err(join_error)) if join_error.is_cancelled() => {}
                Some(Err(join_error)) => error!(error = %join_error, "worker child task panicked"),
                None => {}
            }

            for event in self.inbound.drain_all() {
                self.handle_event(event);
            }
            if !self.running {
                break;
            }

            let now = Instant::now();
            self.poll_initializing(now);
            self.poll_flushing();
            self.poll_reconnects(now);
            self.poll_timers(now);
            self.poll_pings(now);
            self.poll_sessions(now);
        }

        self.stop();
    }

    fn stop(&mut self) {
        for state in self.channels.values_mut() {
            state.release_link();
        }
        self.channels.clear();
        self.tasks.abort_all();
        self.token_requests.clear();
        let abandoned = self.inbound.close();
        info!(
            abandoned = abandoned.len(),
            stats = ?self.stats,
            "reactor worker stopped"
        );
        let _ = self
            .reactor_queue
            .push(ReactorEvent::Reactor(ReactorStateEvent::Shutdown { error: None }));
    }

    /// Queue an event for the reactor; a closed queue means the reactor is gone
    fn emit(&mut self, event: ReactorEvent) {
        if let Err(rejected) = self.reactor_queue.push(event) {
            debug!(event = rejected.into_inner().name(), "reactor queue closed, stopping");
            self.running = false;
        }
    }

    /// How long to sleep before the next periodic check
    fn next_wait(&self, now: Instant) -> Duration {
        let mut wait = self.config.worker_idle_tick;

        let busy = self.flushing.len()
            + self
                .channels
                .values()
                .filter(|state| {
                    matches!(
                        state.phase,
                        ChannelPhase::Initializing | ChannelPhase::Connecting
                    )
                })
                .count();
        if busy > 0 {
            wait = wait.min(self.config.poll_interval);
        }
        if let Some(tick) = self.ping_tick() {
            wait = wait.min(tick);
        }

        let renewals: Vec<Instant> = self
            .sessions
            .sessions()
            .iter()
            .filter_map(|session| session.next_renewal())
            .collect();
        let deadlines = self
            .timers
            .iter()
            .next()
            .map(|(expire_at, _)| *expire_at)
            .into_iter()
            .chain(self.channels.values().filter_map(|state| match state.phase {
                ChannelPhase::Reconnecting { at } => Some(at),
                _ => state.deadline,
            }))
            .chain(renewals);
        for deadline in deadlines {
            wait = wait.min(deadline.saturating_duration_since(now));
        }

        wait.max(self.config.worker_min_tick)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: ReactorEvent) {
        trace!(event = event.name(), "worker event");
        let now = Instant::now();
        match event {
            ReactorEvent::Channel(ChannelEventImpl { channel, kind }) => match kind {
                ChannelEventKind::NewChannel(spec) => {
                    let spec = *spec;
                    self.channels.insert(
                        channel,
                        WorkerChannel::new(channel, spec.options, spec.session),
                    );
                    self.begin_attempt(channel, now);
                }
                ChannelEventKind::CloseChannel => self.close_channel(channel),
                ChannelEventKind::ChannelReady { epoch } => self.on_channel_ready(channel, epoch),
                ChannelEventKind::ChannelFailed { epoch, error } => {
                    self.on_channel_failed(channel, epoch, error)
                }
                ChannelEventKind::StartReconnect => self.on_start_reconnect(channel, now),
                other => warn!(channel = %channel, event = other.name(), "unexpected event on worker queue"),
            },
            ReactorEvent::Flush(FlushEvent::Start { channel }) => {
                if self.channels.contains_key(&channel) {
                    self.flushing.insert(channel);
                }
            }
            ReactorEvent::Timer(TimerEvent::Request { channel, expire_at }) => {
                if self.channels.contains_key(&channel) {
                    self.timers.insert((expire_at, channel));
                }
            }
            ReactorEvent::TokenMgnt(TokenMgntEvent {
                session,
                kind: TokenMgntKind::RenewToken,
                ..
            }) => self.request_token(session, false),
            ReactorEvent::CredentialRenewal(CredentialRenewalEvent::Submitted {
                session,
                renewal,
            }) => self.on_credentials_submitted(session, &renewal),
            ReactorEvent::TokenSession(TokenSessionEvent::AddSession { session }) => {
                self.request_token(session, false)
            }
            ReactorEvent::TokenSession(TokenSessionEvent::UnregisterChannel {
                session,
                channel,
            }) => self.on_unregister_channel(session, channel),
            ReactorEvent::Reactor(ReactorStateEvent::Shutdown { .. }) => {
                debug!("worker shutdown requested");
                self.running = false;
            }
            other => warn!(event = other.name(), "unexpected event on worker queue"),
        }
    }

    fn handle_task_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Connected {
                channel,
                attempt,
                endpoint,
                result,
            } => self.on_connected(channel, attempt, endpoint, result),
            TaskOutcome::Discovered {
                channel,
                attempt,
                result,
            } => self.on_discovered(channel, attempt, result),
            TaskOutcome::Token {
                session,
                refresh,
                result,
            } => self.on_token_result(session, refresh, result),
        }
    }

    fn close_channel(&mut self, channel: ChannelId) {
        if let Some(mut state) = self.channels.remove(&channel) {
            state.release_link();
            debug!(channel = %channel, phase = ?state.phase, "channel closed on worker");
        }
        self.flushing.remove(&channel);
        self.timers.retain(|(_, timer_channel)| *timer_channel != channel);
        self.emit(ReactorEvent::channel(channel, ChannelEventKind::CloseChannelAck));
    }

    fn poll_timers(&mut self, now: Instant) {
        while let Some(&(expire_at, channel)) = self.timers.iter().next() {
            if expire_at > now {
                break;
            }
            self.timers.remove(&(expire_at, channel));
            self.emit(ReactorEvent::Timer(TimerEvent::Expired { channel, expire_at }));
        }
    }
}

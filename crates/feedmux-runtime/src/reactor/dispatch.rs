//! Event processing and inbound reads for [`Reactor::dispatch`]

use std::sync::Arc;

use feedmux_core::{
    ChannelId, ChannelSetupState, ErrorCode, ErrorInfo, Message, ReactorError, ReactorResult,
    ReactorState, ReadOutcome, SetupError, SetupProgress,
};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::{
    link_token, ChannelQueue, DispatchOptions, DispatchSummary, Reactor, QUEUE_TOKEN,
};
use crate::callbacks::{
    AuthTokenEvent, ChannelCallbacks, ChannelEvent, ChannelEventType, CredentialRenewalRequest,
};
use crate::event::{
    ChannelEventImpl, ChannelEventKind, CredentialRenewalEvent, FlushEvent, LinkUp, PingEvent,
    ReactorEvent, ReactorStateEvent, TimerEvent, TokenMgntEvent, TokenMgntKind,
};

impl Reactor {
    /// Process queued worker events and read every ready link
    ///
    /// Waits up to `options.timeout` for something to happen first. Callbacks
    /// run on the calling task. Not allowed inside callbacks.
    pub async fn dispatch(&self, options: DispatchOptions) -> ReactorResult<DispatchSummary> {
        self.ensure_not_in_callback("dispatch")?;
        let _dispatching = self.inner.dispatch_lock.lock().await;

        let state = self.state();
        if matches!(state, ReactorState::Init | ReactorState::ShutDown) {
            return Err(ReactorError::NotActive { state });
        }

        let mut ready = self.inner.notifier.wait(options.timeout).await;
        let mut summary = DispatchSummary::default();

        for event in self.inner.reactor_queue.drain_all() {
            summary.events += 1;
            self.process_event(event);
        }

        // Links brought up above signal themselves to pick up buffered data
        ready.extend(self.inner.notifier.poll_ready());
        for token in ready {
            if token == QUEUE_TOKEN {
                continue;
            }
            let channel = self.lock_core().pool.id_at(token.0 - 1);
            if let Some(channel) = channel {
                summary.frames += self.read_channel(channel);
            }
        }

        {
            let mut core = self.lock_core();
            core.stats.events_processed += summary.events as u64;
            core.stats.frames_read += summary.frames as u64;
        }
        trace!(events = summary.events, frames = summary.frames, "dispatch finished");
        Ok(summary)
    }

    fn process_event(&self, event: ReactorEvent) {
        trace!(event = event.name(), "processing worker event");
        match event {
            ReactorEvent::Channel(ChannelEventImpl { channel, kind }) => match kind {
                ChannelEventKind::ChannelUp(up) => self.on_channel_up(channel, *up),
                ChannelEventKind::ChannelDown {
                    error,
                    is_connect_failure,
                } => self.on_channel_down(channel, error, is_connect_failure, false),
                ChannelEventKind::ChannelDownReconnecting {
                    error,
                    is_connect_failure,
                } => self.on_channel_down(channel, error, is_connect_failure, true),
                ChannelEventKind::CloseChannelAck => self.on_close_ack(channel),
                other => {
                    warn!(channel = %channel, event = other.name(), "unexpected event on reactor queue")
                }
            },
            ReactorEvent::Flush(FlushEvent::Done { channel }) => self.on_flush_done(channel),
            ReactorEvent::Timer(TimerEvent::Expired { channel, expire_at }) => {
                self.on_timer_expired(channel, expire_at)
            }
            ReactorEvent::TokenMgnt(event) => self.on_token_event(event),
            ReactorEvent::CredentialRenewal(CredentialRenewalEvent::Requested {
                session,
                channel,
                user_name,
            }) => self.on_credential_request(CredentialRenewalRequest {
                channel,
                session,
                user_name,
            }),
            ReactorEvent::Ping(PingEvent { channel }) => {
                if let Ok(slot) = self.lock_core().pool.get_mut(channel) {
                    slot.stats.record_ping_sent();
                }
            }
            ReactorEvent::Reactor(ReactorStateEvent::Shutdown { error }) => {
                self.on_worker_stopped(error)
            }
            other => warn!(event = other.name(), "unexpected event on reactor queue"),
        }
    }

    fn deliver(&self, callbacks: &Arc<dyn ChannelCallbacks>, event: ChannelEvent) {
        self.with_callback_context(|| callbacks.on_channel_event(self, &event));
    }

    // ------------------------------------------------------------------------
    // Channel Lifecycle
    // ------------------------------------------------------------------------

    fn on_channel_up(&self, channel: ChannelId, up: LinkUp) {
        let LinkUp {
            link,
            activity,
            epoch,
            connection_index,
            setup_timeout,
        } = up;

        let (callbacks, plan, session) = {
            let mut core = self.lock_core();
            let slot = match core.pool.get_mut(channel) {
                Ok(slot)
                    if matches!(
                        slot.queue,
                        ChannelQueue::Initializing | ChannelQueue::Reconnecting
                    ) =>
                {
                    slot
                }
                _ => {
                    debug!(channel = %channel, "link up for a channel not waiting for one");
                    return;
                }
            };
            slot.reset_link_state();
            slot.link = Some(link.clone());
            slot.activity = Some(activity);
            slot.epoch = epoch;
            slot.connection_index = connection_index;
            slot.setup_state = ChannelSetupState::Init;
            let taken = (slot.callbacks.clone(), slot.plan.clone(), slot.session);
            let _ = core.pool.move_to(channel, ChannelQueue::Active);
            taken
        };

        let readiness = self.inner.notifier.register(link_token(channel.index()));
        link.set_readiness(Some(readiness.clone()));
        readiness.signal();

        info!(channel = %channel, epoch, connection = connection_index, "channel up");
        if let Some(callbacks) = &callbacks {
            self.deliver(callbacks, ChannelEvent::new(channel, ChannelEventType::ChannelUp));
        }

        if plan.is_empty() {
            self.mark_ready(channel, epoch);
            return;
        }

        let deadline = Instant::now() + setup_timeout;
        {
            let mut core = self.lock_core();
            match core.pool.get_mut(channel) {
                Ok(slot) if slot.epoch == epoch && slot.has_link() => {
                    slot.setup_deadline = Some(deadline);
                }
                _ => return,
            }
            if let Err(error) = self.request_timer(&mut core, channel, deadline) {
                debug!(channel = %channel, error = %error, "setup timer not armed");
            }
        }

        let access_token = session
            .and_then(|session| self.inner.sessions.get(session))
            .and_then(|session| session.access_token());
        if let Some(request) = plan.first_request(access_token.as_deref()) {
            self.send_setup_request(channel, epoch, &request);
        }
    }

    fn send_setup_request(&self, channel: ChannelId, epoch: u64, request: &Message) {
        let written = self
            .inner
            .codec
            .encode(request)
            .map_err(ReactorError::from)
            .and_then(|frame| self.write_frame(channel, frame));
        match written {
            Ok(()) => trace!(channel = %channel, request = request.kind(), "setup request written"),
            Err(ReactorError::Codec(error)) => {
                self.fail_channel(channel, epoch, ErrorInfo::from(&error))
            }
            Err(error) => {
                debug!(channel = %channel, request = request.kind(), error = %error, "setup request not written")
            }
        }
    }

    fn mark_ready(&self, channel: ChannelId, epoch: u64) {
        let callbacks = {
            let mut core = self.lock_core();
            let slot = match core.pool.get_mut(channel) {
                Ok(slot) if slot.epoch == epoch && slot.has_link() => slot,
                _ => return,
            };
            if !slot.setup_state.can_transition_to(ChannelSetupState::Ready) {
                return;
            }
            slot.setup_state = ChannelSetupState::Ready;
            slot.setup_deadline = None;
            let callbacks = slot.callbacks.clone();
            let _ = self.send_to_worker(
                &mut core,
                ReactorEvent::channel(channel, ChannelEventKind::ChannelReady { epoch }),
            );
            callbacks
        };

        info!(channel = %channel, epoch, "channel ready");
        if let Some(callbacks) = &callbacks {
            self.deliver(callbacks, ChannelEvent::new(channel, ChannelEventType::ChannelReady));
        }
    }

    fn on_channel_down(
        &self,
        channel: ChannelId,
        error: ErrorInfo,
        is_connect_failure: bool,
        reconnecting: bool,
    ) {
        let callbacks = {
            let mut core = self.lock_core();
            let slot = match core.pool.get_mut(channel) {
                Ok(slot) if slot.queue != ChannelQueue::Closing => slot,
                _ => return,
            };
            if let Some(link) = slot.reset_link_state() {
                link.set_readiness(None);
            }
            if reconnecting && slot.setup_state != ChannelSetupState::Reconnecting {
                slot.setup_state = ChannelSetupState::Reconnecting;
            }
            let callbacks = slot.callbacks.clone();
            self.inner.notifier.unregister(link_token(channel.index()));
            let queue = if reconnecting {
                ChannelQueue::Reconnecting
            } else {
                ChannelQueue::Inactive
            };
            let _ = core.pool.move_to(channel, queue);
            callbacks
        };

        let kind = if reconnecting {
            warn!(channel = %channel, error = %error, is_connect_failure, "channel down, reconnecting");
            ChannelEventType::ChannelDownReconnecting
        } else {
            error!(channel = %channel, error = %error, is_connect_failure, "channel down");
            ChannelEventType::ChannelDown
        };
        if let Some(callbacks) = &callbacks {
            self.deliver(
                callbacks,
                ChannelEvent::down(channel, kind, error, is_connect_failure),
            );
        }

        if reconnecting {
            let mut core = self.lock_core();
            let still_reconnecting = core
                .pool
                .get(channel)
                .is_ok_and(|slot| slot.queue == ChannelQueue::Reconnecting);
            if still_reconnecting {
                let _ = self.send_to_worker(
                    &mut core,
                    ReactorEvent::channel(channel, ChannelEventKind::StartReconnect),
                );
            }
        }
    }

    fn on_close_ack(&self, channel: ChannelId) {
        let mut core = self.lock_core();
        let closing = core
            .pool
            .get(channel)
            .is_ok_and(|slot| slot.queue == ChannelQueue::Closing);
        if closing && core.pool.release(channel).is_ok() {
            debug!(channel = %channel, "channel released to pool");
        }
    }

    fn on_worker_stopped(&self, error: Option<ErrorInfo>) {
        let Some(error) = error else {
            debug!(reactor = %self.inner.id, "worker stopped");
            return;
        };
        error!(reactor = %self.inner.id, error = %error, "worker stopped");

        let mut downed = Vec::new();
        {
            let mut core = self.lock_core();
            if core.state.can_transition_to(ReactorState::Error) {
                core.state = ReactorState::Error;
            }
            for channel in core.pool.live_channels() {
                let Ok(slot) = core.pool.get_mut(channel) else {
                    continue;
                };
                let queue = slot.queue;
                match queue {
                    // No acknowledgement will arrive for these
                    ChannelQueue::Closing => {
                        let _ = core.pool.release(channel);
                    }
                    ChannelQueue::Initializing | ChannelQueue::Active | ChannelQueue::Reconnecting => {
                        if let Some(link) = slot.reset_link_state() {
                            link.set_readiness(None);
                        }
                        let is_connect_failure = slot.setup_state != ChannelSetupState::Ready;
                        let callbacks = slot.callbacks.clone();
                        self.inner.notifier.unregister(link_token(channel.index()));
                        let _ = core.pool.move_to(channel, ChannelQueue::Inactive);
                        downed.push((channel, callbacks, is_connect_failure));
                    }
                    ChannelQueue::Inactive | ChannelQueue::Pool => {}
                }
            }
        }

        for (channel, callbacks, is_connect_failure) in downed {
            if let Some(callbacks) = &callbacks {
                self.deliver(
                    callbacks,
                    ChannelEvent::down(
                        channel,
                        ChannelEventType::ChannelDown,
                        error.clone(),
                        is_connect_failure,
                    ),
                );
            }
        }
    }

    /// Report a failure seen on the link of `epoch`, if it is still current
    fn fail_channel(&self, channel: ChannelId, epoch: u64, error: ErrorInfo) {
        let mut core = self.lock_core();
        let current = core
            .pool
            .get(channel)
            .is_ok_and(|slot| slot.epoch == epoch && slot.has_link());
        if current {
            self.report_failure(&mut core, channel, error);
        }
    }

    // ------------------------------------------------------------------------
    // Flush and Timers
    // ------------------------------------------------------------------------

    fn on_flush_done(&self, channel: ChannelId) {
        let frame = match self.lock_core().pool.get_mut(channel) {
            Ok(slot) => {
                slot.requested_flush = false;
                slot.write_again.take()
            }
            Err(_) => return,
        };
        if let Some(frame) = frame {
            if let Err(error) = self.write_frame(channel, frame) {
                debug!(channel = %channel, error = %error, "parked write dropped");
            }
        }
    }

    fn on_timer_expired(&self, channel: ChannelId, expire_at: Instant) {
        let mut core = self.lock_core();
        let deadline = match core.pool.get_mut(channel) {
            Ok(slot) => {
                if slot.last_requested_expire == Some(expire_at) {
                    slot.last_requested_expire = None;
                }
                if !slot.has_link() || slot.setup_state.is_ready() {
                    return;
                }
                match slot.setup_deadline {
                    Some(deadline) => deadline,
                    None => return,
                }
            }
            Err(_) => return,
        };

        if deadline <= Instant::now() {
            self.report_failure(
                &mut core,
                channel,
                ErrorInfo::new(ErrorCode::InitializationTimeout, "channel setup timed out"),
            );
        } else if let Err(error) = self.request_timer(&mut core, channel, deadline) {
            debug!(channel = %channel, error = %error, "setup timer not re-armed");
        }
    }

    // ------------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------------

    fn on_token_event(&self, event: TokenMgntEvent) {
        let TokenMgntEvent {
            channel,
            session,
            kind,
        } = event;

        let (callbacks, ready_login, epoch) = {
            let core = self.lock_core();
            match core.pool.get(channel) {
                Ok(slot) => {
                    let ready_login = slot.setup_state.is_ready() && slot.has_link();
                    (
                        slot.callbacks.clone(),
                        ready_login.then(|| slot.plan.clone()),
                        slot.epoch,
                    )
                }
                Err(_) => return,
            }
        };
        let Some(callbacks) = callbacks else {
            return;
        };

        match kind {
            TokenMgntKind::Reissued(token) => {
                debug!(channel = %channel, session = %session, "token reissued");
                let event = AuthTokenEvent {
                    channel,
                    session,
                    token: Some(token.clone()),
                    error: None,
                };
                self.with_callback_context(|| callbacks.on_auth_token_event(self, &event));
                if let Some(request) = ready_login
                    .and_then(|plan| plan.first_request(Some(&token.access_token)))
                {
                    self.send_setup_request(channel, epoch, &request);
                }
            }
            TokenMgntKind::RenewalFailed(error) => {
                let event = AuthTokenEvent {
                    channel,
                    session,
                    token: None,
                    error: Some(error),
                };
                self.with_callback_context(|| callbacks.on_auth_token_event(self, &event));
            }
            TokenMgntKind::ChannelWarning(error) => {
                warn!(channel = %channel, session = %session, error = %error, "token renewal exhausted");
                let event = AuthTokenEvent {
                    channel,
                    session,
                    token: None,
                    error: Some(error.clone()),
                };
                self.with_callback_context(|| callbacks.on_auth_token_event(self, &event));
                self.deliver(&callbacks, ChannelEvent::warning(channel, error));
            }
            TokenMgntKind::RenewToken => {
                warn!(channel = %channel, "renewal request on reactor queue")
            }
        }
    }

    fn on_credential_request(&self, request: CredentialRenewalRequest) {
        let callbacks = match self.lock_core().pool.get(request.channel) {
            Ok(slot) => slot.callbacks.clone(),
            Err(_) => None,
        };
        match callbacks {
            Some(callbacks) => {
                self.with_callback_context(|| callbacks.on_credential_renewal(self, &request))
            }
            None => debug!(session = %request.session, "credential request for a released channel"),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read until the link would block; returns the number of frames read
    fn read_channel(&self, channel: ChannelId) -> usize {
        let (link, activity, epoch) = {
            let core = self.lock_core();
            match core.pool.get(channel) {
                Ok(slot) if slot.queue == ChannelQueue::Active => {
                    match (&slot.link, &slot.activity) {
                        (Some(link), Some(activity)) => {
                            (link.clone(), activity.clone(), slot.epoch)
                        }
                        _ => return 0,
                    }
                }
                _ => return 0,
            }
        };

        let mut frames = 0;
        loop {
            match link.read() {
                Ok(ReadOutcome::Frame(frame)) => {
                    activity.touch_read(Instant::now());
                    frames += 1;
                    if !self.handle_frame(channel, epoch, &frame) {
                        break;
                    }
                }
                Ok(ReadOutcome::Ping) => {
                    activity.touch_read(Instant::now());
                    self.on_ping_received(channel, epoch);
                }
                Ok(ReadOutcome::WouldBlock) => break,
                Err(error) => {
                    self.fail_channel(channel, epoch, ErrorInfo::from(&error));
                    break;
                }
            }
        }
        frames
    }

    /// Decode one frame and route it; false once the link should not be read further
    fn handle_frame(&self, channel: ChannelId, epoch: u64, frame: &[u8]) -> bool {
        let message = match self.inner.codec.decode(frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(channel = %channel, error = %error, "undecodable frame");
                self.fail_channel(channel, epoch, ErrorInfo::from(&error));
                return false;
            }
        };

        let (callbacks, progress) = {
            let mut core = self.lock_core();
            let slot = match core.pool.get_mut(channel) {
                Ok(slot) if slot.epoch == epoch && slot.has_link() => slot,
                _ => return false,
            };
            slot.stats.record_read(frame.len());
            let from = slot.setup_state;
            let progress = match slot.plan.advance(from, &message) {
                Ok(SetupProgress::Advanced { state, .. }) if !from.can_transition_to(state) => {
                    Err(SetupError::InvalidTransition { from, to: state })
                }
                other => other,
            };
            if let Ok(SetupProgress::Advanced { state, .. }) = &progress {
                slot.setup_state = *state;
            }
            (slot.callbacks.clone(), progress)
        };

        match progress {
            Ok(SetupProgress::NotSetup) => {
                if let Some(callbacks) = &callbacks {
                    self.with_callback_context(|| callbacks.on_message(self, channel, &message));
                }
                true
            }
            Ok(SetupProgress::Advanced {
                state,
                request,
                ready,
            }) => {
                debug!(channel = %channel, state = ?state, "setup advanced");
                if let Some(callbacks) = &callbacks {
                    self.deliver(
                        callbacks,
                        ChannelEvent::new(channel, ChannelEventType::SetupStateChanged(state)),
                    );
                }
                if let Some(request) = request {
                    self.send_setup_request(channel, epoch, &request);
                }
                if ready {
                    self.mark_ready(channel, epoch);
                }
                true
            }
            Err(error) => {
                warn!(channel = %channel, error = %error, "setup failed");
                self.fail_channel(channel, epoch, ErrorInfo::from(&error));
                false
            }
        }
    }

    fn on_ping_received(&self, channel: ChannelId, epoch: u64) {
        let callbacks = {
            let mut core = self.lock_core();
            match core.pool.get_mut(channel) {
                Ok(slot) if slot.epoch == epoch => {
                    slot.stats.record_ping_received();
                    if slot.stats.flags().ping {
                        slot.callbacks.clone()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(callbacks) = &callbacks {
            self.deliver(callbacks, ChannelEvent::new(channel, ChannelEventType::PingObserved));
        }
    }
}

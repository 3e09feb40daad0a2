//! Reactor: the application-facing side of the engine
//!
//! The [`Reactor`] owns the channel pool and is driven by the application
//! calling [`Reactor::dispatch`]. Dispatch waits on the reactor's notifier,
//! processes every event the worker queued (state transitions plus exactly one
//! callback each) and reads every ready link until it would block.
//!
//! ## Locking
//!
//! The interface lock guards the pool and the reactor state. It is held only to
//! inspect or move slots, never across link I/O or application callbacks.
//! While a callback runs, the calling thread is marked as in-callback and
//! operations that restructure the pool are refused on it.

mod dispatch;
pub mod pool;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

use feedmux_core::{
    ChannelId, ChannelStatistics, ConfigError, ConnectOptions, CredentialRenewal, ErrorInfo,
    EventQueue, Message, MessageCodec, Notifier, ReactorConfig, ReactorError, ReactorId,
    ReactorResult, ReactorState, SessionId, Token, WriteOutcome,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::callbacks::ChannelCallbacks;
use crate::event::{
    ChannelEventKind, CredentialRenewalEvent, FlushEvent, NewChannelSpec, ReactorEvent,
    ReactorStateEvent, TimerEvent, TokenMgntEvent, TokenMgntKind, TokenSessionEvent,
};
use crate::managers::TokenSessionRegistry;
use pool::ChannelPool;

pub use pool::{ChannelInfo, ChannelQueue};

/// Notifier token of the reactor's own event queue
pub(crate) const QUEUE_TOKEN: Token = Token(0);

pub(crate) fn link_token(index: u32) -> Token {
    Token(index as usize + 1)
}

// ----------------------------------------------------------------------------
// Dispatch Options
// ----------------------------------------------------------------------------

/// Options for one [`Reactor::dispatch`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// `None` waits until something happens; zero polls
    pub timeout: Option<Duration>,
}

impl DispatchOptions {
    pub fn poll() -> Self {
        Self {
            timeout: Some(Duration::ZERO),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn blocking() -> Self {
        Self { timeout: None }
    }
}

/// What one dispatch call processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Worker events processed
    pub events: usize,
    /// Inbound frames read
    pub frames: usize,
}

/// Reactor-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub events_processed: u64,
    pub frames_read: u64,
    pub channel_failures: u64,
}

// ----------------------------------------------------------------------------
// Reactor
// ----------------------------------------------------------------------------

pub(crate) struct ReactorCore {
    pub state: ReactorState,
    pub pool: ChannelPool,
    pub stats: ReactorStats,
}

pub(crate) struct ReactorInner {
    pub id: ReactorId,
    pub config: ReactorConfig,
    pub core: Mutex<ReactorCore>,
    pub callback_thread: Mutex<Option<ThreadId>>,
    pub notifier: Notifier,
    pub reactor_queue: Arc<EventQueue<ReactorEvent>>,
    pub worker_queue: Arc<EventQueue<ReactorEvent>>,
    pub dispatch_lock: tokio::sync::Mutex<()>,
    pub worker: Mutex<Option<JoinHandle<Result<(), ErrorInfo>>>>,
    pub sessions: Arc<TokenSessionRegistry>,
    pub codec: Arc<dyn MessageCodec>,
    pub has_token_service: bool,
}

impl Drop for ReactorInner {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = worker.take() {
            handle.abort();
        }
    }
}

/// Handle to a reactor; clones share the same reactor
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl core::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the current thread as running a callback until dropped
struct CallbackGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
    previous: Option<ThreadId>,
}

impl<'a> CallbackGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        let current = std::thread::current().id();
        let previous = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(current);
        Self { slot, previous }
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = self.previous;
    }
}

impl Reactor {
    pub(crate) fn from_inner(inner: Arc<ReactorInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, ReactorCore> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ReactorId {
        self.inner.id
    }

    pub fn state(&self) -> ReactorState {
        self.lock_core().state
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ReactorStats {
        self.lock_core().stats
    }

    /// Registry of token sessions used by this reactor's channels
    pub fn token_sessions(&self) -> &TokenSessionRegistry {
        &self.inner.sessions
    }

    // ------------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------------

    fn in_callback(&self) -> bool {
        let current = std::thread::current().id();
        *self
            .inner
            .callback_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(current)
    }

    fn ensure_not_in_callback(&self, operation: &'static str) -> ReactorResult<()> {
        if self.in_callback() {
            return Err(ReactorError::CalledFromCallback { operation });
        }
        Ok(())
    }

    fn ensure_active(state: ReactorState) -> ReactorResult<()> {
        if state.is_active() {
            Ok(())
        } else {
            Err(ReactorError::NotActive { state })
        }
    }

    pub(crate) fn with_callback_context<R>(&self, callback: impl FnOnce() -> R) -> R {
        let _guard = CallbackGuard::enter(&self.inner.callback_thread);
        callback()
    }

    /// Queue an event for the worker; a closed queue moves the reactor to `Error`
    pub(crate) fn send_to_worker(&self, core: &mut ReactorCore, event: ReactorEvent) -> ReactorResult<()> {
        match self.inner.worker_queue.push(event) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                let name = rejected.into_inner().name();
                if core.state.can_transition_to(ReactorState::Error) {
                    error!(reactor = %self.inner.id, event = name, "worker queue closed");
                    core.state = ReactorState::Error;
                }
                Err(ReactorError::NotActive { state: core.state })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Channel Management
    // ------------------------------------------------------------------------

    /// Open a channel
    ///
    /// The worker connects in the background; the outcome arrives through
    /// `callbacks` during later dispatch calls. Not allowed inside callbacks.
    pub fn connect(
        &self,
        options: ConnectOptions,
        callbacks: Arc<dyn ChannelCallbacks>,
    ) -> ReactorResult<ChannelId> {
        self.ensure_not_in_callback("connect")?;
        options.validate()?;
        let session_managed = options.is_session_managed();
        if session_managed && !self.inner.has_token_service {
            return Err(ConfigError::invalid(
                "session-managed connections need a reactor built with a token service",
            )
            .into());
        }

        let mut core = self.lock_core();
        Self::ensure_active(core.state)?;
        let channel = core.pool.allocate()?;

        let registration = match (&options.credentials, session_managed) {
            (Some(credentials), true) => {
                Some(self.inner.sessions.register_channel(channel, credentials))
            }
            _ => None,
        };
        let session = registration.as_ref().map(|(session, _)| session.id());

        if let Ok(slot) = core.pool.get_mut(channel) {
            slot.open(options.setup.clone(), options.statistics, callbacks, session);
        }

        let connections = options.connections.len();
        let mut pushed = Ok(());
        if let Some((session, true)) = &registration {
            pushed = self.send_to_worker(
                &mut core,
                ReactorEvent::TokenSession(TokenSessionEvent::AddSession {
                    session: session.id(),
                }),
            );
        }
        if pushed.is_ok() {
            pushed = self.send_to_worker(
                &mut core,
                ReactorEvent::channel(
                    channel,
                    ChannelEventKind::NewChannel(Box::new(NewChannelSpec { options, session })),
                ),
            );
        }
        if let Err(error) = pushed {
            if session.is_some() {
                self.inner.sessions.unregister_channel(channel);
            }
            let _ = core.pool.release(channel);
            return Err(error);
        }

        core.stats.channels_opened += 1;
        drop(core);

        info!(channel = %channel, connections, session = ?session, "channel connecting");
        Ok(channel)
    }

    /// Close a channel and release its slot once the worker acknowledges
    ///
    /// Not allowed inside callbacks.
    pub fn close_channel(&self, channel: ChannelId) -> ReactorResult<()> {
        self.ensure_not_in_callback("close_channel")?;

        let mut core = self.lock_core();
        if core.state == ReactorState::ShutDown {
            return Err(ReactorError::NotActive { state: core.state });
        }

        let slot = core.pool.get_mut(channel)?;
        if slot.queue == ChannelQueue::Closing {
            return Ok(());
        }
        let session = slot.session;
        let link = slot.reset_link_state();
        if let Some(link) = link {
            link.set_readiness(None);
            self.inner.notifier.unregister(link_token(channel.index()));
        }
        core.stats.channels_closed += 1;

        // Without a worker no acknowledgement will come; free the slot here
        let mut handed_off = core.state.is_active();
        if handed_off {
            core.pool.move_to(channel, ChannelQueue::Closing)?;
            if let Some(session) = session {
                handed_off = self
                    .send_to_worker(
                        &mut core,
                        ReactorEvent::TokenSession(TokenSessionEvent::UnregisterChannel {
                            session,
                            channel,
                        }),
                    )
                    .is_ok();
            }
            handed_off = handed_off
                && self
                    .send_to_worker(
                        &mut core,
                        ReactorEvent::channel(channel, ChannelEventKind::CloseChannel),
                    )
                    .is_ok();
        }
        if !handed_off {
            if session.is_some() {
                self.inner.sessions.unregister_channel(channel);
            }
            core.pool.release(channel)?;
            drop(core);
            info!(channel = %channel, "channel released without worker");
            return Ok(());
        }
        drop(core);

        info!(channel = %channel, "channel closing");
        Ok(())
    }

    /// Encode and write a message; allowed inside callbacks
    ///
    /// A write the link cannot take right now is parked and flushed by the
    /// worker. While it is parked, further submits on the channel fail with
    /// [`ReactorError::WritePending`].
    pub fn submit(&self, channel: ChannelId, message: &Message) -> ReactorResult<()> {
        let frame = self.inner.codec.encode(message)?;
        self.write_frame(channel, frame)
    }

    pub(crate) fn write_frame(&self, channel: ChannelId, frame: Vec<u8>) -> ReactorResult<()> {
        let (link, activity, epoch) = {
            let core = self.lock_core();
            Self::ensure_active(core.state)?;
            let slot = core.pool.get(channel)?;
            if slot.write_again.is_some() {
                return Err(ReactorError::WritePending { channel });
            }
            match (&slot.link, slot.queue) {
                (Some(link), ChannelQueue::Active) => {
                    (link.clone(), slot.activity.clone(), slot.epoch)
                }
                _ => return Err(ReactorError::ChannelNotActive { channel }),
            }
        };

        let length = frame.len();
        let outcome = link.write(frame);

        let mut core = self.lock_core();
        let slot = match core.pool.get_mut(channel) {
            Ok(slot) if slot.epoch == epoch && slot.has_link() => slot,
            _ => return Err(ReactorError::ChannelNotActive { channel }),
        };

        match outcome {
            Ok(WriteOutcome::Written { pending }) => {
                slot.stats.record_write(length);
                if let Some(activity) = activity {
                    activity.touch_write(Instant::now());
                }
                if pending > 0 {
                    self.request_flush(&mut core, channel)?;
                }
                Ok(())
            }
            Ok(WriteOutcome::WouldBlock(frame)) => {
                if slot.write_again.is_some() {
                    return Err(ReactorError::WritePending { channel });
                }
                debug!(channel = %channel, bytes = length, "write blocked, parking for flush");
                slot.write_again = Some(frame);
                self.request_flush(&mut core, channel)
            }
            Err(error) => {
                warn!(channel = %channel, error = %error, "write failed");
                self.report_failure(&mut core, channel, ErrorInfo::from(&error));
                Err(error.into())
            }
        }
    }

    fn request_flush(&self, core: &mut ReactorCore, channel: ChannelId) -> ReactorResult<()> {
        let slot = core.pool.get_mut(channel)?;
        if slot.requested_flush {
            return Ok(());
        }
        slot.requested_flush = true;
        self.send_to_worker(core, ReactorEvent::Flush(FlushEvent::Start { channel }))
    }

    /// Stop using the channel's link and let the worker decide what follows
    pub(crate) fn report_failure(&self, core: &mut ReactorCore, channel: ChannelId, error: ErrorInfo) {
        let (link, epoch) = match core.pool.get_mut(channel) {
            Ok(slot) if slot.has_link() => {
                let epoch = slot.epoch;
                (slot.reset_link_state(), epoch)
            }
            _ => return,
        };
        if let Some(link) = link {
            link.set_readiness(None);
        }
        self.inner.notifier.unregister(link_token(channel.index()));
        core.stats.channel_failures += 1;

        warn!(channel = %channel, error = %error, "channel failed on reactor");
        if let Err(error) = self.send_to_worker(
            core,
            ReactorEvent::channel(channel, ChannelEventKind::ChannelFailed { epoch, error }),
        ) {
            warn!(channel = %channel, error = %error, "channel failure not reported to worker");
        }
    }

    // ------------------------------------------------------------------------
    // Token Sessions
    // ------------------------------------------------------------------------

    /// Renew the channel's session token now; allowed inside callbacks
    pub fn request_token_renewal(&self, channel: ChannelId) -> ReactorResult<()> {
        let mut core = self.lock_core();
        Self::ensure_active(core.state)?;
        let session = core
            .pool
            .get(channel)?
            .session
            .ok_or(ReactorError::NotSessionManaged { channel })?;
        self.send_to_worker(
            &mut core,
            ReactorEvent::TokenMgnt(TokenMgntEvent {
                channel,
                session,
                kind: TokenMgntKind::RenewToken,
            }),
        )
    }

    /// Answer a credential-renewal callback; allowed inside callbacks
    pub fn submit_credential_renewal(
        &self,
        session: SessionId,
        renewal: CredentialRenewal,
    ) -> ReactorResult<()> {
        if self.inner.sessions.get(session).is_none() {
            return Err(ReactorError::UnknownSession { session });
        }
        let mut core = self.lock_core();
        Self::ensure_active(core.state)?;
        self.send_to_worker(
            &mut core,
            ReactorEvent::CredentialRenewal(CredentialRenewalEvent::Submitted { session, renewal }),
        )
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn channel_info(&self, channel: ChannelId) -> ReactorResult<ChannelInfo> {
        self.lock_core().pool.info(channel)
    }

    /// Current counters, optionally zeroing them
    pub fn channel_statistics(
        &self,
        channel: ChannelId,
        reset: bool,
    ) -> ReactorResult<ChannelStatistics> {
        let mut core = self.lock_core();
        let slot = core.pool.get_mut(channel)?;
        Ok(if reset {
            slot.stats.take()
        } else {
            slot.stats.snapshot()
        })
    }

    /// Channels currently in `queue`
    pub fn channels(&self, queue: ChannelQueue) -> Vec<ChannelId> {
        self.lock_core().pool.members(queue)
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Ask the worker for a timer event, unless an earlier one is outstanding
    pub(crate) fn request_timer(
        &self,
        core: &mut ReactorCore,
        channel: ChannelId,
        expire_at: Instant,
    ) -> ReactorResult<()> {
        let slot = core.pool.get_mut(channel)?;
        if slot
            .last_requested_expire
            .is_some_and(|requested| requested <= expire_at)
        {
            return Ok(());
        }
        slot.last_requested_expire = Some(expire_at);
        self.send_to_worker(
            core,
            ReactorEvent::Timer(TimerEvent::Request { channel, expire_at }),
        )
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop the worker and release every link
    ///
    /// Not allowed inside callbacks. Later calls return `Ok` without effect.
    pub async fn shutdown(&self) -> ReactorResult<()> {
        self.ensure_not_in_callback("shutdown")?;

        let handle = {
            let mut core = self.lock_core();
            if core.state == ReactorState::ShutDown {
                return Ok(());
            }
            core.state = ReactorState::ShutDown;
            let _ = self
                .inner
                .worker_queue
                .push(ReactorEvent::Reactor(ReactorStateEvent::Shutdown { error: None }));

            for channel in core.pool.live_channels() {
                if let Ok(slot) = core.pool.get_mut(channel) {
                    if let Some(link) = slot.reset_link_state() {
                        link.set_readiness(None);
                    }
                }
                self.inner.notifier.unregister(link_token(channel.index()));
            }

            self.inner
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        };

        let result = match handle {
            Some(handle) => match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ReactorError::WorkerFailed { reason: error.text }),
                Err(error) => Err(ReactorError::WorkerFailed {
                    reason: error.to_string(),
                }),
            },
            None => Ok(()),
        };
        self.inner.reactor_queue.close();
        info!(reactor = %self.inner.id, "reactor shut down");
        result
    }
}

//! Token sessions shared by channels with identical credentials
//!
//! A [`TokenSession`] holds the current access token for one credential set
//! and the list of channels that use it. Its state sits behind a lock owned by
//! the session alone, separate from the reactor's interface lock, because the
//! reactor registers channels while the worker renews tokens and unregisters
//! channels.
//!
//! Invariants kept here:
//! - at most one renewal request is in flight per session
//! - the failure count returns to zero after any successful renewal
//! - a channel is listed by at most one session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use feedmux_core::token::{renewal_delay, retry_interval};
use feedmux_core::{
    AccessToken, ChannelId, CredentialKey, CredentialRenewal, OAuthCredentials, SessionId,
    TokenGrant, TokenRequest,
};
use tokio::time::Instant;
use tracing::debug;

// ----------------------------------------------------------------------------
// Token Session
// ----------------------------------------------------------------------------

/// Counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenSessionStats {
    pub requests_started: u64,
    pub renewals: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct TokenSessionState {
    credentials: OAuthCredentials,
    token: Option<AccessToken>,
    issued_at: Option<Instant>,
    channels: Vec<ChannelId>,
    in_flight: bool,
    awaiting_credentials: bool,
    renewal_supplied: bool,
    failed_attempts: u32,
    /// Retries ran out; the next request starts a new cycle
    exhausted: bool,
    next_renewal: Option<Instant>,
    stats: TokenSessionStats,
}

/// Outcome of asking a session to start a renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginRequest {
    /// A request or a credential prompt is already outstanding
    AlreadyInFlight,
    /// Ask the application for secrets before the password grant
    NeedCredentials {
        user_name: String,
        channel: ChannelId,
    },
    /// Issue this grant now
    Start {
        grant: TokenGrant,
        client_id: String,
        scope: String,
    },
}

/// Bookkeeping after a failed renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalFailure {
    pub channels: Vec<ChannelId>,
    pub attempts: u32,
    /// The attempt limit was reached; no automatic retry is scheduled
    pub exhausted: bool,
}

/// Credential-scoped token holder
#[derive(Debug)]
pub struct TokenSession {
    id: SessionId,
    key: CredentialKey,
    state: Mutex<TokenSessionState>,
}

impl TokenSession {
    fn new(id: SessionId, credentials: OAuthCredentials) -> Self {
        Self {
            id,
            key: credentials.key(),
            state: Mutex::new(TokenSessionState {
                credentials,
                token: None,
                issued_at: None,
                channels: Vec::new(),
                in_flight: false,
                awaiting_credentials: false,
                renewal_supplied: false,
                failed_attempts: 0,
                exhausted: false,
                next_renewal: None,
                stats: TokenSessionStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenSessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &CredentialKey {
        &self.key
    }

    pub fn current_token(&self) -> Option<AccessToken> {
        self.lock().token.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock()
            .token
            .as_ref()
            .map(|token| token.access_token.clone())
    }

    pub fn issued_at(&self) -> Option<Instant> {
        self.lock().issued_at
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.lock().channels.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().channels.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn failed_attempts(&self) -> u32 {
        self.lock().failed_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    pub fn next_renewal(&self) -> Option<Instant> {
        let state = self.lock();
        if state.in_flight || state.awaiting_credentials {
            None
        } else {
            state.next_renewal
        }
    }

    pub fn stats(&self) -> TokenSessionStats {
        self.lock().stats
    }

    /// Whether a scheduled renewal or retry is due
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_renewal().is_some_and(|at| at <= now)
    }

    fn add_channel(&self, channel: ChannelId) -> bool {
        let mut state = self.lock();
        if state.channels.contains(&channel) {
            return false;
        }
        state.channels.push(channel);
        true
    }

    fn remove_channel(&self, channel: ChannelId) -> bool {
        let mut state = self.lock();
        let before = state.channels.len();
        state.channels.retain(|existing| *existing != channel);
        state.channels.len() != before
    }

    /// Try to start a renewal
    ///
    /// Uses the refresh token when one is held unless `force_password` is set.
    /// Password grants for credentials with `use_renewal_callback` first wait
    /// for [`TokenSession::supply_credentials`]. An exhausted session schedules
    /// nothing itself, so a request reaching it starts a new retry cycle.
    pub fn begin_request(&self, force_password: bool) -> BeginRequest {
        let mut state = self.lock();
        if state.in_flight || state.awaiting_credentials {
            return BeginRequest::AlreadyInFlight;
        }
        if state.exhausted {
            debug!(session = %self.id, attempts = state.failed_attempts, "starting a new renewal cycle");
            state.exhausted = false;
            state.failed_attempts = 0;
            state.next_renewal = None;
        }

        let refresh_token = if force_password {
            None
        } else {
            state
                .token
                .as_ref()
                .and_then(|token| token.refresh_token.clone())
        };
        let grant = TokenRequest::grant_for(&state.credentials, refresh_token.as_deref());

        // With no channel to prompt through, the stored password is used
        let prompt_channel = state.channels.first().copied();
        if let Some(channel) = prompt_channel {
            if matches!(grant, TokenGrant::Password { .. })
                && state.credentials.use_renewal_callback
                && !state.renewal_supplied
            {
                state.awaiting_credentials = true;
                return BeginRequest::NeedCredentials {
                    user_name: state.credentials.user_name.clone(),
                    channel,
                };
            }
        }

        state.in_flight = true;
        state.renewal_supplied = false;
        state.stats.requests_started += 1;
        BeginRequest::Start {
            grant,
            client_id: state.credentials.client_id.clone(),
            scope: state.credentials.scope.clone(),
        }
    }

    /// Apply secrets from the application; returns whether a prompt was pending
    pub fn supply_credentials(&self, renewal: &CredentialRenewal) -> bool {
        let mut state = self.lock();
        state.credentials.apply_renewal(renewal);
        state.renewal_supplied = true;
        std::mem::replace(&mut state.awaiting_credentials, false)
    }

    /// Store a fresh token and schedule its renewal
    pub fn complete_success(&self, token: AccessToken, now: Instant, ratio: f64) -> Vec<ChannelId> {
        let mut state = self.lock();
        let delay = renewal_delay(token.expires_in, ratio);
        state.token = Some(token);
        state.issued_at = Some(now);
        state.in_flight = false;
        state.failed_attempts = 0;
        state.exhausted = false;
        state.next_renewal = Some(now + delay);
        state.stats.renewals += 1;
        debug!(session = %self.id, renew_in = ?delay, "token renewed");
        state.channels.clone()
    }

    /// The refresh grant was rejected; the next request uses the password
    pub fn discard_refresh_token(&self) {
        let mut state = self.lock();
        state.in_flight = false;
        if let Some(token) = state.token.as_mut() {
            token.refresh_token = None;
        }
    }

    /// Count a failed renewal and schedule the retry, if any remain
    pub fn complete_failure(
        &self,
        now: Instant,
        attempt_limit: Option<u32>,
        interval: Duration,
        retry_after: Option<Duration>,
    ) -> RenewalFailure {
        let mut state = self.lock();
        state.in_flight = false;
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        state.stats.failures += 1;

        let exhausted = attempt_limit.is_some_and(|limit| state.failed_attempts >= limit);
        state.exhausted = exhausted;
        state.next_renewal = if exhausted {
            None
        } else {
            Some(now + retry_interval(interval, retry_after))
        };

        RenewalFailure {
            channels: state.channels.clone(),
            attempts: state.failed_attempts,
            exhausted,
        }
    }
}

// ----------------------------------------------------------------------------
// Session Registry
// ----------------------------------------------------------------------------

/// Sessions of one reactor, looked up by credentials, id or channel
#[derive(Debug, Default)]
pub struct TokenSessionRegistry {
    by_key: DashMap<CredentialKey, Arc<TokenSession>>,
    by_id: DashMap<SessionId, Arc<TokenSession>>,
    channel_sessions: DashMap<ChannelId, SessionId>,
    next_id: AtomicU64,
}

impl TokenSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `channel` to the session for `credentials`, creating it if needed
    ///
    /// Returns the session and whether it was created by this call.
    pub fn register_channel(
        &self,
        channel: ChannelId,
        credentials: &OAuthCredentials,
    ) -> (Arc<TokenSession>, bool) {
        if let Some(previous) = self.session_of(channel) {
            if previous.key() != &credentials.key() {
                self.unregister_channel(channel);
            }
        }

        let mut created = false;
        let session = {
            let entry = self.by_key.entry(credentials.key()).or_insert_with(|| {
                created = true;
                let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
                Arc::new(TokenSession::new(id, credentials.clone()))
            });
            entry.add_channel(channel);
            entry.value().clone()
        };

        if created {
            self.by_id.insert(session.id(), session.clone());
            debug!(session = %session.id(), user = %credentials.user_name, "token session created");
        }
        self.channel_sessions.insert(channel, session.id());
        (session, created)
    }

    /// Detach `channel`; an emptied session is dropped
    pub fn unregister_channel(&self, channel: ChannelId) -> Option<SessionId> {
        let (_, session_id) = self.channel_sessions.remove(&channel)?;
        let session = self.get(session_id)?;
        session.remove_channel(channel);

        if self
            .by_key
            .remove_if(session.key(), |_, existing| {
                existing.id() == session_id && existing.is_empty()
            })
            .is_some()
        {
            self.by_id.remove(&session_id);
            debug!(session = %session_id, "token session dropped");
        }
        Some(session_id)
    }

    pub fn get(&self, session: SessionId) -> Option<Arc<TokenSession>> {
        self.by_id.get(&session).map(|entry| entry.value().clone())
    }

    pub fn session_of(&self, channel: ChannelId) -> Option<Arc<TokenSession>> {
        let session = *self.channel_sessions.get(&channel)?;
        self.get(session)
    }

    /// Snapshot of every live session
    pub fn sessions(&self) -> Vec<Arc<TokenSession>> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

//! Token renewal on the worker
//!
//! One request per session at a time; the result is fanned out to every
//! channel of the session. A rejected refresh grant falls back to the password
//! grant straight away instead of counting as a failure.

use feedmux_core::{
    AccessToken, ChannelId, CredentialRenewal, ErrorInfo, RestError, SessionId, TokenGrant,
    TokenRequest,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::channel::ChannelPhase;
use super::{TaskOutcome, Worker};
use crate::event::{CredentialRenewalEvent, ReactorEvent, TokenMgntEvent, TokenMgntKind};
use crate::managers::BeginRequest;

impl Worker {
    /// Start a renewal for `session` unless one is already outstanding
    pub(super) fn request_token(&mut self, session_id: SessionId, force_password: bool) {
        let Some(service) = self.token_service.clone() else {
            warn!(session = %session_id, "token renewal requested without a token service");
            return;
        };
        let Some(session) = self.sessions.get(session_id) else {
            trace!(session = %session_id, "renewal for a dropped session ignored");
            return;
        };

        match session.begin_request(force_password) {
            BeginRequest::AlreadyInFlight => {
                trace!(session = %session_id, "renewal already outstanding")
            }
            BeginRequest::NeedCredentials { user_name, channel } => {
                debug!(session = %session_id, channel = %channel, "asking for credentials");
                self.emit(ReactorEvent::CredentialRenewal(CredentialRenewalEvent::Requested {
                    session: session_id,
                    channel,
                    user_name,
                }));
            }
            BeginRequest::Start {
                grant,
                client_id,
                scope,
            } => {
                let refresh = matches!(grant, TokenGrant::RefreshToken { .. });
                debug!(session = %session_id, grant = grant.name(), "requesting token");
                let request = TokenRequest {
                    url: self.config.token.token_service_url.clone(),
                    client_id,
                    scope,
                    grant,
                    timeout: self.config.token.request_timeout,
                };
                let task = self.tasks.spawn(async move {
                    let timeout = request.timeout;
                    let result = tokio::time::timeout(timeout, service.request_token(request))
                        .await
                        .unwrap_or_else(|_| Err(RestError::new(None, "token request timed out")));
                    TaskOutcome::Token {
                        session: session_id,
                        refresh,
                        result,
                    }
                });
                self.token_requests.insert(session_id, task);
                self.stats.token_requests += 1;
            }
        }
    }

    pub(super) fn on_token_result(
        &mut self,
        session_id: SessionId,
        refresh: bool,
        result: Result<AccessToken, RestError>,
    ) {
        self.token_requests.remove(&session_id);
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let now = Instant::now();

        match result {
            Ok(token) => {
                let channels =
                    session.complete_success(token.clone(), now, self.config.token.reissue_ratio);
                info!(session = %session_id, channels = channels.len(), "token issued");
                for channel in channels {
                    self.emit(ReactorEvent::TokenMgnt(TokenMgntEvent {
                        channel,
                        session: session_id,
                        kind: TokenMgntKind::Reissued(token.clone()),
                    }));
                    if self.is_awaiting_token(channel) {
                        self.continue_attempt(channel);
                    }
                }
            }
            Err(error) if refresh && error.is_auth_rejection() => {
                debug!(session = %session_id, error = %error, "refresh grant rejected, using password");
                session.discard_refresh_token();
                self.request_token(session_id, true);
            }
            Err(error) => {
                let failure = session.complete_failure(
                    now,
                    self.config.token.reissue_attempt_limit,
                    self.config.token.reissue_attempt_interval,
                    error.retry_after,
                );
                warn!(
                    session = %session_id,
                    attempts = failure.attempts,
                    exhausted = failure.exhausted,
                    error = %error,
                    "token renewal failed"
                );

                let info = ErrorInfo::from(&error);
                for channel in failure.channels {
                    let kind = if failure.exhausted {
                        TokenMgntKind::ChannelWarning(info.clone())
                    } else {
                        TokenMgntKind::RenewalFailed(info.clone())
                    };
                    self.emit(ReactorEvent::TokenMgnt(TokenMgntEvent {
                        channel,
                        session: session_id,
                        kind,
                    }));
                    if failure.exhausted && self.is_awaiting_token(channel) {
                        self.fail_channel(channel, info.clone());
                    }
                }
            }
        }
    }

    fn is_awaiting_token(&self, channel: ChannelId) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|state| state.phase == ChannelPhase::AwaitingToken)
    }

    pub(super) fn on_credentials_submitted(
        &mut self,
        session_id: SessionId,
        renewal: &CredentialRenewal,
    ) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if session.supply_credentials(renewal) {
            debug!(session = %session_id, "credentials supplied, resuming renewal");
            self.request_token(session_id, true);
        }
    }

    pub(super) fn on_unregister_channel(&mut self, session_id: SessionId, channel: ChannelId) {
        self.sessions.unregister_channel(channel);
        if self.sessions.get(session_id).is_none() {
            if let Some(task) = self.token_requests.remove(&session_id) {
                task.abort();
                debug!(session = %session_id, "outstanding renewal abandoned");
            }
        }
    }

    /// Start renewals and retries that are due
    pub(super) fn poll_sessions(&mut self, now: Instant) {
        let due: Vec<SessionId> = self
            .sessions
            .sessions()
            .iter()
            .filter(|session| !session.is_empty() && session.is_due(now))
            .map(|session| session.id())
            .collect();
        for session in due {
            self.request_token(session, false);
        }
    }
}

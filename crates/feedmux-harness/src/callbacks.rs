//! Callbacks that record everything the reactor delivers

use std::sync::{Mutex, MutexGuard, PoisonError};

use feedmux_core::{ChannelId, CredentialRenewal, Message};
use feedmux_runtime::{
    AuthTokenEvent, ChannelCallbacks, ChannelEvent, ChannelEventType, CredentialRenewalRequest,
    Reactor,
};
use tracing::debug;

/// One delivered callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Channel(ChannelEvent),
    Message(ChannelId, Message),
    AuthToken(AuthTokenEvent),
    CredentialRequest(CredentialRenewalRequest),
}

type EventHook = Box<dyn Fn(&Reactor, &ChannelEvent) + Send + Sync>;

/// [`ChannelCallbacks`] implementation for tests
#[derive(Default)]
pub struct RecordingCallbacks {
    records: Mutex<Vec<Recorded>>,
    renewal: Option<CredentialRenewal>,
    hook: Option<EventHook>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer credential prompts with `renewal` from inside the callback
    pub fn with_credential_renewal(mut self, renewal: CredentialRenewal) -> Self {
        self.renewal = Some(renewal);
        self
    }

    /// Run `hook` after recording each channel event
    pub fn with_hook(mut self, hook: impl Fn(&Reactor, &ChannelEvent) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Recorded>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<Recorded> {
        self.lock().clone()
    }

    pub fn channel_events(&self, channel: ChannelId) -> Vec<ChannelEvent> {
        self.lock()
            .iter()
            .filter_map(|record| match record {
                Recorded::Channel(event) if event.channel == channel => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Kinds of the channel events for `channel`, in delivery order
    pub fn event_kinds(&self, channel: ChannelId) -> Vec<ChannelEventType> {
        self.channel_events(channel)
            .into_iter()
            .map(|event| event.kind)
            .collect()
    }

    pub fn has_event(&self, channel: ChannelId, kind: &ChannelEventType) -> bool {
        self.event_kinds(channel).contains(kind)
    }

    pub fn count_events(&self, channel: ChannelId, kind: &ChannelEventType) -> usize {
        self.event_kinds(channel)
            .iter()
            .filter(|seen| *seen == kind)
            .count()
    }

    pub fn messages(&self, channel: ChannelId) -> Vec<Message> {
        self.lock()
            .iter()
            .filter_map(|record| match record {
                Recorded::Message(from, message) if *from == channel => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn auth_events(&self) -> Vec<AuthTokenEvent> {
        self.lock()
            .iter()
            .filter_map(|record| match record {
                Recorded::AuthToken(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn credential_requests(&self) -> Vec<CredentialRenewalRequest> {
        self.lock()
            .iter()
            .filter_map(|record| match record {
                Recorded::CredentialRequest(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ChannelCallbacks for RecordingCallbacks {
    fn on_channel_event(&self, reactor: &Reactor, event: &ChannelEvent) {
        debug!(channel = %event.channel, kind = ?event.kind, "channel event");
        self.lock().push(Recorded::Channel(event.clone()));
        if let Some(hook) = &self.hook {
            hook(reactor, event);
        }
    }

    fn on_message(&self, _reactor: &Reactor, channel: ChannelId, message: &Message) {
        self.lock().push(Recorded::Message(channel, message.clone()));
    }

    fn on_auth_token_event(&self, _reactor: &Reactor, event: &AuthTokenEvent) {
        self.lock().push(Recorded::AuthToken(event.clone()));
    }

    fn on_credential_renewal(&self, reactor: &Reactor, request: &CredentialRenewalRequest) {
        self.lock().push(Recorded::CredentialRequest(request.clone()));
        if let Some(renewal) = &self.renewal {
            if let Err(error) = reactor.submit_credential_renewal(request.session, renewal.clone()) {
                debug!(session = %request.session, error = %error, "credential renewal refused");
            }
        }
    }
}

//! Readiness multiplexer
//!
//! A [`Notifier`] watches a set of registered tokens and lets one waiter block
//! until at least one of them is signalled or a timeout elapses. Event queues
//! and connected links each hold a [`Readiness`] handle for their token and call
//! [`Readiness::signal`] when they have something to offer.
//!
//! Signals are level-collapsed: signalling an already-ready token is a no-op
//! until the waiter collects it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Identifier of a readiness source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

#[derive(Debug, Default)]
struct NotifierState {
    registered: HashSet<Token>,
    ready: Vec<Token>,
    ready_set: HashSet<Token>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<NotifierState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the token became ready
    fn mark_ready(&self, token: Token) -> bool {
        let mut state = self.lock();
        if !state.registered.contains(&token) || !state.ready_set.insert(token) {
            return false;
        }
        state.ready.push(token);
        true
    }

    fn take_ready(&self) -> Vec<Token> {
        let mut state = self.lock();
        state.ready_set.clear();
        std::mem::take(&mut state.ready)
    }
}

// ----------------------------------------------------------------------------
// Readiness Handle
// ----------------------------------------------------------------------------

/// Signalling side of a registered token
///
/// Holds only a weak reference, so outstanding handles never keep a dropped
/// notifier alive.
#[derive(Debug, Clone)]
pub struct Readiness {
    token: Token,
    shared: Weak<Shared>,
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Mark the token ready and wake the waiter
    pub fn signal(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.mark_ready(self.token) {
                shared.notify.notify_one();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Notifier
// ----------------------------------------------------------------------------

/// Multiplexer over registered readiness tokens
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` and return the handle used to signal it
    pub fn register(&self, token: Token) -> Readiness {
        self.shared.lock().registered.insert(token);
        Readiness {
            token,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Stop watching `token`; pending readiness for it is discarded
    pub fn unregister(&self, token: Token) {
        let mut state = self.shared.lock();
        state.registered.remove(&token);
        if state.ready_set.remove(&token) {
            state.ready.retain(|ready| *ready != token);
        }
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.shared.lock().registered.contains(&token)
    }

    pub fn registered_count(&self) -> usize {
        self.shared.lock().registered.len()
    }

    /// Collect ready tokens without waiting
    pub fn poll_ready(&self) -> Vec<Token> {
        self.shared.take_ready()
    }

    /// Wait until a token is ready or `timeout` elapses
    ///
    /// `None` waits indefinitely and a zero timeout polls once. Returns the
    /// ready tokens in signalling order, or an empty list on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> Vec<Token> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let ready = self.shared.take_ready();
            if !ready.is_empty() {
                return ready;
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return ready;
                    }
                    let notified = self.shared.notify.notified();
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.shared.take_ready();
                    }
                }
                None => self.shared.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_signalled_tokens() {
        let notifier = Notifier::new();
        let a = notifier.register(Token(1));
        let b = notifier.register(Token(2));

        b.signal();
        a.signal();
        b.signal();

        let ready = notifier.wait(Some(Duration::from_secs(1))).await;
        assert_eq!(ready, vec![Token(2), Token(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_signal() {
        let notifier = Notifier::new();
        let _a = notifier.register(Token(1));

        let started = Instant::now();
        let ready = notifier.wait(Some(Duration::from_millis(250))).await;
        assert!(ready.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_polls() {
        let notifier = Notifier::new();
        let a = notifier.register(Token(7));
        assert!(notifier.wait(Some(Duration::ZERO)).await.is_empty());

        a.signal();
        assert_eq!(notifier.wait(Some(Duration::ZERO)).await, vec![Token(7)]);
    }

    #[tokio::test]
    async fn test_signal_from_other_task_wakes_waiter() {
        let notifier = Notifier::new();
        let readiness = notifier.register(Token(3));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            readiness.signal();
        });

        let ready = notifier.wait(None).await;
        assert_eq!(ready, vec![Token(3)]);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_tokens_are_ignored() {
        let notifier = Notifier::new();
        let readiness = notifier.register(Token(4));
        readiness.signal();
        notifier.unregister(Token(4));

        assert!(!notifier.is_registered(Token(4)));
        assert!(notifier.wait(Some(Duration::ZERO)).await.is_empty());

        readiness.signal();
        assert!(notifier.poll_ready().is_empty());
    }

    #[test]
    fn test_readiness_outlives_notifier() {
        let notifier = Notifier::new();
        let readiness = notifier.register(Token(1));
        drop(notifier);
        readiness.signal();
    }
}

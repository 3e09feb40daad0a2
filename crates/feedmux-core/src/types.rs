//! Identifier types shared by the reactor, the worker and the application
//!
//! Channel handles are plain values. A handle names the reactor that issued it,
//! the pool slot it occupies and the generation of that slot, so a handle kept
//! after its channel closed (or one issued by another reactor) is rejected
//! instead of silently aliasing a reused slot.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Reactor Identity
// ----------------------------------------------------------------------------

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a reactor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactorId(u64);

impl ReactorId {
    /// Allocate a fresh identifier
    pub fn next() -> Self {
        Self(NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactor-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Channel Handles
// ----------------------------------------------------------------------------

/// Opaque handle to a channel owned by a reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    reactor: ReactorId,
    index: u32,
    generation: u32,
}

impl ChannelId {
    pub fn new(reactor: ReactorId, index: u32, generation: u32) -> Self {
        Self {
            reactor,
            index,
            generation,
        }
    }

    /// Reactor that issued this handle
    pub fn reactor(&self) -> ReactorId {
        self.reactor
    }

    /// Pool slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at the time the handle was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ch{}.{}", self.reactor, self.index, self.generation)
    }
}

/// Identifier of a token session shared by channels with the same credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Reactor State
// ----------------------------------------------------------------------------

/// Lifecycle state of a reactor
///
/// Moves forward only: `Init` → `Active` → `Error` | `ShutDown`, and `Error`
/// → `ShutDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReactorState {
    /// Created; the worker is not running yet
    Init,
    /// Accepting connections and dispatching events
    Active,
    /// A fatal error occurred; only shutdown is accepted
    Error,
    /// Shut down; every operation fails
    ShutDown,
}

impl ReactorState {
    pub fn is_active(&self) -> bool {
        matches!(self, ReactorState::Active)
    }

    /// Whether moving to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(&self, next: ReactorState) -> bool {
        matches!(
            (self, next),
            (ReactorState::Init, ReactorState::Active)
                | (ReactorState::Init, ReactorState::ShutDown)
                | (ReactorState::Active, ReactorState::Error)
                | (ReactorState::Active, ReactorState::ShutDown)
                | (ReactorState::Error, ReactorState::ShutDown)
        )
    }
}

impl fmt::Display for ReactorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReactorState::Init => "init",
            ReactorState::Active => "active",
            ReactorState::Error => "error",
            ReactorState::ShutDown => "shut-down",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Serde Helpers
// ----------------------------------------------------------------------------

/// Serialize a `Duration` as whole milliseconds
pub mod serde_millis {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_ids_are_unique() {
        let a = ReactorId::next();
        let b = ReactorId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_channel_id_display() {
        let reactor = ReactorId::next();
        let id = ChannelId::new(reactor, 3, 7);
        assert_eq!(id.to_string(), format!("{}/ch3.7", reactor));
        assert_eq!(id.index(), 3);
        assert_eq!(id.generation(), 7);
        assert_eq!(id.reactor(), reactor);
    }

    #[test]
    fn test_reactor_state_is_monotonic() {
        assert!(ReactorState::Init.can_transition_to(ReactorState::Active));
        assert!(ReactorState::Active.can_transition_to(ReactorState::Error));
        assert!(ReactorState::Error.can_transition_to(ReactorState::ShutDown));
        assert!(!ReactorState::Error.can_transition_to(ReactorState::Active));
        assert!(!ReactorState::ShutDown.can_transition_to(ReactorState::Active));
    }

    #[test]
    fn test_channel_ids_differ_by_generation() {
        let reactor = ReactorId::next();
        assert_ne!(ChannelId::new(reactor, 0, 0), ChannelId::new(reactor, 0, 1));
    }
}

//! feedmux core contracts
//!
//! Shared building blocks for the feedmux channel-management engine: the
//! cross-thread event queue and readiness notifier, the channel setup and
//! reconnection state machines, token renewal math, configuration, errors,
//! and the collaborator traits (socket layer, token service, message codec)
//! that the runtime drives.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod codec;
pub mod config;
pub mod errors;
pub mod notifier;
pub mod queue;
pub mod reconnect;
pub mod setup;
pub mod stats;
pub mod token;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{BincodeCodec, DataMessage, Message, MessageCodec, SchemaPart};
pub use config::{ConnectOptions, ConnectionInfo, PingConfig, ReactorConfig, ReconnectConfig};
pub use errors::{
    CodecError, ConfigError, ErrorCode, ErrorInfo, QueueError, ReactorError, ReactorResult,
    RestError, SetupError, TransportError,
};
pub use notifier::{Notifier, Readiness, Token};
pub use queue::EventQueue;
pub use reconnect::{ConnectionCursor, ReconnectDecision, ReconnectPolicy};
pub use setup::{ChannelSetupState, LoginConfig, SetupPlan, SetupProgress};
pub use stats::{ChannelStatistics, StatisticsFlags, StatisticsRecorder};
pub use token::{
    AccessToken, CredentialKey, CredentialRenewal, DiscoveryRequest, DiscoveryTransport,
    OAuthCredentials, ServiceEndpoint, TokenConfig, TokenGrant, TokenRequest, TokenService,
};
pub use transport::{
    Connector, Endpoint, FlushOutcome, InitProgress, Link, ReadOutcome, WriteOutcome,
};
pub use types::{ChannelId, ReactorId, ReactorState, SessionId};

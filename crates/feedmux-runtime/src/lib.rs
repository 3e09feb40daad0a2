//! feedmux Runtime Engine
//!
//! This crate contains the reactor/worker engine that manages many logical
//! channels to market-data endpoints:
//! - `Reactor`: the application-facing handle; connect, submit, dispatch
//! - the worker task: connects, reconnects, flushes, pings, renews tokens
//! - token sessions shared by channels with identical credentials
//!
//! The contracts it drives (links, codec, token service, configuration) live
//! in `feedmux-core`.

mod event;
mod worker;

pub mod activity;
pub mod builder;
pub mod callbacks;
pub mod managers;
pub mod reactor;

pub use builder::ReactorBuilder;
pub use callbacks::{
    AuthTokenEvent, ChannelCallbacks, ChannelEvent, ChannelEventType, CredentialRenewalRequest,
};
pub use managers::*;
pub use reactor::{
    ChannelInfo, ChannelQueue, DispatchOptions, DispatchSummary, Reactor, ReactorStats,
};

// Re-export core types for convenience
pub use feedmux_core::{
    AccessToken, ChannelId, ChannelSetupState, ChannelStatistics, ConnectOptions, ConnectionInfo,
    CredentialRenewal, Endpoint, ErrorCode, ErrorInfo, LoginConfig, Message, OAuthCredentials,
    PingConfig, ReactorConfig, ReactorError, ReactorResult, ReactorState, ReconnectConfig,
    SessionId, SetupPlan, StatisticsFlags,
};

//! Stateful managers shared by the reactor and the worker

pub mod token_session;

pub use token_session::{
    BeginRequest, RenewalFailure, TokenSession, TokenSessionRegistry, TokenSessionStats,
};

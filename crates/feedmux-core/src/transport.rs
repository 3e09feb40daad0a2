//! Socket-layer collaborator contracts
//!
//! A [`Connector`] opens links; a [`Link`] is one non-blocking duplex
//! connection. Every `Link` method returns immediately: reads report
//! `WouldBlock` when nothing is buffered and writes hand the frame back when
//! the outbound buffer is full. Links signal their [`Readiness`] handle when
//! inbound data arrives so the reactor can be woken through its notifier.

use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::notifier::Readiness;

/// Host and port of a server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ----------------------------------------------------------------------------
// Operation Outcomes
// ----------------------------------------------------------------------------

/// Progress of the link-level handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProgress {
    InProgress,
    Active,
}

/// Result of a non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete inbound frame
    Frame(Vec<u8>),
    /// The peer sent a keep-alive
    Ping,
    /// Nothing buffered right now
    WouldBlock,
}

/// Result of a non-blocking write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Frame accepted; `pending` bytes are still waiting to be flushed
    Written { pending: usize },
    /// Outbound buffer full; the frame is returned untouched
    WouldBlock(Vec<u8>),
}

/// Result of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Done,
    Pending(usize),
}

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// One non-blocking duplex connection
pub trait Link: Send + Sync + fmt::Debug {
    /// Advance the link-level handshake
    fn init(&self) -> Result<InitProgress, TransportError>;

    fn read(&self) -> Result<ReadOutcome, TransportError>;

    fn write(&self, frame: Vec<u8>) -> Result<WriteOutcome, TransportError>;

    fn flush(&self) -> Result<FlushOutcome, TransportError>;

    /// Send a keep-alive frame
    fn ping(&self) -> Result<(), TransportError>;

    /// Install or clear the handle signalled when inbound data arrives
    fn set_readiness(&self, readiness: Option<Readiness>);

    fn close(&self);
}

/// Opens links to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Link>, TransportError>;
}

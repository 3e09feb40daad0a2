//! Reactor Builder API
//!
//! Wires the collaborators (connector, optional token service, codec) into a
//! reactor and spawns its worker on the current tokio runtime.

use std::sync::{Arc, Mutex, PoisonError};

use feedmux_core::{
    BincodeCodec, ConfigError, Connector, EventQueue, MessageCodec, Notifier, ReactorConfig,
    ReactorError, ReactorId, ReactorResult, ReactorState, TokenService,
};
use tracing::info;

use crate::managers::TokenSessionRegistry;
use crate::reactor::pool::ChannelPool;
use crate::reactor::{Reactor, ReactorCore, ReactorInner, ReactorStats, QUEUE_TOKEN};
use crate::worker::{supervise, Worker};

// ----------------------------------------------------------------------------
// Reactor Builder
// ----------------------------------------------------------------------------

/// Builder for a [`Reactor`]
pub struct ReactorBuilder {
    config: ReactorConfig,
    connector: Option<Arc<dyn Connector>>,
    token_service: Option<Arc<dyn TokenService>>,
    codec: Arc<dyn MessageCodec>,
}

impl ReactorBuilder {
    pub fn new(config: ReactorConfig) -> Self {
        Self {
            config,
            connector: None,
            token_service: None,
            codec: Arc::new(BincodeCodec::new()),
        }
    }

    /// Socket layer used to open links (required)
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Token endpoint and service discovery; required for session-managed channels
    pub fn with_token_service(mut self, token_service: Arc<dyn TokenService>) -> Self {
        self.token_service = Some(token_service);
        self
    }

    /// Replace the default bincode framing
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Validate the configuration and start the worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> ReactorResult<Reactor> {
        self.config.validate()?;
        let connector = self
            .connector
            .ok_or_else(|| ConfigError::invalid("a connector is required"))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            ReactorError::WorkerFailed {
                reason: error.to_string(),
            }
        })?;

        let id = ReactorId::next();
        let notifier = Notifier::new();
        let reactor_queue = Arc::new(EventQueue::new(notifier.register(QUEUE_TOKEN)));
        let worker_notifier = Notifier::new();
        let worker_queue = Arc::new(EventQueue::new(worker_notifier.register(QUEUE_TOKEN)));
        let sessions = Arc::new(TokenSessionRegistry::new());

        let worker = Worker::new(
            self.config.clone(),
            reactor_queue.clone(),
            worker_queue.clone(),
            worker_notifier,
            connector,
            self.token_service.clone(),
            sessions.clone(),
        );

        let pool = ChannelPool::new(
            id,
            self.config.channel_pool_size,
            self.config.max_channels,
        );
        let inner = ReactorInner {
            id,
            config: self.config,
            core: Mutex::new(ReactorCore {
                state: ReactorState::Init,
                pool,
                stats: ReactorStats::default(),
            }),
            callback_thread: Mutex::new(None),
            notifier,
            reactor_queue,
            worker_queue,
            dispatch_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            sessions,
            codec: self.codec,
            has_token_service: self.token_service.is_some(),
        };

        let task = runtime.spawn(supervise(worker));
        *inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        inner.core.lock().unwrap_or_else(PoisonError::into_inner).state = ReactorState::Active;

        info!(
            reactor = %id,
            pool = inner.config.channel_pool_size,
            token_service = inner.has_token_service,
            "reactor started"
        );
        Ok(Reactor::from_inner(Arc::new(inner)))
    }
}

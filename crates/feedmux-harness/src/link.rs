//! In-memory links and connector
//!
//! A [`MockLink`] is the reactor's end of a connection; the matching
//! [`MockPeer`] is the test's end. Both share one state, so a test can push
//! inbound frames, fail reads, block writes and inspect what was written. The
//! peer can answer the setup handshake on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use feedmux_core::codec::{LoginResponse, Schema, ServiceInfo};
use feedmux_core::{
    BincodeCodec, Connector, Endpoint, FlushOutcome, InitProgress, Link, Message, MessageCodec,
    ReadOutcome, Readiness, TransportError, WriteOutcome,
};
use tokio::time::Instant;
use tracing::trace;

// ----------------------------------------------------------------------------
// Peer Behavior
// ----------------------------------------------------------------------------

/// How the peer answers setup requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupResponder {
    /// Accept the login and answer directory and schema requests
    Accept,
    /// Refuse the login with this text
    Reject(String),
    /// Never answer
    Silent,
}

/// What the connector does for an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointBehavior {
    /// Connect; the link reports `InProgress` for `init_steps` init calls
    Accept { init_steps: u32 },
    Refuse,
    /// Connect, then panic on the first init call
    PanicOnInit,
}

#[derive(Debug)]
enum Inbound {
    Frame(Vec<u8>),
    Ping,
}

#[derive(Debug)]
struct LinkState {
    endpoint: Endpoint,
    init_remaining: u32,
    panic_on_init: bool,
    inbound: VecDeque<Inbound>,
    written: Vec<Vec<u8>>,
    block_writes: bool,
    readiness: Option<Readiness>,
    closed: bool,
    read_error: Option<String>,
    pings: u32,
    flushes: u32,
    responder: SetupResponder,
}

impl LinkState {
    fn push_inbound(&mut self, item: Inbound) {
        self.inbound.push_back(item);
        if let Some(readiness) = &self.readiness {
            readiness.signal();
        }
    }

    fn answer(&mut self, request: &Message) {
        let response = match (&self.responder, request) {
            (SetupResponder::Silent, _) => return,
            (SetupResponder::Reject(text), Message::LoginRequest(_)) => {
                Message::LoginResponse(LoginResponse {
                    accepted: false,
                    text: text.clone(),
                })
            }
            (SetupResponder::Accept, Message::LoginRequest(login)) => {
                Message::LoginResponse(LoginResponse {
                    accepted: true,
                    text: format!("welcome {}", login.user_name),
                })
            }
            (SetupResponder::Accept, Message::DirectoryRequest) => {
                Message::DirectoryResponse(vec![ServiceInfo {
                    service_id: 1,
                    name: String::from("ELEKTRON_DD"),
                }])
            }
            (SetupResponder::Accept, Message::SchemaRequest(part)) => {
                Message::SchemaResponse(Schema {
                    part: *part,
                    name: format!("{:?}", part),
                    body: vec![0; 16],
                })
            }
            _ => return,
        };
        if let Ok(frame) = BincodeCodec::new().encode(&response) {
            self.push_inbound(Inbound::Frame(frame));
        }
    }
}

type SharedState = Arc<Mutex<LinkState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Mock Link
// ----------------------------------------------------------------------------

/// Reactor end of an in-memory connection
#[derive(Debug)]
pub struct MockLink {
    state: SharedState,
}

impl Link for MockLink {
    fn init(&self) -> Result<InitProgress, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::ClosedByPeer);
        }
        if state.panic_on_init {
            let endpoint = state.endpoint.to_string();
            drop(state);
            panic!("link to {} failed to initialize", endpoint);
        }
        if state.init_remaining > 0 {
            state.init_remaining -= 1;
            return Ok(InitProgress::InProgress);
        }
        Ok(InitProgress::Active)
    }

    fn read(&self) -> Result<ReadOutcome, TransportError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.read_error.take() {
            return Err(TransportError::Protocol { reason });
        }
        if state.closed {
            return Err(TransportError::ClosedByPeer);
        }
        Ok(match state.inbound.pop_front() {
            Some(Inbound::Frame(frame)) => ReadOutcome::Frame(frame),
            Some(Inbound::Ping) => ReadOutcome::Ping,
            None => ReadOutcome::WouldBlock,
        })
    }

    fn write(&self, frame: Vec<u8>) -> Result<WriteOutcome, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::ClosedByPeer);
        }
        if state.block_writes {
            return Ok(WriteOutcome::WouldBlock(frame));
        }
        if let Ok(message) = BincodeCodec::new().decode(&frame) {
            trace!(endpoint = %state.endpoint, message = message.kind(), "peer received");
            state.answer(&message);
        }
        state.written.push(frame);
        Ok(WriteOutcome::Written { pending: 0 })
    }

    fn flush(&self) -> Result<FlushOutcome, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::ClosedByPeer);
        }
        state.flushes += 1;
        Ok(if state.block_writes {
            FlushOutcome::Pending(1)
        } else {
            FlushOutcome::Done
        })
    }

    fn ping(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::ClosedByPeer);
        }
        state.pings += 1;
        Ok(())
    }

    fn set_readiness(&self, readiness: Option<Readiness>) {
        let mut state = lock(&self.state);
        if let Some(readiness) = &readiness {
            if !state.inbound.is_empty() || state.read_error.is_some() {
                readiness.signal();
            }
        }
        state.readiness = readiness;
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.readiness = None;
    }
}

// ----------------------------------------------------------------------------
// Mock Peer
// ----------------------------------------------------------------------------

/// Test end of an in-memory connection
#[derive(Debug, Clone)]
pub struct MockPeer {
    state: SharedState,
}

impl MockPeer {
    pub fn endpoint(&self) -> Endpoint {
        lock(&self.state).endpoint.clone()
    }

    /// Queue a message for the reactor to read
    pub fn send(&self, message: &Message) {
        if let Ok(frame) = BincodeCodec::new().encode(message) {
            lock(&self.state).push_inbound(Inbound::Frame(frame));
        }
    }

    /// Queue raw bytes, bypassing the codec
    pub fn send_raw(&self, frame: Vec<u8>) {
        lock(&self.state).push_inbound(Inbound::Frame(frame));
    }

    pub fn send_ping(&self) {
        lock(&self.state).push_inbound(Inbound::Ping);
    }

    /// Make the next read fail
    pub fn fail_reads(&self, reason: &str) {
        let mut state = lock(&self.state);
        state.read_error = Some(reason.to_owned());
        if let Some(readiness) = &state.readiness {
            readiness.signal();
        }
    }

    pub fn set_block_writes(&self, blocked: bool) {
        lock(&self.state).block_writes = blocked;
    }

    pub fn set_responder(&self, responder: SetupResponder) {
        lock(&self.state).responder = responder;
    }

    /// Every message written by the reactor, decoded
    pub fn written(&self) -> Vec<Message> {
        let codec = BincodeCodec::new();
        lock(&self.state)
            .written
            .iter()
            .filter_map(|frame| codec.decode(frame).ok())
            .collect()
    }

    /// Data messages written by the reactor
    pub fn written_data(&self) -> Vec<Message> {
        self.written()
            .into_iter()
            .filter(|message| matches!(message, Message::Data(_)))
            .collect()
    }

    pub fn pings(&self) -> u32 {
        lock(&self.state).pings
    }

    pub fn flushes(&self) -> u32 {
        lock(&self.state).flushes
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

// ----------------------------------------------------------------------------
// Mock Connector
// ----------------------------------------------------------------------------

/// One call to [`MockConnector::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub endpoint: Endpoint,
    pub at: Instant,
}

#[derive(Debug)]
struct ConnectorState {
    behaviors: HashMap<Endpoint, EndpointBehavior>,
    default_behavior: EndpointBehavior,
    responder: SetupResponder,
    attempts: Vec<ConnectAttempt>,
    peers: Vec<MockPeer>,
}

/// Connector producing [`MockLink`]s
#[derive(Debug)]
pub struct MockConnector {
    state: Mutex<ConnectorState>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Accepts every endpoint immediately and answers setup requests
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectorState {
                behaviors: HashMap::new(),
                default_behavior: EndpointBehavior::Accept { init_steps: 0 },
                responder: SetupResponder::Accept,
                attempts: Vec::new(),
                peers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, endpoint: Endpoint, behavior: EndpointBehavior) {
        self.lock().behaviors.insert(endpoint, behavior);
    }

    pub fn set_default_behavior(&self, behavior: EndpointBehavior) {
        self.lock().default_behavior = behavior;
    }

    /// Responder given to links created from now on
    pub fn set_responder(&self, responder: SetupResponder) {
        self.lock().responder = responder;
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.lock().attempts.clone()
    }

    /// Peers of every link created so far, oldest first
    pub fn peers(&self) -> Vec<MockPeer> {
        self.lock().peers.clone()
    }

    pub fn last_peer(&self) -> Option<MockPeer> {
        self.lock().peers.last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Link>, TransportError> {
        let mut state = self.lock();
        state.attempts.push(ConnectAttempt {
            endpoint: endpoint.clone(),
            at: Instant::now(),
        });

        let behavior = state
            .behaviors
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| state.default_behavior.clone());
        match behavior {
            EndpointBehavior::Refuse => Err(TransportError::ConnectionRefused {
                endpoint: endpoint.to_string(),
            }),
            EndpointBehavior::Accept { .. } | EndpointBehavior::PanicOnInit => {
                let (init_steps, panic_on_init) = match behavior {
                    EndpointBehavior::Accept { init_steps } => (init_steps, false),
                    _ => (0, true),
                };
                let shared = Arc::new(Mutex::new(LinkState {
                    endpoint: endpoint.clone(),
                    init_remaining: init_steps,
                    panic_on_init,
                    inbound: VecDeque::new(),
                    written: Vec::new(),
                    block_writes: false,
                    readiness: None,
                    closed: false,
                    read_error: None,
                    pings: 0,
                    flushes: 0,
                    responder: state.responder.clone(),
                }));
                state.peers.push(MockPeer {
                    state: shared.clone(),
                });
                Ok(Arc::new(MockLink { state: shared }))
            }
        }
    }
}

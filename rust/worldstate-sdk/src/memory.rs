//! In-process indexer.
//!
//! [`MemoryIndexer`] keeps entity history in memory, answers queries with the
//! same pagination engine the client validates cursors against, and pushes
//! updates to matching subscriptions. It speaks the regular wire protocol
//! over a [`MemoryTransport`], so a [`Client`](crate::Client) cannot tell it
//! apart from a remote indexer.

use crate::clause::Clause;
use crate::entity::Entity;
use crate::error::{ClientError, Result};
use crate::felt::Felt;
use crate::frame::{ClientMessage, QueryIndex, ServerMessage, WireEntity, WirePage, PROTOCOL_VERSION};
use crate::paginate::paginate;
use crate::transport::{Transport, WireMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Filter {
    index: QueryIndex,
    clause: Option<Clause>,
    world_addresses: BTreeSet<Felt>,
}

impl Filter {
    fn matches(&self, index: QueryIndex, entity: &Entity) -> bool {
        self.index == index
            && (self.world_addresses.is_empty() || self.world_addresses.contains(&entity.world_address()))
            && self.clause.as_ref().map_or(true, |c| c.matches(entity))
    }
}

struct Session {
    outbound: mpsc::UnboundedSender<WireMessage>,
    subscriptions: HashMap<u64, Filter>,
}

#[derive(Default)]
struct IndexerState {
    entities: Vec<Entity>,
    event_messages: Vec<Entity>,
    sessions: HashMap<u64, Session>,
}

struct IndexerInner {
    state: Mutex<IndexerState>,
    protocol_version: u32,
    name: String,
    next_session: AtomicU64,
    queries_held: watch::Sender<bool>,
    queries_served: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryIndexer {
    inner: Arc<IndexerInner>,
}

impl Default for MemoryIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexer {
    pub fn new() -> Self {
        Self::with_protocol_version(PROTOCOL_VERSION)
    }

    /// An indexer that announces `protocol_version` in its welcome.
    pub fn with_protocol_version(protocol_version: u32) -> Self {
        let (queries_held, _) = watch::channel(false);
        Self {
            inner: Arc::new(IndexerInner {
                state: Mutex::new(IndexerState::default()),
                protocol_version,
                name: "memory-indexer".to_string(),
                next_session: AtomicU64::new(1),
                queries_held,
                queries_served: AtomicU64::new(0),
            }),
        }
    }

    /// Stores an entity state and pushes it to every matching subscription.
    pub fn publish(&self, entity: Entity) {
        let mut state = self.inner.state.lock();
        push(&state, QueryIndex::Entities, &entity);
        state.entities.push(entity);
    }

    pub fn publish_all(&self, entities: impl IntoIterator<Item = Entity>) {
        for entity in entities {
            self.publish(entity);
        }
    }

    /// Stores an event message and pushes it to matching event-message
    /// subscriptions.
    pub fn publish_event_message(&self, entity: Entity) {
        let mut state = self.inner.state.lock();
        push(&state, QueryIndex::EventMessages, &entity);
        state.event_messages.push(entity);
    }

    pub fn entity_count(&self) -> usize {
        self.inner.state.lock().entities.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .map(|s| s.subscriptions.len())
            .sum()
    }

    /// Number of query requests that have reached the indexer.
    pub fn queries_served(&self) -> u64 {
        self.inner.queries_served.load(Ordering::SeqCst)
    }

    /// Stalls every query response until [`MemoryIndexer::release_queries`].
    pub fn hold_queries(&self) {
        self.inner.queries_held.send_replace(true);
    }

    pub fn release_queries(&self) {
        self.inner.queries_held.send_replace(false);
    }

    /// Sends a raw payload to every connected session.
    pub fn inject(&self, message: WireMessage) {
        for session in self.inner.state.lock().sessions.values() {
            let _ = session.outbound.send(message.clone());
        }
    }

    /// Terminates subscription `id` server-side with an error.
    pub fn fail_subscription(&self, id: u64, message: &str) {
        let mut state = self.inner.state.lock();
        for session in state.sessions.values_mut() {
            if session.subscriptions.remove(&id).is_some() {
                send(
                    &session.outbound,
                    &ServerMessage::SubscriptionError {
                        id,
                        message: message.to_string(),
                    },
                );
            }
        }
    }

    /// Drops every session, as a crashed server would.
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut self.inner.state.lock().sessions);
        warn!("Disconnecting {} sessions", dropped.len());
    }

    /// Opens a new session.
    pub fn connect(&self) -> MemoryTransport {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        self.inner.state.lock().sessions.insert(
            session_id,
            Session {
                outbound: server_tx,
                subscriptions: HashMap::new(),
            },
        );
        debug!("Session {} opened", session_id);
        tokio::spawn(self.clone().run_session(session_id, client_rx));

        MemoryTransport {
            outbound: Some(client_tx),
            inbound: server_rx,
        }
    }

    fn outbound(&self, session_id: u64) -> Option<mpsc::UnboundedSender<WireMessage>> {
        self.inner
            .state
            .lock()
            .sessions
            .get(&session_id)
            .map(|s| s.outbound.clone())
    }

    async fn run_session(self, session_id: u64, mut inbound: mpsc::UnboundedReceiver<WireMessage>) {
        while let Some(message) = inbound.recv().await {
            let Some(outbound) = self.outbound(session_id) else {
                break;
            };
            let message = match message {
                WireMessage::Ping(payload) => {
                    let _ = outbound.send(WireMessage::Pong(payload));
                    continue;
                }
                WireMessage::Pong(_) => continue,
                data => match serde_json::from_slice::<ClientMessage>(data.payload()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Session {} sent an unreadable message: {}", session_id, e);
                        continue;
                    }
                },
            };
            self.handle(session_id, &outbound, message);
        }
        self.inner.state.lock().sessions.remove(&session_id);
        debug!("Session {} closed", session_id);
    }

    fn handle(&self, session_id: u64, outbound: &mpsc::UnboundedSender<WireMessage>, message: ClientMessage) {
        match message {
            ClientMessage::Hello { protocol_version } => {
                info!("Session {} hello (protocol {})", session_id, protocol_version);
                send(
                    outbound,
                    &ServerMessage::Welcome {
                        protocol_version: self.inner.protocol_version,
                        server: self.inner.name.clone(),
                    },
                );
            }
            ClientMessage::Query { id, index, query } => {
                self.inner.queries_served.fetch_add(1, Ordering::SeqCst);
                let indexer = self.clone();
                let outbound = outbound.clone();
                let mut held = self.inner.queries_held.subscribe();
                tokio::spawn(async move {
                    let _ = held.wait_for(|held| !*held).await;
                    let snapshot = {
                        let state = indexer.inner.state.lock();
                        match index {
                            QueryIndex::Entities => state.entities.clone(),
                            QueryIndex::EventMessages => state.event_messages.clone(),
                        }
                    };
                    let reply = match paginate(snapshot, &query) {
                        Ok(page) => ServerMessage::Page {
                            id,
                            page: WirePage::from(&page),
                        },
                        Err(e) => ServerMessage::error(id, &e),
                    };
                    send(&outbound, &reply);
                });
            }
            ClientMessage::Subscribe {
                id,
                index,
                clause,
                world_addresses,
            } => {
                let filter = Filter {
                    index,
                    clause,
                    world_addresses,
                };
                send(outbound, &self.install(session_id, id, filter));
            }
            ClientMessage::UpdateSubscription {
                id,
                clause,
                world_addresses,
            } => {
                let index = self
                    .inner
                    .state
                    .lock()
                    .sessions
                    .get(&session_id)
                    .and_then(|s| s.subscriptions.get(&id))
                    .map_or(QueryIndex::Entities, |f| f.index);
                let filter = Filter {
                    index,
                    clause,
                    world_addresses,
                };
                send(outbound, &self.install(session_id, id, filter));
            }
            ClientMessage::Unsubscribe { id } => {
                if let Some(session) = self.inner.state.lock().sessions.get_mut(&session_id) {
                    session.subscriptions.remove(&id);
                }
            }
            ClientMessage::Ping => send(outbound, &ServerMessage::Pong),
        }
    }

    fn install(&self, session_id: u64, id: u64, filter: Filter) -> ServerMessage {
        if let Some(Err(reason)) = filter.clause.as_ref().map(Clause::validate) {
            return ServerMessage::error(id, &ClientError::InvalidQuery(reason));
        }
        if let Some(session) = self.inner.state.lock().sessions.get_mut(&session_id) {
            session.subscriptions.insert(id, filter);
        }
        ServerMessage::Subscribed { id }
    }
}

fn push(state: &IndexerState, index: QueryIndex, entity: &Entity) {
    let wire = WireEntity::from(entity);
    for session in state.sessions.values() {
        for (id, filter) in &session.subscriptions {
            if filter.matches(index, entity) {
                send(
                    &session.outbound,
                    &ServerMessage::Update {
                        id: *id,
                        entity: wire.clone(),
                    },
                );
            }
        }
    }
}

fn send(outbound: &mpsc::UnboundedSender<WireMessage>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            let _ = outbound.send(WireMessage::Text(text));
        }
        Err(e) => warn!("Failed to encode server message: {}", e),
    }
}

/// Client side of an in-process session with a [`MemoryIndexer`].
pub struct MemoryTransport {
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    inbound: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| ClientError::connection("memory transport closed"))?;
        outbound
            .send(message)
            .map_err(|_| ClientError::connection("memory indexer hung up"))
    }

    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

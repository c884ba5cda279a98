use crate::clause::Clause;
use crate::config::ClientConfig;
use crate::connection::{handshake, spawn_connection_loop, ConnectionCommand, ExitReason};
use crate::entity::Entity;
use crate::error::{ClientError, Result};
use crate::felt::Felt;
use crate::frame::QueryIndex;
use crate::query::{Page, PaginationDirection, Query};
use crate::subscription::{
    spawn_callback_worker, EntityUpdateCallback, Subscription, SubscriptionEvent,
    SubscriptionHandle, SubscriptionId, SubscriptionRegistry,
};
use crate::transport::{Transport, WebSocketTransport};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Registration = (
    Arc<SubscriptionHandle>,
    mpsc::UnboundedReceiver<SubscriptionEvent>,
);

struct ClientInner {
    command_tx: mpsc::Sender<ConnectionCommand>,
    registry: SubscriptionRegistry,
    shutdown: CancellationToken,
    exit_reason: ExitReason,
    next_id: AtomicU64,
    server: String,
    connection: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one indexer connection.
///
/// Cheap to clone; every clone shares the same connection, and all of them
/// see it closed once any of them calls [`Client::close`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.server)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub async fn connect(endpoint: &str, max_message_size: usize) -> Result<Self> {
        let config = ClientConfig::default().with_max_message_size(max_message_size);
        Self::connect_with_config(endpoint, config).await
    }

    pub async fn connect_with_config(endpoint: &str, config: ClientConfig) -> Result<Self> {
        info!("Connecting to {}", endpoint);
        let transport = WebSocketTransport::connect(endpoint, config.max_message_size).await?;
        Self::from_transport(transport, config).await
    }

    /// Runs the handshake over an already opened transport.
    pub async fn from_transport<T: Transport>(mut transport: T, config: ClientConfig) -> Result<Self> {
        let server = match handshake(&mut transport, &config).await {
            Ok(server) => server,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_size.max(1));
        let registry = SubscriptionRegistry::new();
        let shutdown = CancellationToken::new();
        let exit_reason = ExitReason::default();
        let connection = spawn_connection_loop(
            transport,
            config,
            registry.clone(),
            command_rx,
            shutdown.clone(),
            exit_reason.clone(),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                command_tx,
                registry,
                shutdown,
                exit_reason,
                next_id: AtomicU64::new(1),
                server,
                connection: Mutex::new(Some(connection)),
            }),
        })
    }

    /// Name the server reported during the handshake.
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Subscriptions that can still receive updates.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.live()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_closed() {
            return Ok(());
        }
        Err(self.gone())
    }

    fn gone(&self) -> ClientError {
        self.inner
            .exit_reason
            .lock()
            .clone()
            .unwrap_or_else(ClientError::closed)
    }

    async fn command(&self, cmd: ConnectionCommand) -> Result<()> {
        self.inner.command_tx.send(cmd).await.map_err(|_| self.gone())
    }

    /// One page of entities. Invalid queries fail before anything is sent.
    pub async fn execute(&self, query: &Query) -> Result<Page> {
        self.query(QueryIndex::Entities, query).await
    }

    /// One page from the event-message index; same contract as [`Client::execute`].
    pub async fn event_messages(&self, query: &Query) -> Result<Page> {
        self.query(QueryIndex::EventMessages, query).await
    }

    async fn query(&self, index: QueryIndex, query: &Query) -> Result<Page> {
        query.validate()?;
        self.ensure_open()?;

        let id = self.next_id();
        let (reply, rx) = oneshot::channel();
        self.command(ConnectionCommand::Query {
            id,
            index,
            query: query.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Follows `next_cursor` until the result set is exhausted. Entities are
    /// returned in canonical order regardless of the scan direction.
    pub async fn fetch_all(&self, query: Query) -> Result<Vec<Entity>> {
        let backward = query.pagination.direction == PaginationDirection::Backward;
        let mut query = query;
        let mut pages = Vec::new();
        loop {
            let page = self.execute(&query).await?;
            let next = page.next_cursor;
            pages.push(page.items);
            match next {
                Some(cursor) => query = query.with_cursor(Some(cursor)),
                None => break,
            }
        }
        if backward {
            pages.reverse();
        }
        Ok(pages.into_iter().flatten().collect())
    }

    async fn register(
        &self,
        index: QueryIndex,
        clause: Option<Clause>,
        world_addresses: BTreeSet<Felt>,
    ) -> Result<Registration> {
        if let Some(clause) = &clause {
            clause.validate().map_err(ClientError::InvalidQuery)?;
        }
        self.ensure_open()?;

        let id = SubscriptionId(self.next_id());
        let (handle, rx) = self.inner.registry.register(id);
        let (reply, ack) = oneshot::channel();
        let acked = match self
            .command(ConnectionCommand::Subscribe {
                id,
                index,
                clause,
                world_addresses,
                reply,
            })
            .await
        {
            Ok(()) => ack.await.unwrap_or_else(|_| Err(self.gone())),
            Err(e) => Err(e),
        };
        if let Err(e) = acked {
            self.inner.registry.remove(id);
            return Err(e);
        }
        debug!("Subscription {} active", id);
        Ok((handle, rx))
    }

    /// Returns once the server has acknowledged the subscription.
    pub async fn subscribe(
        &self,
        clause: Option<Clause>,
        world_addresses: impl IntoIterator<Item = Felt>,
    ) -> Result<Subscription> {
        self.stream(QueryIndex::Entities, clause, world_addresses.into_iter().collect())
            .await
    }

    /// Delivers events to `callback` from a dedicated task, one at a time.
    pub async fn subscribe_with_callback(
        &self,
        clause: Option<Clause>,
        world_addresses: impl IntoIterator<Item = Felt>,
        callback: impl EntityUpdateCallback,
    ) -> Result<SubscriptionId> {
        self.callback(
            QueryIndex::Entities,
            clause,
            world_addresses.into_iter().collect(),
            callback,
        )
        .await
    }

    /// Streams event messages; otherwise the same as [`Client::subscribe`].
    pub async fn subscribe_event_messages(
        &self,
        clause: Option<Clause>,
        world_addresses: impl IntoIterator<Item = Felt>,
    ) -> Result<Subscription> {
        self.stream(QueryIndex::EventMessages, clause, world_addresses.into_iter().collect())
            .await
    }

    pub async fn subscribe_event_messages_with_callback(
        &self,
        clause: Option<Clause>,
        world_addresses: impl IntoIterator<Item = Felt>,
        callback: impl EntityUpdateCallback,
    ) -> Result<SubscriptionId> {
        self.callback(
            QueryIndex::EventMessages,
            clause,
            world_addresses.into_iter().collect(),
            callback,
        )
        .await
    }

    async fn stream(
        &self,
        index: QueryIndex,
        clause: Option<Clause>,
        world_addresses: BTreeSet<Felt>,
    ) -> Result<Subscription> {
        let (handle, rx) = self.register(index, clause, world_addresses).await?;

        let registry = self.inner.registry.clone();
        let command_tx = self.inner.command_tx.clone();
        let unsubscribe = Box::new(move |id: SubscriptionId| {
            if registry.remove(id).is_none() {
                return;
            }
            // A full queue must not lose the unsubscribe.
            if let Err(TrySendError::Full(cmd)) =
                command_tx.try_send(ConnectionCommand::Unsubscribe { id })
            {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let command_tx = command_tx.clone();
                    runtime.spawn(async move {
                        let _ = command_tx.send(cmd).await;
                    });
                }
            }
        });
        Ok(Subscription::new(handle, rx, unsubscribe))
    }

    async fn callback(
        &self,
        index: QueryIndex,
        clause: Option<Clause>,
        world_addresses: BTreeSet<Felt>,
        callback: impl EntityUpdateCallback,
    ) -> Result<SubscriptionId> {
        let (handle, rx) = self.register(index, clause, world_addresses).await?;
        let id = handle.id();
        spawn_callback_worker(self.inner.registry.clone(), handle, rx, callback);
        Ok(id)
    }

    /// Replaces the filter of a live subscription of either kind.
    pub async fn update_subscription(
        &self,
        id: SubscriptionId,
        clause: Option<Clause>,
        world_addresses: impl IntoIterator<Item = Felt>,
    ) -> Result<()> {
        if let Some(clause) = &clause {
            clause.validate().map_err(ClientError::InvalidQuery)?;
        }
        self.ensure_open()?;
        if !self.inner.registry.contains(id) {
            return Err(ClientError::InvalidQuery(format!("unknown subscription {}", id)));
        }

        let (reply, ack) = oneshot::channel();
        self.command(ConnectionCommand::UpdateSubscription {
            id,
            clause,
            world_addresses: world_addresses.into_iter().collect(),
            reply,
        })
        .await?;
        ack.await.map_err(|_| self.gone())?
    }

    /// Stops a subscription. Idempotent; once this returns no further update
    /// is yielded or callback invoked for `id`. Safe to call from the
    /// subscription's own callback.
    pub async fn cancel(&self, id: SubscriptionId) {
        let Some(handle) = self.inner.registry.remove(id) else {
            return;
        };
        if !self.is_closed() {
            let _ = self.command(ConnectionCommand::Unsubscribe { id }).await;
        }
        handle.cancel().await;
        debug!("Subscription {} cancelled", id);
    }

    /// Cancels every subscription, fails in-flight requests and shuts the
    /// transport. Every later call returns a `Connection` error. Concurrent
    /// calls all return once teardown has finished.
    pub async fn close(&self) {
        for handle in self.inner.registry.drain() {
            handle.cancel().await;
        }
        self.inner.shutdown.cancel();

        let mut connection = self.inner.connection.lock().await;
        if let Some(connection) = connection.take() {
            let _ = connection.await;
        }
    }
}

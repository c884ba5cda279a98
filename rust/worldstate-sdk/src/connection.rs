use crate::clause::Clause;
use crate::config::ClientConfig;
use crate::error::{ClientError, DecodeError, Result};
use crate::felt::Felt;
use crate::frame::{
    parse_envelope, parse_server_message, ClientMessage, QueryIndex, ServerMessage,
    PROTOCOL_VERSION,
};
use crate::query::{Page, Query};
use crate::subscription::{Delivery, SubscriptionId, SubscriptionRegistry};
use crate::transport::{Transport, WireMessage};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub(crate) enum ConnectionCommand {
    Query {
        id: u64,
        index: QueryIndex,
        query: Query,
        reply: oneshot::Sender<Result<Page>>,
    },
    Subscribe {
        id: SubscriptionId,
        index: QueryIndex,
        clause: Option<Clause>,
        world_addresses: BTreeSet<Felt>,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateSubscription {
        id: SubscriptionId,
        clause: Option<Clause>,
        world_addresses: BTreeSet<Felt>,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

enum Pending {
    Page(oneshot::Sender<Result<Page>>),
    Ack(oneshot::Sender<Result<()>>),
}

impl Pending {
    fn fail(self, error: ClientError) {
        match self {
            Pending::Page(tx) => {
                let _ = tx.send(Err(error));
            }
            Pending::Ack(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// Why the connection loop stopped; read by the client once it is gone.
pub(crate) type ExitReason = Arc<Mutex<Option<ClientError>>>;

/// Sends `hello` and waits for a `welcome` with a matching protocol version.
/// Returns the server's self-reported name.
pub(crate) async fn handshake<T: Transport>(transport: &mut T, config: &ClientConfig) -> Result<String> {
    let hello = ClientMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
    };
    transport.send(encode(&hello)?).await?;

    let welcome = timeout(config.handshake_timeout, async {
        loop {
            let message = match transport.recv().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e),
                None => return Err(ClientError::connection("connection closed during handshake")),
            };
            match message {
                WireMessage::Ping(payload) => {
                    if let Err(e) = transport.send(WireMessage::Pong(payload)).await {
                        return Err(e);
                    }
                }
                WireMessage::Pong(_) => {}
                data => {
                    return match parse_server_message(data.payload()) {
                        Ok(ServerMessage::Welcome {
                            protocol_version,
                            server,
                        }) => Ok((protocol_version, server)),
                        Ok(other) => Err(ClientError::connection(format!(
                            "expected welcome, got {:?}",
                            other
                        ))),
                        Err(e) => Err(ClientError::connection(format!("invalid welcome: {}", e))),
                    };
                }
            }
        }
    })
    .await
    .map_err(|_| {
        ClientError::connection(format!(
            "handshake timed out after {:?}",
            config.handshake_timeout
        ))
    })?;

    let (protocol_version, server) = welcome?;
    if protocol_version != PROTOCOL_VERSION {
        return Err(ClientError::connection(format!(
            "protocol version mismatch: client speaks {}, server speaks {}",
            PROTOCOL_VERSION, protocol_version
        )));
    }
    info!("Handshake complete with {} (protocol {})", server, protocol_version);
    Ok(server)
}

/// Ticks of the keepalive timer; never completes when keepalive is off.
async fn next_ping(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn encode(message: &ClientMessage) -> Result<WireMessage> {
    let text = serde_json::to_string(message).map_err(DecodeError::from)?;
    Ok(WireMessage::Text(text))
}

struct ConnectionLoop<T> {
    transport: T,
    config: ClientConfig,
    registry: SubscriptionRegistry,
    pending: HashMap<u64, Pending>,
}

pub(crate) fn spawn_connection_loop<T: Transport>(
    transport: T,
    config: ClientConfig,
    registry: SubscriptionRegistry,
    mut command_rx: mpsc::Receiver<ConnectionCommand>,
    shutdown: CancellationToken,
    exit_reason: ExitReason,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ping_interval = config.ping_interval;
        let mut ping_timer = if ping_interval.is_zero() {
            debug!("Keepalive disabled");
            None
        } else {
            Some(interval_at(Instant::now() + ping_interval, ping_interval))
        };
        let mut conn = ConnectionLoop {
            transport,
            config,
            registry,
            pending: HashMap::new(),
        };

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    break ClientError::closed();
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Err(e) = conn.handle_command(cmd).await {
                                break e;
                            }
                        }
                        None => break ClientError::closed(),
                    }
                }
                msg = conn.transport.recv() => {
                    match msg {
                        Some(Ok(msg)) => {
                            if let Err(e) = conn.handle_message(msg).await {
                                break e;
                            }
                        }
                        Some(Err(e)) => break e,
                        None => break ClientError::connection("connection closed by server"),
                    }
                }
                _ = next_ping(&mut ping_timer) => {
                    let ping = match encode(&ClientMessage::Ping) {
                        Ok(ping) => ping,
                        Err(e) => break e,
                    };
                    if let Err(e) = conn.transport.send(ping).await {
                        break e;
                    }
                }
            }
        };

        if reason == ClientError::closed() {
            info!("Connection closed");
        } else {
            error!("Connection lost: {}", reason);
        }
        *exit_reason.lock() = Some(reason.clone());
        shutdown.cancel();
        command_rx.close();

        for (_, pending) in conn.pending.drain() {
            pending.fail(reason.clone());
        }
        conn.registry.fault_all(&reason);
        conn.transport.close().await;
    })
}

impl<T: Transport> ConnectionLoop<T> {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let wire = encode(message)?;
        self.transport.send(wire).await
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) -> Result<()> {
        match cmd {
            ConnectionCommand::Query {
                id,
                index,
                query,
                reply,
            } => {
                debug!("Sending query {} against {:?}", id, index);
                self.pending.insert(id, Pending::Page(reply));
                self.send(&ClientMessage::Query { id, index, query }).await
            }
            ConnectionCommand::Subscribe {
                id,
                index,
                clause,
                world_addresses,
                reply,
            } => {
                debug!("Subscribing {} to {:?}", id, index);
                self.pending.insert(id.0, Pending::Ack(reply));
                self.send(&ClientMessage::Subscribe {
                    id: id.0,
                    index,
                    clause,
                    world_addresses,
                })
                .await
            }
            ConnectionCommand::UpdateSubscription {
                id,
                clause,
                world_addresses,
                reply,
            } => {
                if self.pending.contains_key(&id.0) {
                    let _ = reply.send(Err(ClientError::InvalidQuery(format!(
                        "subscription {} has a change in flight",
                        id
                    ))));
                    return Ok(());
                }
                debug!("Updating subscription {}", id);
                self.pending.insert(id.0, Pending::Ack(reply));
                self.send(&ClientMessage::UpdateSubscription {
                    id: id.0,
                    clause,
                    world_addresses,
                })
                .await
            }
            ConnectionCommand::Unsubscribe { id } => {
                debug!("Unsubscribing {}", id);
                self.send(&ClientMessage::Unsubscribe { id: id.0 }).await
            }
        }
    }

    async fn handle_message(&mut self, message: WireMessage) -> Result<()> {
        let data = match message {
            WireMessage::Ping(payload) => return self.transport.send(WireMessage::Pong(payload)).await,
            WireMessage::Pong(_) => return Ok(()),
            data => data,
        };

        let bytes = data.payload();
        let max = self.config.max_message_size;
        if bytes.len() > max {
            let error = ClientError::ResponseTooLarge {
                size: bytes.len(),
                max,
            };
            return self.attribute(bytes, error).await;
        }

        match parse_server_message(bytes) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => self.attribute(bytes, e.into()).await,
        }
    }

    /// Routes a payload-level failure to the request or subscription named
    /// in the envelope. Anything unattributable faults the connection.
    async fn attribute(&mut self, bytes: &[u8], error: ClientError) -> Result<()> {
        let envelope = match parse_envelope(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping connection on unreadable message: {}", e);
                return Err(ClientError::Decode(e));
            }
        };
        let Some(id) = envelope.id else {
            return Err(ClientError::Decode(DecodeError::Unexpected(format!(
                "{} message without id: {}",
                envelope.kind, error
            ))));
        };

        match envelope.kind.as_str() {
            "update" | "subscription_error" => {
                let id = SubscriptionId(id);
                if self.registry.fault(id, error) {
                    self.send(&ClientMessage::Unsubscribe { id: id.0 }).await?;
                }
                Ok(())
            }
            _ => match self.pending.remove(&id) {
                Some(pending) => {
                    warn!("Request {} failed: {}", id, error);
                    pending.fail(error);
                    Ok(())
                }
                None => {
                    debug!("Discarding {} for unknown request {}: {}", envelope.kind, id, error);
                    Ok(())
                }
            },
        }
    }

    async fn dispatch(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Page { id, page } => match self.pending.remove(&id) {
                Some(Pending::Page(tx)) => {
                    let result = page.decode(self.config.decoder.as_ref()).map_err(ClientError::from);
                    let _ = tx.send(result);
                }
                Some(other) => other.fail(ClientError::Decode(DecodeError::Unexpected(format!(
                    "page for subscription request {}",
                    id
                )))),
                None => debug!("Discarding page for unknown request {}", id),
            },
            ServerMessage::Error { id, kind, message } => match self.pending.remove(&id) {
                Some(pending) => pending.fail(ClientError::from_server(kind, message)),
                None => debug!("Discarding error for unknown request {}: {}", id, message),
            },
            ServerMessage::Subscribed { id } => match self.pending.remove(&id) {
                Some(Pending::Ack(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                Some(other) => other.fail(ClientError::Decode(DecodeError::Unexpected(format!(
                    "subscription ack for query {}",
                    id
                )))),
                None => debug!("Discarding ack for unknown subscription {}", id),
            },
            ServerMessage::Update { id, entity } => {
                let id = SubscriptionId(id);
                match entity.decode(self.config.decoder.as_ref()) {
                    Ok(entity) => {
                        trace!("Update {} for {}", entity.hashed_keys(), id);
                        match self.registry.deliver(id, entity) {
                            Delivery::Delivered => {}
                            Delivery::Dropped => {
                                self.send(&ClientMessage::Unsubscribe { id: id.0 }).await?;
                            }
                            Delivery::Unknown => {
                                debug!("Update for unregistered {}, unsubscribing", id);
                                self.send(&ClientMessage::Unsubscribe { id: id.0 }).await?;
                            }
                        }
                    }
                    Err(e) => {
                        if self.registry.fault(id, e.into()) {
                            self.send(&ClientMessage::Unsubscribe { id: id.0 }).await?;
                        }
                    }
                }
            }
            ServerMessage::SubscriptionError { id, message } => {
                let error = ClientError::connection(format!("subscription failed: {}", message));
                if let Some(pending) = self.pending.remove(&id) {
                    pending.fail(error.clone());
                }
                self.registry.fault(SubscriptionId(id), error);
            }
            ServerMessage::Pong => trace!("Pong"),
            ServerMessage::Welcome { .. } => warn!("Ignoring unexpected welcome"),
        }
        Ok(())
    }
}

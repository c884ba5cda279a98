//! Push subscriptions.
//!
//! Every subscription owns an unbounded queue fed by the connection actor.
//! Consumers either poll a [`Subscription`] stream or hand an
//! [`EntityUpdateCallback`] to a dedicated delivery task. Both paths consult
//! the shared state before yielding anything, so once `cancel` has returned
//! no further event is observed.

use crate::entity::Entity;
use crate::error::ClientError;
use async_trait::async_trait;
use futures_util::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Update(Entity),
    /// Terminal. Delivered at most once; the subscription is cancelled after it.
    Error(ClientError),
}

/// Receives events for a callback-mode subscription.
///
/// Invocations for one subscription never overlap and follow server order.
#[async_trait]
pub trait EntityUpdateCallback: Send + 'static {
    async fn on_update(&mut self, entity: Entity);

    async fn on_error(&mut self, error: ClientError);
}

#[async_trait]
impl<F> EntityUpdateCallback for F
where
    F: FnMut(SubscriptionEvent) + Send + 'static,
{
    async fn on_update(&mut self, entity: Entity) {
        self(SubscriptionEvent::Update(entity))
    }

    async fn on_error(&mut self, error: ClientError) {
        self(SubscriptionEvent::Error(error))
    }
}

tokio::task_local! {
    static DELIVERING: SubscriptionId;
}

/// Shared between the registry, the consumer and `cancel`.
pub(crate) struct SubscriptionHandle {
    id: SubscriptionId,
    state: Mutex<SubscriptionState>,
    /// Held by the callback worker for the duration of one invocation.
    gate: tokio::sync::Mutex<()>,
}

impl SubscriptionHandle {
    pub fn new(id: SubscriptionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(SubscriptionState::Active),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Returns `true` if this call made the transition.
    pub fn mark_cancelled(&self) -> bool {
        let mut state = self.state.lock();
        let was_active = *state == SubscriptionState::Active;
        *state = SubscriptionState::Cancelled;
        was_active
    }

    /// Marks the subscription cancelled and waits out any callback that is
    /// running. Skips the wait when called from that callback.
    pub async fn cancel(&self) {
        self.mark_cancelled();
        let inside_own_callback = DELIVERING
            .try_with(|current| *current == self.id)
            .unwrap_or(false);
        if !inside_own_callback {
            drop(self.gate.lock().await);
        }
    }
}

struct Registered {
    handle: Arc<SubscriptionHandle>,
    /// Taken once the terminal error has been queued.
    tx: Option<mpsc::UnboundedSender<SubscriptionEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Not registered, faulted, or cancelled by the consumer.
    Unknown,
    /// The consumer went away; the entry has been removed.
    Dropped,
}

/// Subscriptions of one client, routed by id.
///
/// Faulted entries stay registered until their consumer cancels or drops
/// them, so `cancel` can still synchronize with an `on_error` in flight.
#[derive(Clone, Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Arc<Mutex<HashMap<SubscriptionId, Registered>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: SubscriptionId,
    ) -> (Arc<SubscriptionHandle>, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle::new(id);
        self.inner.lock().insert(
            id,
            Registered {
                handle: handle.clone(),
                tx: Some(tx),
            },
        );
        (handle, rx)
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Entries that can still receive updates.
    pub fn live(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|r| r.tx.is_some() && r.handle.state() == SubscriptionState::Active)
            .count()
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<Arc<SubscriptionHandle>> {
        self.inner.lock().remove(&id).map(|r| r.handle)
    }

    pub fn deliver(&self, id: SubscriptionId, entity: Entity) -> Delivery {
        let mut subs = self.inner.lock();
        let Some(registered) = subs.get(&id) else {
            return Delivery::Unknown;
        };
        let Some(tx) = &registered.tx else {
            return Delivery::Unknown;
        };
        if registered.handle.state() == SubscriptionState::Cancelled {
            subs.remove(&id);
            return Delivery::Unknown;
        }
        if tx.send(SubscriptionEvent::Update(entity)).is_err() {
            debug!("Subscription {} consumer dropped", id);
            subs.remove(&id);
            return Delivery::Dropped;
        }
        Delivery::Delivered
    }

    /// Queues the terminal error. Returns `false` when the subscription was
    /// not live.
    pub fn fault(&self, id: SubscriptionId, error: ClientError) -> bool {
        let tx = match self.inner.lock().get_mut(&id) {
            Some(registered) => registered.tx.take(),
            None => None,
        };
        let Some(tx) = tx else {
            return false;
        };
        warn!("Subscription {} faulted: {}", id, error);
        tx.send(SubscriptionEvent::Error(error)).is_ok()
    }

    pub fn fault_all(&self, error: &ClientError) {
        let senders: Vec<_> = self
            .inner
            .lock()
            .iter_mut()
            .filter_map(|(id, r)| r.tx.take().map(|tx| (*id, tx)))
            .collect();
        for (id, tx) in senders {
            warn!("Subscription {} faulted: {}", id, error);
            let _ = tx.send(SubscriptionEvent::Error(error.clone()));
        }
    }

    pub fn drain(&self) -> Vec<Arc<SubscriptionHandle>> {
        self.inner.lock().drain().map(|(_, r)| r.handle).collect()
    }
}

/// What a dropped [`Subscription`] uses to tell the connection to stop
/// pushing. Must not block.
pub(crate) type UnsubscribeHook = Box<dyn Fn(SubscriptionId) + Send + Sync>;

/// A stream of [`SubscriptionEvent`]s for one server-side subscription.
///
/// The stream ends after the first `Error` event or once the subscription
/// is cancelled. Dropping it cancels the subscription.
pub struct Subscription {
    handle: Arc<SubscriptionHandle>,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    unsubscribe: Option<UnsubscribeHook>,
}

impl Subscription {
    pub(crate) fn new(
        handle: Arc<SubscriptionHandle>,
        rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
        unsubscribe: UnsubscribeHook,
    ) -> Self {
        Self {
            handle,
            rx,
            unsubscribe: Some(unsubscribe),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.handle.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Cancels in place. Idempotent; no event is yielded afterwards.
    pub fn cancel(&mut self) {
        self.handle.mark_cancelled();
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe(self.handle.id);
        }
        self.rx.close();
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut state = this.handle.state.lock();
        if *state == SubscriptionState::Cancelled {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(SubscriptionEvent::Update(entity))) => {
                Poll::Ready(Some(SubscriptionEvent::Update(entity)))
            }
            Poll::Ready(Some(SubscriptionEvent::Error(error))) => {
                *state = SubscriptionState::Cancelled;
                Poll::Ready(Some(SubscriptionEvent::Error(error)))
            }
            Poll::Ready(None) => {
                *state = SubscriptionState::Cancelled;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.handle.id)
            .field("state", &self.handle.state())
            .finish()
    }
}

/// Runs a callback-mode subscription until it errors or is cancelled.
pub(crate) fn spawn_callback_worker<C: EntityUpdateCallback>(
    registry: SubscriptionRegistry,
    handle: Arc<SubscriptionHandle>,
    mut rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    mut callback: C,
) -> tokio::task::JoinHandle<()> {
    let id = handle.id;
    tokio::spawn(DELIVERING.scope(id, async move {
        while let Some(event) = rx.recv().await {
            let _gate = handle.gate.lock().await;
            if handle.state() == SubscriptionState::Cancelled {
                break;
            }
            match event {
                SubscriptionEvent::Update(entity) => callback.on_update(entity).await,
                SubscriptionEvent::Error(error) => {
                    handle.mark_cancelled();
                    callback.on_error(error).await;
                    break;
                }
            }
        }
        handle.mark_cancelled();
        registry.remove(id);
        debug!("Subscription {} delivery task finished", id);
    }))
}

//! Live subscriptions: backfill from a cursor, then follow the channel's
//! change feed without losing or repeating messages.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::murmur::error::ErrorKind;
use crate::murmur::message_streaming::{ChangeEvent, ChangeNotifier};
use crate::murmur::messages::{Channel, Message, MessageStore, MessageStoreError, Sequence};

const DEFAULT_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Failed to load messages for subscription: {0}")]
    Backfill(#[from] MessageStoreError),

    #[error("Live feed for {channel} lost after sequence {cursor}; resubscribe from that cursor")]
    SubscriptionLost { channel: Channel, cursor: Sequence },
}

impl SubscriptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubscriptionError::Backfill(e) => e.kind(),
            SubscriptionError::SubscriptionLost { .. } => ErrorKind::SubscriptionLost,
        }
    }
}

/// Delivery state of a subscription. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Connecting,
    Live,
    Disconnected,
}

type FeedItem = Result<ChangeEvent, SubscriptionError>;
type Registry = Arc<DashMap<Uuid, Arc<FeedControl>>>;

/// Shared between a [`Subscription`] handle, its feed task and the manager.
struct FeedControl {
    state: watch::Sender<SubscriptionState>,
    cancelled: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedControl {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(SubscriptionState::Connecting),
            cancelled: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    fn set_state(&self, next: SubscriptionState) {
        self.state.send_if_modified(|current| {
            if *current == SubscriptionState::Disconnected || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn set_task(&self, task: JoinHandle<()>) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            task.abort();
        } else {
            *slot = Some(task);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Idempotent.
    fn disconnect(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.set_state(SubscriptionState::Disconnected);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// A live connection to one channel.
///
/// Yields every message after the subscription's starting cursor exactly
/// once, in sequence order. The stream ends after a
/// [`SubscriptionError::SubscriptionLost`] item, or immediately once the
/// subscription is cancelled. Dropping the handle unsubscribes.
pub struct Subscription {
    id: Uuid,
    channel: Channel,
    cursor: Sequence,
    events: mpsc::Receiver<FeedItem>,
    state: watch::Receiver<SubscriptionState>,
    control: Arc<FeedControl>,
    registry: Registry,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Sequence of the last message yielded, or the starting cursor if none
    /// has been yielded yet. Resubscribing from here loses nothing.
    pub fn cursor(&self) -> Sequence {
        self.cursor
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub async fn next_event(&mut self) -> Option<FeedItem> {
        self.next().await
    }

    /// Resolves once the backlog has been handed over and the subscription has
    /// left `Connecting`.
    pub async fn wait_until_live(&mut self) -> SubscriptionState {
        match self
            .state
            .wait_for(|state| *state != SubscriptionState::Connecting)
            .await
        {
            Ok(state) => *state,
            Err(_) => SubscriptionState::Disconnected,
        }
    }

    /// Stops delivery and releases the feed. Buffered events are discarded.
    pub fn unsubscribe(&mut self) {
        if self.control.is_cancelled() {
            return;
        }
        self.control.disconnect();
        self.events.close();
        self.registry.remove(&self.id);
        tracing::debug!(
            target: "murmur::subscriptions::unsubscribe",
            "Subscription {} on {} closed at cursor {}",
            self.id,
            self.channel,
            self.cursor
        );
    }
}

impl Stream for Subscription {
    type Item = FeedItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.control.is_cancelled() {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(Ok(event))) => {
                self.cursor = event.sequence;
                Poll::Ready(Some(Ok(event)))
            }
            other => other,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("cursor", &self.cursor)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the lifecycle of every live subscription.
#[derive(Clone)]
pub struct SubscriptionManager {
    store: MessageStore,
    notifier: ChangeNotifier,
    buffer: usize,
    registry: Registry,
}

impl SubscriptionManager {
    pub fn new(store: MessageStore, notifier: ChangeNotifier) -> Self {
        Self::with_buffer(store, notifier, DEFAULT_BUFFER)
    }

    /// `buffer` bounds how many events wait for a slow consumer before the
    /// feed falls back to reading the store.
    pub fn with_buffer(store: MessageStore, notifier: ChangeNotifier, buffer: usize) -> Self {
        Self {
            store,
            notifier,
            buffer: buffer.max(1),
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Opens a subscription on `channel`.
    ///
    /// With a cursor, every message after it is delivered first; without one,
    /// delivery starts with the next message appended. A cursor past the
    /// channel head is treated as the head.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Backfill`] if the store cannot be read.
    pub async fn subscribe(
        &self,
        channel: &Channel,
        cursor: Option<Sequence>,
    ) -> Result<Subscription, SubscriptionError> {
        // Attach before reading so nothing committed in between is missed
        let receiver = self.notifier.attach(channel);

        let head = self.store.latest_sequence(channel).await?;
        let start = match cursor {
            Some(cursor) => cursor.max(Sequence::ZERO).min(head),
            None => head,
        };
        let backlog = if start < head {
            self.store.list_since(channel, start).await?
        } else {
            Vec::new()
        };

        let id = Uuid::new_v4();
        let control = Arc::new(FeedControl::new());
        let (sender, events) = mpsc::channel(self.buffer);
        let state = control.state.subscribe();
        self.registry.insert(id, control.clone());

        tracing::debug!(
            target: "murmur::subscriptions::subscribe",
            "Subscription {} on {} starting after {} with {} backlog messages",
            id,
            channel,
            start,
            backlog.len()
        );

        let feed = Feed {
            id,
            channel: channel.clone(),
            last: start,
            store: self.store.clone(),
            sender,
            control: control.clone(),
            registry: self.registry.clone(),
        };
        control.set_task(tokio::spawn(feed.run(receiver, backlog)));

        Ok(Subscription {
            id,
            channel: channel.clone(),
            cursor: start,
            events,
            state,
            control,
            registry: self.registry.clone(),
        })
    }

    /// Same as [`Subscription::unsubscribe`].
    pub fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.unsubscribe();
    }

    /// Number of subscriptions that have not been disconnected.
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Disconnects every subscription. Their streams end immediately.
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.registry.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, control)) = self.registry.remove(&id) {
                control.disconnect();
            }
        }
        tracing::info!(target: "murmur::subscriptions::shutdown", "All subscriptions closed");
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.registry.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// The per-subscription task between the broadcast feed and the handle.
struct Feed {
    id: Uuid,
    channel: Channel,
    /// Sequence of the last event handed to the subscriber.
    last: Sequence,
    store: MessageStore,
    sender: mpsc::Sender<FeedItem>,
    control: Arc<FeedControl>,
    registry: Registry,
}

/// Why a feed stopped early.
enum Halt {
    /// The subscriber is gone.
    Closed,
    /// The live feed can no longer be trusted.
    Lost,
}

impl Feed {
    async fn run(mut self, mut receiver: broadcast::Receiver<ChangeEvent>, backlog: Vec<Message>) {
        if self.push_messages(backlog).await.is_err() {
            return;
        }
        self.control.set_state(SubscriptionState::Live);

        let halt = loop {
            let result = match receiver.recv().await {
                Ok(event) if event.sequence <= self.last => continue,
                Ok(event) if event.sequence == self.last.next() => self.push(event).await,
                Ok(event) => {
                    tracing::debug!(
                        target: "murmur::subscriptions::feed",
                        "Subscription {} saw {} after {}, recovering gap",
                        self.id,
                        event.sequence,
                        self.last
                    );
                    self.recover().await
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        target: "murmur::subscriptions::feed",
                        "Subscription {} lagged by {} events, recovering",
                        self.id,
                        skipped
                    );
                    self.recover().await
                }
                Err(RecvError::Closed) => Err(Halt::Lost),
            };
            if let Err(halt) = result {
                break halt;
            }
        };

        if let Halt::Lost = halt {
            self.lose().await;
        }
    }

    async fn recover(&mut self) -> Result<(), Halt> {
        match self.store.list_since(&self.channel, self.last).await {
            Ok(messages) => self.push_messages(messages).await,
            Err(e) => {
                tracing::warn!(
                    target: "murmur::subscriptions::feed",
                    "Subscription {} could not recover after {}: {}",
                    self.id,
                    self.last,
                    e
                );
                Err(Halt::Lost)
            }
        }
    }

    async fn push_messages(&mut self, messages: Vec<Message>) -> Result<(), Halt> {
        for message in messages {
            self.push(ChangeEvent::from(&message)).await?;
        }
        Ok(())
    }

    async fn push(&mut self, event: ChangeEvent) -> Result<(), Halt> {
        if event.sequence <= self.last {
            return Ok(());
        }
        let sequence = event.sequence;
        self.sender
            .send(Ok(event))
            .await
            .map_err(|_| Halt::Closed)?;
        self.last = sequence;
        Ok(())
    }

    async fn lose(self) {
        tracing::warn!(
            target: "murmur::subscriptions::feed",
            "Subscription {} on {} lost at cursor {}",
            self.id,
            self.channel,
            self.last
        );
        self.control.set_state(SubscriptionState::Disconnected);
        self.registry.remove(&self.id);
        let _ = self
            .sender
            .send(Err(SubscriptionError::SubscriptionLost {
                channel: self.channel.clone(),
                cursor: self.last,
            }))
            .await;
    }
}

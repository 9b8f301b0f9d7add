//! Per-channel broadcast streams for appended messages.
//!
//! Streams are created lazily on first attach and cleaned up on publish once
//! every receiver has been dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::types::ChangeEvent;
use crate::murmur::messages::{Channel, Message};

const DEFAULT_CAPACITY: usize = 256;

struct NotifierInner {
    streams: DashMap<Channel, broadcast::Sender<ChangeEvent>>,
    capacity: usize,
    attached: AtomicBool,
}

/// Fans committed messages out to every receiver attached to their channel.
///
/// Cloning is cheap and every clone shares the same streams.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the per-receiver backlog before it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                streams: DashMap::new(),
                capacity: capacity.max(1),
                attached: AtomicBool::new(true),
            }),
        }
    }

    pub fn attach(&self, channel: &Channel) -> broadcast::Receiver<ChangeEvent> {
        self.inner
            .streams
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    /// Publishes `message` to its channel and returns how many receivers got it.
    ///
    /// Nothing is delivered while the notifier is detached.
    pub fn publish(&self, message: &Message) -> usize {
        if !self.is_attached() {
            tracing::debug!(
                target: "murmur::message_streaming::publish",
                "Notifier detached, dropping event for {} at sequence {}",
                message.channel,
                message.sequence
            );
            return 0;
        }

        let Some(sender) = self.inner.streams.get(&message.channel) else {
            return 0;
        };

        match sender.send(ChangeEvent::from(message)) {
            Ok(delivered) => delivered,
            Err(_) => {
                drop(sender);
                // Another thread may have attached since the failed send
                self.inner
                    .streams
                    .remove_if(&message.channel, |_, sender| sender.receiver_count() == 0);
                0
            }
        }
    }

    /// Stops delivering events. Attached receivers stay open but miss
    /// everything published until [`ChangeNotifier::reattach`].
    pub fn detach(&self) {
        tracing::warn!(target: "murmur::message_streaming::detach", "Change notifier detached");
        self.inner.attached.store(false, Ordering::SeqCst);
    }

    pub fn reattach(&self) {
        tracing::info!(target: "murmur::message_streaming::reattach", "Change notifier reattached");
        self.inner.attached.store(true, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// Drops the channel's stream. Its receivers observe the stream as closed
    /// once they have drained what was already sent.
    pub fn close_channel(&self, channel: &Channel) {
        if self.inner.streams.remove(channel).is_some() {
            tracing::info!(
                target: "murmur::message_streaming::close_channel",
                "Closed live stream for {}",
                channel
            );
        }
    }

    /// Drops every stream.
    pub fn close_all(&self) {
        self.inner.streams.clear();
    }

    pub fn receiver_count(&self, channel: &Channel) -> usize {
        self.inner
            .streams
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("streams", &self.inner.streams.len())
            .field("capacity", &self.inner.capacity)
            .field("attached", &self.is_attached())
            .finish()
    }
}

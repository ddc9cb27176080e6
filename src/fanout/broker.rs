use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::domain::errors::CommandError;
use super::event::{Channel, LifecycleEvent};
use super::sink::EventSink;

// ============================================================================
// Event Broker - in-process subscription registry
// ============================================================================
//
//   Channel::Store(id) ──► broadcast::Sender ──► store staff subscriptions
//   Channel::Admin     ──► broadcast::Sender ──► admin subscriptions
//
// Each channel keeps its sender next to the set of live subscriber ids, so a
// channel is created by its first subscribe and torn down by its last
// unsubscribe under the same shard lock. Publishing to a channel without
// subscribers is a successful no-op.
//
// ============================================================================

pub type SubscriberId = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind; the count of events dropped for it.
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
    #[error("channel closed")]
    Closed,
}

struct ChannelEntry {
    sender: broadcast::Sender<Arc<LifecycleEvent>>,
    subscribers: HashSet<SubscriberId>,
}

struct BrokerInner {
    capacity: usize,
    channels: DashMap<Channel, ChannelEntry>,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn detach(&self, channel: Channel, id: SubscriberId) {
        if let Some(mut entry) = self.channels.get_mut(&channel) {
            entry.subscribers.remove(&id);
        }
        self.channels
            .remove_if(&channel, |_, entry| entry.subscribers.is_empty());
    }
}

#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                capacity: capacity.max(1),
                channels: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber on `channel`. The subscription is removed when
    /// the returned handle is dropped or `unsubscribe`d.
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = self.inner.capacity;

        let receiver = {
            let mut entry = self.inner.channels.entry(channel).or_insert_with(|| ChannelEntry {
                sender: broadcast::channel(capacity).0,
                subscribers: HashSet::new(),
            });
            entry.subscribers.insert(id);
            entry.sender.subscribe()
        };

        tracing::debug!(channel = %channel, subscriber_id = id, "Subscriber attached");
        Subscription {
            id,
            channel,
            receiver,
            broker: Arc::downgrade(&self.inner),
            attached: true,
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .channels
            .get(&channel)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Deliver to every current subscriber of `channel`; returns how many
    /// receivers the event was queued for.
    pub fn broadcast(&self, channel: Channel, event: Arc<LifecycleEvent>) -> usize {
        let sender = match self.inner.channels.get(&channel) {
            Some(entry) => entry.sender.clone(),
            None => return 0,
        };
        // Err only means every receiver went away since the lookup.
        sender.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl EventSink for EventBroker {
    fn name(&self) -> &str {
        "broker"
    }

    async fn publish(&self, channel: &Channel, event: &LifecycleEvent) -> Result<(), CommandError> {
        let receivers = self.broadcast(*channel, Arc::new(event.clone()));
        tracing::trace!(channel = %channel, receivers, event_type = %event.event_type, "Broadcast");
        Ok(())
    }
}

/// One connection's handle on a channel.
pub struct Subscription {
    id: SubscriberId,
    channel: Channel,
    receiver: broadcast::Receiver<Arc<LifecycleEvent>>,
    broker: Weak<BrokerInner>,
    attached: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Next event. `Lagged` means events were dropped and the caller should
    /// fully resynchronize; the subscription keeps working afterwards.
    pub async fn recv(&mut self) -> Result<Arc<LifecycleEvent>, SubscriptionError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    /// Non-blocking variant; `Ok(None)` when nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<Arc<LifecycleEvent>>, SubscriptionError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        if let Some(broker) = self.broker.upgrade() {
            broker.detach(self.channel, self.id);
            tracing::debug!(channel = %self.channel, subscriber_id = self.id, "Subscriber detached");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

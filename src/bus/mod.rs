//! Inter-pool message bus.
//!
//! Every consumer owns a bounded FIFO queue. A full queue drops its oldest
//! message; publishers never block and never see an error for it. Delivery
//! is at most once, FIFO per consumer, with no replay for late consumers.
//!
//! Consumers come in two kinds:
//! - pull consumers, read with [`MessageBus::receive`]
//! - push consumers, whose handlers run on one dispatcher task per owner

pub mod message;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BusError;

pub use message::{Message, MessagePayload, MessageType};

/// Default per-consumer queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Push-consumer callback. Errors and panics are contained by the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self)(message.clone()).await
    }
}

/// Returned by `subscribe`; pass to `unsubscribe` to remove the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub owner: String,
    pub message_type: MessageType,
    id: Uuid,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Consumers the message was enqueued on.
    pub delivered: usize,
    /// Older messages evicted to make room.
    pub dropped: usize,
}

/// Counters and queue depths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusHealth {
    pub consumers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub queue_depths: BTreeMap<String, usize>,
}

#[derive(Default)]
struct BusStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

/// Bounded FIFO with a type filter.
struct ConsumerQueue {
    types: StdMutex<HashSet<MessageType>>,
    queue: StdMutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl ConsumerQueue {
    fn new(types: HashSet<MessageType>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            types: StdMutex::new(types),
            queue: StdMutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn accepts(&self, message_type: MessageType) -> bool {
        self.types
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&message_type)
    }

    fn set_types(&self, types: HashSet<MessageType>) {
        *self.types.lock().unwrap_or_else(|e| e.into_inner()) = types;
    }

    /// Enqueue, evicting the oldest entry when full. Returns whether one was evicted.
    fn push(&self, message: Message) -> bool {
        let evicted = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(message);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<Message> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct HandlerEntry {
    id: Uuid,
    message_type: MessageType,
    handler: Arc<dyn MessageHandler>,
}

struct PushConsumer {
    queue: Arc<ConsumerQueue>,
    handlers: Arc<StdMutex<Vec<HandlerEntry>>>,
    dispatcher: JoinHandle<()>,
}

impl PushConsumer {
    fn handler_types(&self) -> HashSet<MessageType> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.message_type)
            .collect()
    }
}

pub struct MessageBus {
    pull: RwLock<HashMap<String, Arc<ConsumerQueue>>>,
    push: RwLock<HashMap<String, PushConsumer>>,
    default_capacity: usize,
    stats: Arc<BusStats>,
}

impl MessageBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            pull: RwLock::new(HashMap::new()),
            push: RwLock::new(HashMap::new()),
            default_capacity: default_capacity.max(1),
            stats: Arc::new(BusStats::default()),
        }
    }

    /// Register (or re-filter) a pull consumer. An empty `types` means every type.
    pub async fn register(&self, owner: &str, types: &[MessageType]) {
        self.register_with_capacity(owner, types, self.default_capacity)
            .await;
    }

    /// Register a pull consumer with its own queue capacity.
    ///
    /// Re-registering an existing owner only updates its filter.
    pub async fn register_with_capacity(&self, owner: &str, types: &[MessageType], capacity: usize) {
        let types: HashSet<MessageType> = if types.is_empty() {
            MessageType::ALL.into_iter().collect()
        } else {
            types.iter().copied().collect()
        };
        let mut pull = self.pull.write().await;
        match pull.get(owner) {
            Some(existing) => existing.set_types(types),
            None => {
                pull.insert(owner.to_string(), ConsumerQueue::new(types, capacity));
            }
        }
        debug!(owner, "Pull consumer registered");
    }

    /// Add a handler for one message type under `owner`.
    ///
    /// Handlers of one owner run sequentially in registration order.
    pub async fn subscribe<H>(&self, owner: &str, message_type: MessageType, handler: H) -> SubscriptionHandle
    where
        H: MessageHandler + 'static,
    {
        let id = Uuid::new_v4();
        let entry = HandlerEntry {
            id,
            message_type,
            handler: Arc::new(handler),
        };

        let mut push = self.push.write().await;
        let consumer = push.entry(owner.to_string()).or_insert_with(|| {
            let queue = ConsumerQueue::new(HashSet::new(), self.default_capacity);
            let handlers = Arc::new(StdMutex::new(Vec::new()));
            let dispatcher = tokio::spawn(dispatch_loop(
                owner.to_string(),
                Arc::clone(&queue),
                Arc::clone(&handlers),
                Arc::clone(&self.stats),
            ));
            PushConsumer {
                queue,
                handlers,
                dispatcher,
            }
        });
        consumer
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        consumer.queue.set_types(consumer.handler_types());

        debug!(owner, message_type = %message_type, "Handler subscribed");
        SubscriptionHandle {
            owner: owner.to_string(),
            message_type,
            id,
        }
    }

    /// Remove one handler. Returns `false` if it was already gone.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut push = self.push.write().await;
        let Some(consumer) = push.get(&handle.owner) else {
            return false;
        };

        let (removed, remaining) = {
            let mut handlers = consumer.handlers.lock().unwrap_or_else(|e| e.into_inner());
            let before = handlers.len();
            handlers.retain(|h| h.id != handle.id);
            (handlers.len() < before, handlers.len())
        };

        if remaining == 0 {
            if let Some(consumer) = push.remove(&handle.owner) {
                consumer.queue.close();
            }
        } else {
            consumer.queue.set_types(consumer.handler_types());
        }
        removed
    }

    /// Drop every consumer owned by `owner`. Queued messages are discarded.
    pub async fn unregister(&self, owner: &str) {
        self.pull.write().await.remove(owner);
        if let Some(consumer) = self.push.write().await.remove(owner) {
            consumer.queue.close();
        }
        debug!(owner, "Consumers unregistered");
    }

    /// Enqueue on every eligible consumer.
    ///
    /// Directed messages reach only the target's consumers; broadcasts reach
    /// every consumer except the publisher's own.
    pub async fn publish(&self, message: Message) -> Result<PublishReceipt, BusError> {
        if message.source_pool_id.trim().is_empty() {
            return Err(BusError::InvalidMessage("source_pool_id must not be empty".into()));
        }
        if message.target_pool_id.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(BusError::InvalidMessage("target_pool_id must not be empty".into()));
        }

        let message_type = message.message_type();
        let eligible = |owner: &str| match &message.target_pool_id {
            Some(target) => owner == target,
            None => owner != message.source_pool_id,
        };

        let mut queues: Vec<(String, Arc<ConsumerQueue>)> = Vec::new();
        for (owner, queue) in self.pull.read().await.iter() {
            if eligible(owner) && queue.accepts(message_type) {
                queues.push((owner.clone(), Arc::clone(queue)));
            }
        }
        for (owner, consumer) in self.push.read().await.iter() {
            if eligible(owner) && consumer.queue.accepts(message_type) {
                queues.push((owner.clone(), Arc::clone(&consumer.queue)));
            }
        }

        let mut receipt = PublishReceipt::default();
        for (owner, queue) in queues {
            if queue.push(message.clone()) {
                receipt.dropped += 1;
                warn!(owner = %owner, message_type = %message_type, "Consumer queue full, dropped oldest message");
            }
            receipt.delivered += 1;
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(receipt.delivered as u64, Ordering::Relaxed);
        self.stats
            .dropped
            .fetch_add(receipt.dropped as u64, Ordering::Relaxed);
        debug!(
            message_id = %message.id,
            source = %message.source_pool_id,
            message_type = %message_type,
            delivered = receipt.delivered,
            "Message published"
        );
        Ok(receipt)
    }

    /// Next message for a pull consumer, or `None` after `timeout`.
    pub async fn receive(&self, owner: &str, timeout: Duration) -> Option<Message> {
        let queue = self.pull.read().await.get(owner).map(Arc::clone)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = queue.pop() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, queue.notify.notified())
                .await
                .is_err()
            {
                return queue.pop();
            }
        }
    }

    /// Messages waiting for a pull consumer.
    pub async fn pending(&self, owner: &str) -> usize {
        self.pull
            .read()
            .await
            .get(owner)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn health(&self) -> BusHealth {
        let mut queue_depths = BTreeMap::new();
        let pull = self.pull.read().await;
        let push = self.push.read().await;
        for (owner, queue) in pull.iter() {
            *queue_depths.entry(owner.clone()).or_insert(0) += queue.len();
        }
        for (owner, consumer) in push.iter() {
            *queue_depths.entry(owner.clone()).or_insert(0) += consumer.queue.len();
        }
        BusHealth {
            consumers: pull.len() + push.len(),
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            handler_failures: self.stats.handler_failures.load(Ordering::Relaxed),
            queue_depths,
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        for consumer in self.push.get_mut().values() {
            consumer.queue.close();
            consumer.dispatcher.abort();
        }
    }
}

async fn dispatch_loop(
    owner: String,
    queue: Arc<ConsumerQueue>,
    handlers: Arc<StdMutex<Vec<HandlerEntry>>>,
    stats: Arc<BusStats>,
) {
    loop {
        while let Some(message) = queue.pop() {
            let message_type = message.message_type();
            let matching: Vec<Arc<dyn MessageHandler>> = handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .filter(|h| h.message_type == message_type)
                .map(|h| Arc::clone(&h.handler))
                .collect();

            for handler in matching {
                let outcome = AssertUnwindSafe(handler.handle(&message))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(owner = %owner, message_id = %message.id, error = %e, "Message handler failed");
                    }
                    Err(_) => {
                        stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(owner = %owner, message_id = %message.id, "Message handler panicked");
                    }
                }
            }
        }
        if queue.is_closed() {
            break;
        }
        queue.notify.notified().await;
    }
    debug!(owner = %owner, "Dispatcher stopped");
}

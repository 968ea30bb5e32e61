use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{Broker, BrokerConnection, BrokerError, Delivery, Subscription};

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl QueueState {
    fn push_back(&self, message: StoredMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_waiters();
    }

    /// Return messages to the head of the queue, keeping their relative order.
    fn requeue_front(&self, returned: impl DoubleEndedIterator<Item = StoredMessage>) {
        {
            let mut messages = self.messages.lock();
            for mut message in returned.rev() {
                message.redelivered = true;
                messages.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }
}

struct BrokerInner {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    online: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU64,
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Result<Arc<QueueState>, BrokerError> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connect("broker unreachable".into()))
        }
    }
}

/// Process-local durable broker.
///
/// Queues live as long as the broker handle, independent of connections,
/// so messages survive a stopped and restarted simulation. Clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                failing_connects: AtomicU32::new(0),
                connect_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Take the broker offline (connects, publishes and receives fail) or back online.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Ready messages in `queue`; unacknowledged deliveries are not counted.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .queue(queue)
            .map(|q| q.messages.lock().len())
            .unwrap_or(0)
    }

    /// Publish without a connection, e.g. to seed a queue in tests.
    pub fn inject(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.inner.queue(queue)?.push_back(StoredMessage {
            payload: payload.to_vec(),
            redelivered: false,
        });
        Ok(())
    }

    /// Declare a queue without a connection.
    pub fn declare(&self, queue: &str) {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.ensure_online()?;

        let pending_failure = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending_failure {
            return Err(BrokerError::Connect("connection refused".into()));
        }

        Ok(Box::new(InMemoryConnection {
            inner: Arc::clone(&self.inner),
            open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

struct InMemoryConnection {
    inner: Arc<BrokerInner>,
    open: bool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if !self.open {
            return Err(BrokerError::Closed);
        }
        self.inner.ensure_online()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        self.inner.queue(queue)?.push_back(StoredMessage {
            payload: payload.to_vec(),
            redelivered: false,
        });
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.ensure_open()
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        let state = self.inner.queue(queue)?;
        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            queue: state,
            next_tag: 1,
            unacked: BTreeMap::new(),
        }))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.open = false;
        Ok(())
    }
}

struct InMemorySubscription {
    inner: Arc<BrokerInner>,
    queue: Arc<QueueState>,
    next_tag: u64,
    unacked: BTreeMap<u64, StoredMessage>,
}

impl InMemorySubscription {
    fn take_next(&mut self) -> Option<Delivery> {
        let message = self.queue.messages.lock().pop_front()?;
        let tag = self.next_tag;
        self.next_tag += 1;
        let delivery = Delivery {
            tag,
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };
        self.unacked.insert(tag, message);
        Some(delivery)
    }

    fn settle(&mut self, tag: u64) -> Result<StoredMessage, BrokerError> {
        self.unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {tag}")))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let queue = Arc::clone(&self.queue);
        loop {
            // registered before the check so a concurrent publish is not missed
            let notified = queue.notify.notified();
            self.inner
                .ensure_online()
                .map_err(|e| BrokerError::Consume(e.to_string()))?;
            if let Some(delivery) = self.take_next() {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.settle(tag).map(|_| ())
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let message = self.settle(tag)?;
        if requeue {
            self.queue.requeue_front(std::iter::once(message));
        }
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        debug!(count = self.unacked.len(), "returning unacknowledged deliveries to queue");
        let returned = std::mem::take(&mut self.unacked);
        self.queue.requeue_front(returned.into_values());
    }
}

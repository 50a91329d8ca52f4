// Broker Channel Port
// Minimal contract over a durable, at-least-once work queue.
//
// The broker client's per-message callback is modelled as a pull stream
// (`DeliveryStream`) so the consuming task controls when the next message is
// taken. Each `Delivery` ends in exactly one `ack` or `nack`, enforced by
// ownership.

use async_trait::async_trait;
use thiserror::Error;

/// Broker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable or handshake failed
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    /// Queue redeclared with different properties
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Channel closed")]
    Closed,
}

/// Opens connections to one kind of broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect and open one logical channel
    ///
    /// # Errors
    /// - BrokerError::Connection if the broker cannot be reached. Never retried here.
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

/// One logical channel over a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Ensure the queue exists. No-op when already declared identically.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Enqueue a message. Does not wait for any consumer.
    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool)
        -> Result<(), BrokerError>;

    /// Cap unacknowledged deliveries on this channel
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming; deliveries stop when the channel is closed
    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Close channel then connection. Idempotent. Unacked deliveries are requeued.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Deliveries for one consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. `None` once the channel is closed.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Message envelope handed to the consumer
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge: the broker may discard the message
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negative-acknowledge: requeue or drop, per flag
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

// ============================================================================
// In-Memory Broker for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Debug, Clone)]
    struct Message {
        payload: Vec<u8>,
        persistent: bool,
        redelivered: bool,
    }

    #[derive(Default)]
    struct QueueState {
        durable: bool,
        ready: VecDeque<Message>,
        // delivery tag -> (channel id, message)
        unacked: HashMap<u64, (u64, Message)>,
        consumers: Vec<u64>,
        cursor: usize,
        dead: Vec<Message>,
        acked: usize,
    }

    struct ChannelState {
        open: bool,
        prefetch: u16,
        unacked: usize,
        inbox: VecDeque<(u64, Message)>,
        consuming: Option<String>,
    }

    impl ChannelState {
        fn has_capacity(&self) -> bool {
            self.open && (self.prefetch == 0 || self.unacked < self.prefetch as usize)
        }
    }

    #[derive(Default)]
    struct BrokerState {
        queues: HashMap<String, QueueState>,
        channels: HashMap<u64, ChannelState>,
        next_channel_id: u64,
        next_tag: u64,
        unreachable: bool,
        failing_connects: usize,
        failing_publishes: usize,
        failing_settles: usize,
        connects: usize,
    }

    impl BrokerState {
        /// Hand ready messages to consumers round-robin, honouring prefetch
        fn dispatch(&mut self, queue_name: &str) {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            while !queue.ready.is_empty() && !queue.consumers.is_empty() {
                let total = queue.consumers.len();
                let target = (0..total)
                    .map(|offset| (queue.cursor + offset) % total)
                    .find(|&idx| {
                        self.channels
                            .get(&queue.consumers[idx])
                            .map(ChannelState::has_capacity)
                            .unwrap_or(false)
                    });
                let Some(idx) = target else {
                    break;
                };
                queue.cursor = (idx + 1) % total;

                let channel_id = queue.consumers[idx];
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };
                self.next_tag += 1;
                let tag = self.next_tag;
                queue.unacked.insert(tag, (channel_id, message.clone()));
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.unacked += 1;
                    channel.inbox.push_back((tag, message));
                }
            }
        }

        /// Close a channel and return its unacked messages to the queue head
        fn close_channel(&mut self, channel_id: u64) {
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            if !channel.open {
                return;
            }
            channel.open = false;
            channel.inbox.clear();
            channel.unacked = 0;
            let consuming = channel.consuming.take();

            if let Some(queue_name) = consuming {
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    queue.consumers.retain(|id| *id != channel_id);
                    queue.cursor = 0;

                    let mut orphaned: Vec<u64> = queue
                        .unacked
                        .iter()
                        .filter(|(_, (owner, _))| *owner == channel_id)
                        .map(|(tag, _)| *tag)
                        .collect();
                    orphaned.sort_unstable();
                    for tag in orphaned.into_iter().rev() {
                        if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                            message.redelivered = true;
                            queue.ready.push_front(message);
                        }
                    }
                }
                self.dispatch(&queue_name);
            }
        }
    }

    /// Shared in-process broker
    ///
    /// Clones share the same state, so a test can hand one clone to a
    /// producer, another to consumers, and keep one for inspection.
    #[derive(Clone, Default)]
    pub struct InMemoryBroker {
        state: Arc<Mutex<BrokerState>>,
        notify: Arc<Notify>,
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Refuse every connection attempt until cleared
        pub fn set_unreachable(&self, unreachable: bool) {
            self.state.lock().unwrap().unreachable = unreachable;
        }

        /// Refuse the next `count` connection attempts
        pub fn fail_next_connects(&self, count: usize) {
            self.state.lock().unwrap().failing_connects = count;
        }

        /// Fail the next `count` publishes with a channel error
        pub fn fail_next_publishes(&self, count: usize) {
            self.state.lock().unwrap().failing_publishes = count;
        }

        /// Fail the next `count` ack/nack calls; the delivery stays unacked
        pub fn fail_next_settles(&self, count: usize) {
            self.state.lock().unwrap().failing_settles = count;
        }

        /// Successful connections so far
        pub fn connection_count(&self) -> usize {
            self.state.lock().unwrap().connects
        }

        /// Messages waiting for a consumer
        pub fn ready_count(&self, queue: &str) -> usize {
            self.with_queue(queue, |q| q.ready.len())
        }

        /// Messages delivered but not yet settled
        pub fn unacked_count(&self, queue: &str) -> usize {
            self.with_queue(queue, |q| q.unacked.len())
        }

        pub fn acked_count(&self, queue: &str) -> usize {
            self.with_queue(queue, |q| q.acked)
        }

        /// Payloads nacked without requeue
        pub fn dead_lettered(&self, queue: &str) -> Vec<Vec<u8>> {
            self.with_queue(queue, |q| q.dead.iter().map(|m| m.payload.clone()).collect())
        }

        pub fn open_channel_count(&self) -> usize {
            self.state
                .lock()
                .unwrap()
                .channels
                .values()
                .filter(|c| c.open)
                .count()
        }

        /// Simulate a broker restart: every channel drops, non-durable queues
        /// vanish and transient messages are lost.
        pub fn restart(&self) {
            let mut state = self.state.lock().unwrap();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.close_channel(id);
            }
            state.queues.retain(|_, q| q.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|m| m.persistent);
            }
            drop(state);
            self.notify.notify_waiters();
        }

        fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
            self.state
                .lock()
                .unwrap()
                .queues
                .get(queue)
                .map(f)
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl BrokerConnector for InMemoryBroker {
        async fn connect(&self, _address: &str) -> Result<Box<dyn BrokerChannel>, BrokerError> {
            let mut state = self.state.lock().unwrap();
            if state.unreachable {
                return Err(BrokerError::Connection("broker unreachable".to_string()));
            }
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BrokerError::Connection("connection refused".to_string()));
            }
            state.connects += 1;
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channels.insert(
                id,
                ChannelState {
                    open: true,
                    prefetch: 0,
                    unacked: 0,
                    inbox: VecDeque::new(),
                    consuming: None,
                },
            );
            Ok(Box::new(InMemoryChannel {
                broker: self.clone(),
                id,
            }))
        }
    }

    struct InMemoryChannel {
        broker: InMemoryBroker,
        id: u64,
    }

    impl InMemoryChannel {
        fn ensure_open(&self, state: &BrokerState) -> Result<(), BrokerError> {
            match state.channels.get(&self.id) {
                Some(channel) if channel.open => Ok(()),
                _ => Err(BrokerError::Closed),
            }
        }
    }

    #[async_trait]
    impl BrokerChannel for InMemoryChannel {
        async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            match state.queues.get(name) {
                Some(existing) if existing.durable != durable => Err(BrokerError::Precondition(
                    format!("queue '{}' already declared with durable={}", name, existing.durable),
                )),
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        name.to_string(),
                        QueueState {
                            durable,
                            ..QueueState::default()
                        },
                    );
                    Ok(())
                }
            }
        }

        async fn publish(
            &self,
            queue: &str,
            payload: &[u8],
            persistent: bool,
        ) -> Result<(), BrokerError> {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BrokerError::Channel("publish rejected".to_string()));
            }
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            q.ready.push_back(Message {
                payload: payload.to_vec(),
                persistent,
                redelivered: false,
            });
            state.dispatch(queue);
            drop(state);
            self.broker.notify.notify_waiters();
            Ok(())
        }

        async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.prefetch = count;
            }
            Ok(())
        }

        async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            if let Some(channel) = state.channels.get_mut(&self.id) {
                if channel.consuming.is_some() {
                    return Err(BrokerError::Channel("channel already consuming".to_string()));
                }
                channel.consuming = Some(queue.to_string());
            }
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(self.id);
            }
            state.dispatch(queue);
            drop(state);
            self.broker.notify.notify_waiters();

            Ok(Box::new(InMemoryDeliveryStream {
                broker: self.broker.clone(),
                channel_id: self.id,
                queue: queue.to_string(),
            }))
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.broker.state.lock().unwrap().close_channel(self.id);
            self.broker.notify.notify_waiters();
            Ok(())
        }
    }

    struct InMemoryDeliveryStream {
        broker: InMemoryBroker,
        channel_id: u64,
        queue: String,
    }

    #[async_trait]
    impl DeliveryStream for InMemoryDeliveryStream {
        async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
            loop {
                let notified = self.broker.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = self.broker.state.lock().unwrap();
                    let channel = state.channels.get_mut(&self.channel_id)?;
                    if !channel.open {
                        return None;
                    }
                    if let Some((tag, message)) = channel.inbox.pop_front() {
                        let acker = InMemoryAcker {
                            broker: self.broker.clone(),
                            channel_id: self.channel_id,
                            queue: self.queue.clone(),
                            tag,
                        };
                        return Some(Ok(Delivery::new(
                            tag,
                            message.payload,
                            message.redelivered,
                            Box::new(acker),
                        )));
                    }
                }

                notified.await;
            }
        }
    }

    struct InMemoryAcker {
        broker: InMemoryBroker,
        channel_id: u64,
        queue: String,
        tag: u64,
    }

    impl InMemoryAcker {
        fn settle(
            &self,
            outcome: impl FnOnce(&mut QueueState, Message),
        ) -> Result<(), BrokerError> {
            let mut state = self.broker.state.lock().unwrap();
            if !state
                .channels
                .get(&self.channel_id)
                .map(|c| c.open)
                .unwrap_or(false)
            {
                return Err(BrokerError::Closed);
            }
            if state.failing_settles > 0 {
                state.failing_settles -= 1;
                return Err(BrokerError::Channel("settle refused".to_string()));
            }
            let queue = state
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| BrokerError::QueueNotFound(self.queue.clone()))?;
            let (_, message) = queue
                .unacked
                .remove(&self.tag)
                .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", self.tag)))?;
            outcome(queue, message);
            if let Some(channel) = state.channels.get_mut(&self.channel_id) {
                channel.unacked = channel.unacked.saturating_sub(1);
            }
            state.dispatch(&self.queue);
            drop(state);
            self.broker.notify.notify_waiters();
            Ok(())
        }
    }

    #[async_trait]
    impl Acker for InMemoryAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.settle(|queue, _| queue.acked += 1)
        }

        async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
            self.settle(|queue, mut message| {
                if requeue {
                    message.redelivered = true;
                    queue.ready.push_back(message);
                } else {
                    queue.dead.push(message);
                }
            })
        }
    }
}

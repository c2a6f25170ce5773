//! In-process broker
//!
//! [`MemoryBroker`] holds one queue and at most one active subscription. It
//! honours prefetch, records every topology call and settlement, and can be
//! told to refuse connections or drop live connections and channels, so the
//! connection manager and consumption loop can be driven through failures
//! deterministically.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    BrokerError,
    r#trait::{
        Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryReceipt,
        DeliveryStream, FailureHandler,
    },
};

/// A broker call recorded by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    DeclareExchange(String),
    DeclareQueue {
        queue: String,
        dead_letter_exchange: String,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Prefetch(u16),
    Consume {
        queue: String,
        consumer_tag: String,
    },
    CloseChannel,
    CloseConnection,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack(u64),
    Reject(u64),
}

impl Settlement {
    #[must_use]
    pub const fn delivery_tag(self) -> u64 {
        match self {
            Self::Ack(tag) | Self::Reject(tag) => tag,
        }
    }
}

struct ConnectionHandle {
    open: Arc<AtomicBool>,
    closed: CancellationToken,
    handler: Arc<Mutex<Option<FailureHandler>>>,
}

struct ChannelHandle {
    id: u64,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

struct Subscriber {
    channel: u64,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

#[derive(Default)]
struct State {
    refuse_connects: u32,
    closed_connects: u32,
    refuse_topology: u32,
    failed_channel_closes: u32,
    connect_delay: Option<Duration>,
    connect_attempts: u32,

    connections: Vec<ConnectionHandle>,
    channels: Vec<ChannelHandle>,
    prefetch: Vec<(u64, u16)>,
    subscriber: Option<Subscriber>,
    subscriptions: usize,

    next_tag: u64,
    pending: VecDeque<(u64, Vec<u8>)>,
    unsettled: usize,

    operations: Vec<Operation>,
    settlements: Vec<Settlement>,
}

struct Inner {
    state: Mutex<State>,
    changed: Notify,
    ids: AtomicU64,
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                ids: AtomicU64::new(1),
            }),
        }
    }

    /// A [`Connector`] for this broker.
    #[must_use]
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.inner.state.lock().refuse_connects = count;
    }

    /// Hand out `count` connections that report themselves closed straight away.
    pub fn hand_out_closed_connections(&self, count: u32) {
        self.inner.state.lock().closed_connects = count;
    }

    /// Fail the next `count` exchange declarations.
    pub fn refuse_topology(&self, count: u32) {
        self.inner.state.lock().refuse_topology = count;
    }

    /// Report an error from the next `count` channel closes. The channel is
    /// still closed.
    pub fn fail_channel_closes(&self, count: u32) {
        self.inner.state.lock().failed_channel_closes = count;
    }

    /// Take `delay` to answer each connection attempt.
    pub fn delay_connections(&self, delay: Duration) {
        self.inner.state.lock().connect_delay = Some(delay);
    }

    /// Enqueue a message; returns its delivery tag.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> u64 {
        let tag = {
            let mut state = self.inner.state.lock();
            state.next_tag += 1;
            let tag = state.next_tag;
            state.pending.push_back((tag, body.into()));
            self.pump(&mut state);
            tag
        };
        self.inner.changed.notify_waiters();
        tag
    }

    /// Drop every live connection as if the network failed, running their
    /// failure handlers.
    pub fn fail_connections(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            state.subscriber = None;
            for channel in state.channels.drain(..) {
                channel.open.store(false, Ordering::SeqCst);
                channel.shutdown.cancel();
            }
            std::mem::take(&mut state.connections)
        };

        for handle in handles {
            handle.open.store(false, Ordering::SeqCst);
            handle.closed.cancel();
            if let Some(handler) = handle.handler.lock().as_ref() {
                handler(BrokerError::Connection("connection reset".to_string()));
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Shut down every open channel as if the broker closed them, leaving
    /// connections alone.
    pub fn close_channels(&self) {
        {
            let mut state = self.inner.state.lock();
            state.subscriber = None;
            for channel in state.channels.drain(..) {
                channel.open.store(false, Ordering::SeqCst);
                channel.shutdown.cancel();
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Connection attempts made, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.inner.state.lock().connect_attempts
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .filter(|handle| handle.open.load(Ordering::SeqCst))
            .count()
    }

    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.state.lock().operations.clone()
    }

    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.state.lock().settlements.clone()
    }

    /// Subscriptions made since the broker was created.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.inner.state.lock().subscriptions
    }

    /// Messages not yet delivered to a consumer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Wait until at least `count` deliveries have been settled.
    pub async fn wait_for_settlements(&self, count: usize) {
        self.wait_until(|state| state.settlements.len() >= count).await;
    }

    /// Wait until at least `count` subscriptions have been made.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        self.wait_until(|state| state.subscriptions >= count).await;
    }

    async fn wait_until(&self, condition: impl Fn(&State) -> bool) {
        loop {
            let changed = self.inner.changed.notified();
            if condition(&self.inner.state.lock()) {
                return;
            }
            changed.await;
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, operation: Operation) {
        self.inner.state.lock().operations.push(operation);
        self.inner.changed.notify_waiters();
    }

    /// Push pending messages to the subscriber while prefetch allows.
    fn pump(&self, state: &mut State) {
        while let Some(subscriber) = state.subscriber.as_ref() {
            let channel_id = subscriber.channel;
            let prefetch = usize::from(subscriber.prefetch);
            if prefetch > 0 && state.unsettled >= prefetch {
                return;
            }

            let Some((tag, body)) = state.pending.pop_front() else {
                return;
            };

            let channel_open = state
                .channels
                .iter()
                .find(|channel| channel.id == channel_id)
                .map(|channel| Arc::clone(&channel.open))
                .unwrap_or_default();

            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: false,
                body,
                receipt: DeliveryReceipt::new(
                    tag,
                    Box::new(MemoryAcker {
                        broker: self.clone(),
                        delivery_tag: tag,
                        channel_open,
                    }),
                ),
            };

            let sent = state
                .subscriber
                .as_ref()
                .map(|subscriber| subscriber.sender.send(Ok(delivery)));

            match sent {
                Some(Ok(())) => state.unsettled += 1,
                Some(Err(mpsc::error::SendError(returned))) => {
                    if let Ok(delivery) = returned {
                        state.pending.push_front((tag, delivery.body));
                    }
                    state.subscriber = None;
                }
                None => return,
            }
        }
    }

    fn settle(&self, settlement: Settlement) {
        {
            let mut state = self.inner.state.lock();
            state.settlements.push(settlement);
            state.unsettled = state.unsettled.saturating_sub(1);
            self.pump(&mut state);
        }
        self.inner.changed.notify_waiters();
    }
}

/// [`Connector`] for a [`MemoryBroker`].
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let delay = self.broker.inner.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let connection = {
            let mut state = self.broker.inner.state.lock();
            state.connect_attempts += 1;

            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(BrokerError::Connection("connection refused".to_string()));
            }

            let open = if state.closed_connects > 0 {
                state.closed_connects -= 1;
                false
            } else {
                true
            };

            let connection = MemoryConnection {
                broker: self.broker.clone(),
                open: Arc::new(AtomicBool::new(open)),
                closed: CancellationToken::new(),
                handler: Arc::default(),
            };
            state.connections.push(ConnectionHandle {
                open: Arc::clone(&connection.open),
                closed: connection.closed.clone(),
                handler: Arc::clone(&connection.handler),
            });
            connection
        };
        self.broker.inner.changed.notify_waiters();

        Ok(Box::new(connection))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
    closed: CancellationToken,
    handler: Arc<Mutex<Option<FailureHandler>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_failure(&self, handler: FailureHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }

        let channel = MemoryChannel {
            broker: self.broker.clone(),
            id: self.broker.next_id(),
            open: Arc::new(AtomicBool::new(true)),
            shutdown: self.closed.child_token(),
        };
        self.broker.inner.state.lock().channels.push(ChannelHandle {
            id: channel.id,
            open: Arc::clone(&channel.open),
            shutdown: channel.shutdown.clone(),
        });

        Ok(Box::new(channel))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
        self.broker.record(Operation::CloseConnection);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            Ok(())
        } else {
            Err(BrokerError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        {
            let mut state = self.broker.inner.state.lock();
            if state.refuse_topology > 0 {
                state.refuse_topology -= 1;
                return Err(BrokerError::Topology(format!(
                    "exchange {exchange}: precondition failed"
                )));
            }
        }
        self.broker
            .record(Operation::DeclareExchange(exchange.to_string()));
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.record(Operation::DeclareQueue {
            queue: queue.to_string(),
            dead_letter_exchange: dead_letter_exchange.to_string(),
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.record(Operation::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .inner
            .state
            .lock()
            .prefetch
            .push((self.id, count));
        self.broker.record(Operation::Prefetch(count));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.inner.state.lock();
            let prefetch = state
                .prefetch
                .iter()
                .rev()
                .find(|(channel, _)| *channel == self.id)
                .map_or(0, |(_, count)| *count);

            // Deliveries handed to an earlier subscription and never settled
            // would be requeued by a real broker
            state.unsettled = 0;
            state.subscriber = Some(Subscriber {
                channel: self.id,
                prefetch,
                sender,
            });
            state.subscriptions += 1;
            state.operations.push(Operation::Consume {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
            });
            self.broker.pump(&mut state);
        }
        self.broker.inner.changed.notify_waiters();

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        let failed = {
            let mut state = self.broker.inner.state.lock();
            state.channels.retain(|channel| channel.id != self.id);
            if state
                .subscriber
                .as_ref()
                .is_some_and(|subscriber| subscriber.channel == self.id)
            {
                state.subscriber = None;
            }
            let failed = state.failed_channel_closes > 0;
            state.failed_channel_closes = state.failed_channel_closes.saturating_sub(1);
            failed
        };
        self.broker.record(Operation::CloseChannel);

        if failed {
            return Err(BrokerError::Channel(format!(
                "channel {}: close-ok not received",
                self.id
            )));
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    delivery_tag: u64,
    channel_open: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), BrokerError> {
        if !self.channel_open.load(Ordering::SeqCst) {
            return Err(BrokerError::Acknowledge {
                delivery_tag: self.delivery_tag,
                reason: "channel is closed".to_string(),
            });
        }
        self.broker.settle(settlement);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let tag = self.delivery_tag;
        self.settle(Settlement::Ack(tag))
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        let tag = self.delivery_tag;
        self.settle(Settlement::Reject(tag))
    }
}

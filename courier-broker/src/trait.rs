//! The seam between courier and a broker client.
//!
//! [`ConnectionManager`](crate::ConnectionManager) and
//! [`ConsumptionLoop`](crate::ConsumptionLoop) only talk to these traits; the
//! lapin-backed implementation lives in [`backends::amqp`](crate::backends::amqp)
//! and an in-memory one in [`backends::memory`](crate::backends::memory).

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::BrokerError;

/// Invoked when a live connection fails. May be called from any thread.
pub type FailureHandler = Box<dyn Fn(BrokerError) + Send + Sync>;

/// Deliveries pushed by the broker for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    /// If the broker can't be reached or refuses the connection.
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// One connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Register the handler to run when this connection fails. Replaces any
    /// earlier handler.
    fn on_failure(&self, handler: FailureHandler);

    /// # Errors
    /// If the connection is gone or refuses the channel.
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// # Errors
    /// If the close handshake fails.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on a connection. Owned by exactly one user and never reused
/// once [`BrokerChannel::shutdown`] has fired.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Cancelled once the channel has shut down, for whatever reason.
    fn shutdown(&self) -> CancellationToken;

    /// Declare a durable direct exchange.
    ///
    /// # Errors
    /// If the broker refuses the declaration.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable, non-exclusive, non-auto-delete queue that
    /// dead-letters into `dead_letter_exchange`.
    ///
    /// # Errors
    /// If the broker refuses the declaration, e.g. the queue exists with
    /// other arguments.
    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), BrokerError>;

    /// # Errors
    /// If the broker refuses the binding.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries on this channel.
    ///
    /// # Errors
    /// If the broker refuses the setting.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Subscribe with manual acknowledgement.
    ///
    /// # Errors
    /// If the broker refuses the subscription.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    /// # Errors
    /// If the close handshake fails.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send {
    /// Acknowledge this delivery only.
    ///
    /// # Errors
    /// If the channel the delivery arrived on is no longer usable.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Negatively acknowledge this delivery only, without requeue.
    ///
    /// # Errors
    /// If the channel the delivery arrived on is no longer usable.
    async fn reject(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A message pushed by the broker, with the means to settle it.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub receipt: DeliveryReceipt,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Settles a delivery at most once: both operations consume the receipt.
pub struct DeliveryReceipt {
    delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl DeliveryReceipt {
    #[must_use]
    pub fn new(delivery_tag: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            acker,
        }
    }

    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// # Errors
    /// If the channel the delivery arrived on is no longer usable.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// # Errors
    /// If the channel the delivery arrived on is no longer usable.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

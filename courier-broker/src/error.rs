//! Error types for the broker side of courier.
//!
//! Connection-level failures are retried by the [`ConnectionManager`](crate::ConnectionManager);
//! per-delivery failures are turned into rejections by the consumption loop
//! and never escape it.

use courier_common::Cancelled;
use courier_delivery::{DispatchError, PayloadError};
use thiserror::Error;

/// Top-level broker error type.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Opening the connection failed, or it came back not open.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// Opening or closing a channel failed.
    #[error("Broker channel error: {0}")]
    Channel(String),

    /// Declaring the exchange, queue, binding or prefetch failed.
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    /// Subscribing, or the consumer stream itself, failed.
    #[error("Consumer error: {0}")]
    Consume(String),

    /// Settling a delivery failed.
    #[error("Failed to settle delivery {delivery_tag}: {reason}")]
    Acknowledge { delivery_tag: u64, reason: String },

    /// There is no open connection to create a channel on.
    #[error("Not connected to the broker")]
    NotConnected,

    /// The connection manager has been disposed.
    #[error("Connection manager has been disposed")]
    Disposed,

    #[error("Broker operation cancelled")]
    Cancelled,

    /// Every connection attempt in the budget failed.
    #[error("Gave up connecting to the broker after {attempts} attempts: {last}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        last: Box<BrokerError>,
    },
}

impl From<Cancelled> for BrokerError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl BrokerError {
    /// Returns `true` if the connection retry budget ran out.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. })
    }

    /// Returns `true` if the operation stopped because of shutdown.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Why a single delivery was rejected.
#[derive(Debug, Error)]
pub enum HandlingError {
    /// The body isn't an email request.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// The request couldn't be dispatched.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

//! Broker side of courier
//!
//! This crate provides:
//! - The [`ConnectionManager`], which owns the single broker connection and
//!   reconnects it in the background when it fails
//! - The [`ConsumptionLoop`], which declares the queue topology, consumes
//!   email requests and settles each delivery exactly once
//! - The [`r#trait`] seam over the broker client, with a lapin-backed AMQP
//!   implementation and an in-memory one in [`backends`]

pub mod backends;
mod config;
mod connection;
mod consumer;
mod error;
pub mod r#trait;

pub use config::{BrokerConfig, ReconnectPolicy, Topology};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::ConsumptionLoop;
pub use error::{BrokerError, HandlingError};
pub use r#trait::{
    Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryReceipt,
    DeliveryStream, FailureHandler,
};

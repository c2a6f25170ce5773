//! Broker client implementations
//!
//! - `amqp`: lapin-backed AMQP 0-9-1 client used in production
//! - `memory`: in-process broker for tests, with failure injection

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector, Operation, Settlement};

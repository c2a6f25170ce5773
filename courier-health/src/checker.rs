//! Health check logic

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Thread-safe readiness flags for the worker's components
///
/// The broker crate flips these as the connection and the consumer come and
/// go; the probes only read them.
#[derive(Debug, Default)]
pub struct HealthChecker {
    /// Whether the broker connection is open
    broker_ready: AtomicBool,

    /// Whether the consumer is subscribed to the queue
    consumer_ready: AtomicBool,

    /// Deliveries currently being handled
    in_flight: AtomicU64,
}

impl HealthChecker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the broker connection as open or lost
    pub fn set_broker_ready(&self, ready: bool) {
        self.broker_ready.store(ready, Ordering::Relaxed);
        tracing::debug!(ready, "Broker readiness updated");
    }

    /// Mark the consumer as subscribed or not
    pub fn set_consumer_ready(&self, ready: bool) {
        self.consumer_ready.store(ready, Ordering::Relaxed);
        tracing::debug!(ready, "Consumer readiness updated");
    }

    /// A delivery handler started
    pub fn delivery_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery handler settled its delivery
    pub fn delivery_finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// For liveness, we just need to respond. If we can't respond, the HTTP
    /// server itself is dead, which the orchestrator detects via timeout.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        true
    }

    /// Ready when connected to the broker and subscribed to the queue.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let broker_ok = self.broker_ready.load(Ordering::Relaxed);
        let consumer_ok = self.consumer_ready.load(Ordering::Relaxed);
        let ready = broker_ok && consumer_ok;

        if !ready {
            tracing::debug!(
                broker_ready = broker_ok,
                consumer_ready = consumer_ok,
                "Readiness check failed"
            );
        }

        ready
    }

    /// Get detailed readiness status for debugging
    #[must_use]
    pub fn get_status(&self) -> HealthStatus {
        HealthStatus {
            alive: self.is_alive(),
            ready: self.is_ready(),
            broker_ready: self.broker_ready.load(Ordering::Relaxed),
            consumer_ready: self.consumer_ready.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Detailed health status information
#[derive(Debug, Clone, serde::Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct HealthStatus {
    pub alive: bool,
    pub ready: bool,
    pub broker_ready: bool,
    pub consumer_ready: bool,
    pub in_flight: u64,
}

//! Queue consumption
//!
//! [`ConsumptionLoop::start`] declares the topology, subscribes, and pulls
//! deliveries until shutdown. Each delivery is handled in its own task and
//! settled exactly once: acked when dispatch succeeds, rejected without
//! requeue (so the broker dead-letters it) on any failure, panics included.
//! Losing the channel or the connection leads to a fresh channel, topology
//! and subscription rather than an error.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use courier_common::{incoming, internal, tracing};
use courier_delivery::{Dispatch, EmailRequest};
use courier_health::HealthChecker;
use courier_tracing::traced;
use futures_util::{FutureExt, StreamExt};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    BrokerConfig, BrokerError, ConnectionManager, Topology,
    error::HandlingError,
    r#trait::{BrokerChannel, Delivery, DeliveryStream},
};

/// Upper bound on the channel close handshake during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An open channel with an active subscription on it.
struct Subscription {
    channel: Box<dyn BrokerChannel>,
    deliveries: DeliveryStream,
}

/// Why pulling from a subscription stopped.
enum Interruption {
    Shutdown,
    Lost(String),
}

/// Consumes the request queue and hands each request to a [`Dispatch`].
pub struct ConsumptionLoop {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<dyn Dispatch>,
    topology: Topology,
    drain_timeout: Duration,
    resubscribe_delay: Duration,
    health: Option<Arc<HealthChecker>>,
}

impl ConsumptionLoop {
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        dispatcher: Arc<dyn Dispatch>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            connection,
            dispatcher,
            topology: config.topology.clone(),
            drain_timeout: config.drain_timeout(),
            resubscribe_delay: config.resubscribe_delay(),
            health: None,
        }
    }

    /// Report subscription state and in-flight deliveries to `health`.
    #[must_use]
    pub fn with_health_checker(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    /// Consume until `cancel` fires, then drain in-flight deliveries and close
    /// the channel.
    ///
    /// # Errors
    /// If the first connection or the first topology declaration fails, or
    /// if the connection manager gives up reconnecting.
    #[traced(instrument(level = tracing::Level::INFO, skip_all, fields(queue = %self.topology.queue)), timing(precision = "s"))]
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.connection.ensure_connected(cancel).await?;
        let mut subscription = Some(self.subscribe().await?);

        // Only cancelled once draining has timed out, so shutdown lets
        // in-flight retries run to completion first
        let dispatch_cancel = CancellationToken::new();
        let mut handlers = JoinSet::new();
        let mut outcome = Ok(());

        while let Some(current) = subscription.as_mut() {
            match self
                .pump(current, &mut handlers, cancel, &dispatch_cancel)
                .await
            {
                Interruption::Shutdown => break,
                Interruption::Lost(reason) => {
                    incoming!(level = WARN, reason = %reason, "Subscription lost: {reason}");
                    self.set_consumer_ready(false);
                    // The condemned channel is never reused
                    subscription = None;

                    match self.recover(cancel).await {
                        Ok(recovered) => subscription = recovered,
                        Err(e) => {
                            internal!(level = ERROR, error = %e, "Consumption stopping: {e}");
                            outcome = Err(e);
                        }
                    }
                }
            }
        }

        self.shutdown(subscription, handlers, dispatch_cancel).await;
        outcome
    }

    /// Open a channel, declare the topology on it and subscribe.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        let channel = self.connection.create_channel().await?;

        let deliveries = match self.declare_and_consume(channel.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if channel.is_open()
                    && let Err(close) = channel.close().await
                {
                    internal!(level = WARN, error = %close, "Failed to close consumer channel: {close}");
                }
                return Err(e);
            }
        };

        incoming!(
            level = INFO,
            queue = %self.topology.queue,
            exchange = %self.topology.exchange,
            prefetch = self.topology.prefetch,
            "Subscribed to {}",
            self.topology.queue
        );
        self.set_consumer_ready(true);

        Ok(Subscription {
            channel,
            deliveries,
        })
    }

    async fn declare_and_consume(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<DeliveryStream, BrokerError> {
        let topology = &self.topology;

        channel.declare_exchange(&topology.exchange).await?;
        channel
            .declare_queue(&topology.queue, &topology.dead_letter_exchange())
            .await?;
        channel
            .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
            .await?;
        channel.set_prefetch(topology.prefetch).await?;

        channel
            .consume(&topology.queue, &topology.consumer_tag)
            .await
    }

    /// Resubscribe after a loss, retrying until it works, shutdown is
    /// requested, or the connection manager has given up.
    async fn recover(&self, cancel: &CancellationToken) -> Result<Option<Subscription>, BrokerError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(fatal) = self.connection.fatal_error() {
                return Err(fatal);
            }

            let attempt = async {
                self.connection.ensure_connected(cancel).await?;
                self.subscribe().await
            };

            match attempt.await {
                Ok(subscription) => return Ok(Some(subscription)),
                Err(BrokerError::Cancelled) => return Ok(None),
                Err(e) if self.connection.fatal_error().is_some() => return Err(e),
                Err(e) => {
                    let delay = self.resubscribe_delay;
                    internal!(
                        level = WARN,
                        error = %e,
                        ?delay,
                        "Resubscribe failed, retrying in {delay:?}: {e}"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = self.connection.terminated() => {}
                () = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }
    }

    /// Pull deliveries from `subscription` until it is lost or shutdown is
    /// requested, spawning a handler for each.
    async fn pump(
        &self,
        subscription: &mut Subscription,
        handlers: &mut JoinSet<()>,
        cancel: &CancellationToken,
        dispatch_cancel: &CancellationToken,
    ) -> Interruption {
        let channel_shutdown = subscription.channel.shutdown();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return Interruption::Shutdown,
                () = channel_shutdown.cancelled() => {
                    return Interruption::Lost("channel shut down".to_string());
                }
                () = self.connection.terminated() => {
                    return Interruption::Lost("broker connection terminated".to_string());
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => reap(joined),
                next = subscription.deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        handlers.spawn(handle(
                            Arc::clone(&self.dispatcher),
                            delivery,
                            dispatch_cancel.clone(),
                            self.health.clone(),
                        ));
                    }
                    Some(Err(e)) => return Interruption::Lost(e.to_string()),
                    None => return Interruption::Lost("consumer stream ended".to_string()),
                },
            }
        }
    }

    /// Stop consuming: wait for in-flight handlers (cancelling their retries
    /// once `drain_timeout` passes), then close the channel.
    #[traced(instrument(level = tracing::Level::INFO, skip_all), timing(precision = "ms"))]
    async fn shutdown(
        &self,
        subscription: Option<Subscription>,
        mut handlers: JoinSet<()>,
        dispatch_cancel: CancellationToken,
    ) {
        self.set_consumer_ready(false);

        let channel = subscription.map(|Subscription { channel, deliveries }| {
            drop(deliveries);
            channel
        });

        let in_flight = handlers.len();
        if in_flight > 0 {
            internal!(
                level = INFO,
                in_flight,
                "Waiting up to {:?} for {in_flight} in-flight deliveries",
                self.drain_timeout
            );

            let drained = tokio::time::timeout(self.drain_timeout, async {
                while let Some(joined) = handlers.join_next().await {
                    reap(joined);
                }
            })
            .await;

            if drained.is_err() {
                internal!(
                    level = WARN,
                    remaining = handlers.len(),
                    "Drain timed out, cancelling remaining deliveries"
                );
                dispatch_cancel.cancel();
                while let Some(joined) = handlers.join_next().await {
                    reap(joined);
                }
            }
        }

        if let Some(channel) = channel
            && channel.is_open()
        {
            match tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await {
                Ok(Ok(())) => internal!(level = DEBUG, "Consumer channel closed"),
                Ok(Err(e)) => {
                    internal!(level = WARN, error = %e, "Failed to close consumer channel: {e}");
                }
                Err(_) => internal!(level = WARN, "Timed out closing consumer channel"),
            }
        }

        internal!(level = INFO, "Consumption stopped");
    }

    fn set_consumer_ready(&self, ready: bool) {
        if let Some(health) = &self.health {
            health.set_consumer_ready(ready);
        }
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        internal!(level = ERROR, error = %e, "Delivery handler task failed: {e}");
    }
}

/// Decode, dispatch and settle one delivery.
async fn handle(
    dispatcher: Arc<dyn Dispatch>,
    delivery: Delivery,
    cancel: CancellationToken,
    health: Option<Arc<HealthChecker>>,
) {
    let Delivery {
        delivery_tag,
        redelivered,
        body,
        receipt,
    } = delivery;

    if let Some(health) = &health {
        health.delivery_started();
    }
    incoming!(level = DEBUG, delivery_tag, redelivered, "Received delivery {delivery_tag}");

    let outcome = AssertUnwindSafe(process(dispatcher.as_ref(), &body, &cancel))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlingError::Panicked(message))
        });

    let settled = match outcome {
        Ok(()) => {
            incoming!(level = DEBUG, delivery_tag, "Acknowledging delivery {delivery_tag}");
            receipt.ack().await
        }
        Err(e) => {
            incoming!(
                level = WARN,
                delivery_tag,
                error = %e,
                "Rejecting delivery {delivery_tag} without requeue: {e}"
            );
            receipt.reject().await
        }
    };

    if let Err(e) = settled {
        incoming!(level = ERROR, delivery_tag, error = %e, "{e}");
    }

    if let Some(health) = &health {
        health.delivery_finished();
    }
}

async fn process(
    dispatcher: &dyn Dispatch,
    body: &[u8],
    cancel: &CancellationToken,
) -> Result<(), HandlingError> {
    let request = EmailRequest::from_payload(body)?;
    dispatcher.send(&request, cancel).await?;
    Ok(())
}

use std::{future::pending, sync::Arc};

use courier_broker::{BrokerConfig, ConnectionManager, ConsumptionLoop, backends::AmqpConnector};
use courier_common::{internal, logging, tracing};
use courier_delivery::{MailDispatcher, RetryPolicy, SmtpConfig};
use courier_health::{HealthChecker, HealthConfig, HealthServer};
use courier_tracing::traced;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything courier runs, as read from `courier.config.ron`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Courier {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Delivery retry policy applied to each request
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub health: HealthConfig,
}

/// Why the service is stopping.
#[derive(Debug)]
enum Stop {
    Signal(anyhow::Result<()>),
    Consumer(anyhow::Result<()>),
    Terminated,
    Health(anyhow::Result<()>),
}

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

async fn health_outcome(task: &mut Option<JoinHandle<anyhow::Result<()>>>) -> anyhow::Result<()> {
    match task {
        Some(task) => task.await?,
        None => pending().await,
    }
}

impl Courier {
    /// Run the worker until a shutdown signal arrives or something fatal
    /// happens, then drain in-flight deliveries and release the connection.
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration is invalid,
    /// the health server can't bind, the broker can't be reached within the
    /// reconnect budget, or a later reconnection exhausts it.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.validate()?;

        internal!(
            level = INFO,
            broker = %self.broker.endpoint(),
            smtp = %self.smtp.server(),
            queue = %self.broker.topology.queue,
            "Courier running"
        );

        let health = Arc::new(HealthChecker::new());
        let shutdown = CancellationToken::new();

        let health_task = if self.health.enabled {
            let server = HealthServer::new(&self.health, Arc::clone(&health)).await?;
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                server.serve(token).await.map_err(anyhow::Error::from)
            }))
        } else {
            internal!(level = INFO, "Health server disabled");
            None
        };

        let connection = Arc::new(
            ConnectionManager::new(
                Arc::new(AmqpConnector::new(&self.broker)),
                self.broker.reconnect.clone(),
            )
            .with_health_checker(Arc::clone(&health)),
        );
        let dispatcher = Arc::new(MailDispatcher::new(&self.smtp, self.retry.clone())?);
        let consumer = ConsumptionLoop::new(Arc::clone(&connection), dispatcher, &self.broker)
            .with_health_checker(Arc::clone(&health));

        let consuming = consumer.start(&shutdown);
        tokio::pin!(consuming);

        let mut health_task = health_task;
        let stop = tokio::select! {
            r = &mut consuming => Stop::Consumer(r.map_err(anyhow::Error::from)),
            () = connection.terminated() => Stop::Terminated,
            r = health_outcome(&mut health_task) => {
                health_task = None;
                Stop::Health(r)
            }
            r = shutdown_signal() => Stop::Signal(r),
        };

        internal!("Shutting down...");
        shutdown.cancel();

        let ret = match stop {
            Stop::Consumer(r) => r,
            Stop::Signal(r) => {
                let drained = Self::drain(consuming).await;
                r.and(drained)
            }
            Stop::Terminated => {
                if let Err(e) = Self::drain(consuming).await {
                    internal!(level = WARN, error = %e, "Consumer did not stop cleanly: {e}");
                }
                Err(connection.fatal_error().map_or_else(
                    || anyhow::anyhow!("Broker connection terminated"),
                    anyhow::Error::from,
                ))
            }
            Stop::Health(r) => {
                if let Err(e) = Self::drain(consuming).await {
                    internal!(level = WARN, error = %e, "Consumer did not stop cleanly: {e}");
                }
                Err(r
                    .err()
                    .unwrap_or_else(|| anyhow::anyhow!("Health server stopped unexpectedly")))
            }
        };

        connection.dispose().await;

        if let Some(task) = health_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => internal!(level = WARN, error = %e, "Health server failed: {e}"),
                Err(e) => internal!(level = WARN, error = %e, "Health server task failed: {e}"),
            }
        }

        internal!(level = INFO, "Courier stopped");

        ret
    }

    /// Wait for the consumption loop to finish draining, unless CTRL+C is
    /// entered again.
    async fn drain(
        consuming: impl Future<Output = Result<(), courier_broker::BrokerError>>,
    ) -> anyhow::Result<()> {
        tokio::select! {
            r = consuming => r.map_err(anyhow::Error::from),
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown, in-flight deliveries abandoned");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use courier_broker::BrokerError;

    use super::*;

    #[tokio::test]
    async fn test_drain_surfaces_consumer_failure() {
        let error = Courier::drain(async {
            Err(BrokerError::Topology("precondition failed".into()))
        })
        .await
        .expect_err("consumer failed while draining");

        assert!(error.to_string().contains("precondition failed"), "{error}");
    }

    #[tokio::test]
    async fn test_drain_waits_for_consumer() {
        Courier::drain(async {
            tokio::task::yield_now().await;
            Ok(())
        })
        .await
        .expect("clean drain");
    }
}

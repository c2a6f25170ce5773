//! Self-healing broker connection
//!
//! A single [`ConnectionManager`] owns the process's broker connection. The
//! first call to [`ConnectionManager::ensure_connected`] opens it; after that
//! a failure reported by the live connection starts a background reconnect,
//! which either restores the connection or marks the manager as terminated.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use courier_common::{internal, tracing};
use courier_health::HealthChecker;
use courier_tracing::traced;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    BrokerError, ReconnectPolicy,
    r#trait::{BrokerChannel, BrokerConnection, Connector},
};

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Owns the broker connection and keeps it alive.
///
/// Concurrent [`Self::ensure_connected`] calls share one connection attempt;
/// only one (re)connection is ever in flight.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: RwLock<ConnectionState>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    /// Bumped on every new connection so stale failure reports are ignored
    generation: AtomicU64,
    reconnect: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    /// Cancelled by [`Self::dispose`]; stops background reconnection
    lifetime: CancellationToken,
    /// Cancelled once a reconnection exhausted its budget
    fatal: CancellationToken,
    fatal_error: Mutex<Option<BrokerError>>,
    health: Option<Arc<HealthChecker>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            state: RwLock::new(ConnectionState::Disconnected),
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
            reconnect: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            lifetime: CancellationToken::new(),
            fatal: CancellationToken::new(),
            fatal_error: Mutex::new(None),
            health: None,
        }
    }

    /// Mirror connection readiness into `health`.
    #[must_use]
    pub fn with_health_checker(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// True when connected and the connection itself reports open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.live_connection().is_some()
    }

    /// The error that made a background reconnection give up, if one did.
    #[must_use]
    pub fn fatal_error(&self) -> Option<BrokerError> {
        self.fatal_error.lock().clone()
    }

    /// Resolves once a background reconnection has exhausted its budget.
    pub async fn terminated(&self) {
        self.fatal.cancelled().await;
    }

    /// Make sure there is an open connection, opening one if needed.
    ///
    /// Tries up to `max_attempts` times, `interval` apart. A connection that
    /// comes back not open counts as a failed attempt.
    ///
    /// # Errors
    /// [`BrokerError::Disposed`] after [`Self::dispose`],
    /// [`BrokerError::Cancelled`] if `cancel` fires, or
    /// [`BrokerError::ReconnectExhausted`] carrying the last failure. Once a
    /// budget has been exhausted every later call returns that same error.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        self.check_usable()?;
        if self.is_connected() {
            return Ok(());
        }

        let _guard = tokio::select! {
            guard = self.reconnect.lock() => guard,
            () = cancel.cancelled() => return Err(BrokerError::Cancelled),
            () = self.lifetime.cancelled() => return Err(BrokerError::Disposed),
        };

        // Someone else may have connected, or given up, while we waited for the lock
        self.check_usable()?;
        if self.is_connected() {
            return Ok(());
        }

        self.connect(cancel).await
    }

    /// A new channel on the live connection.
    ///
    /// # Errors
    /// [`BrokerError::NotConnected`] immediately if there is no open
    /// connection, otherwise whatever the broker reports.
    pub async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let connection = self.live_connection().ok_or(BrokerError::NotConnected)?;
        connection.create_channel().await
    }

    /// Close and release the connection and stop any reconnection. Only the
    /// first call does anything.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifetime.cancel();

        // Wait out any attempt in flight so it can't install a connection after us
        let _guard = self.reconnect.lock().await;
        let connection = self.connection.write().take();
        self.set_state(ConnectionState::Disconnected);

        if let Some(connection) = connection
            && connection.is_open()
            && let Err(e) = connection.close().await
        {
            internal!(level = WARN, error = %e, "Failed to close broker connection: {e}");
        }

        internal!(level = INFO, "Broker connection disposed");
    }

    fn live_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        if *self.state.read() != ConnectionState::Connected {
            return None;
        }

        self.connection
            .read()
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    fn check_usable(&self) -> Result<(), BrokerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BrokerError::Disposed);
        }
        self.fatal_error().map_or(Ok(()), Err)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if let Some(health) = &self.health {
            health.set_broker_ready(state == ConnectionState::Connected);
        }
    }

    /// Connection attempts, with the reconnect lock held.
    #[traced(instrument(level = tracing::Level::INFO, skip_all, fields(max_attempts = self.policy.max_attempts)), timing(precision = "ms"))]
    async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let stale = self.connection.write().take();
        self.set_state(if stale.is_some() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });
        drop(stale);

        let max_attempts = self.policy.max_attempts.max(1);
        let interval = self.policy.interval();
        let mut attempt = 1;

        let last = loop {
            let error = tokio::select! {
                result = self.connector.connect() => match result {
                    Ok(connection) if connection.is_open() => {
                        self.install(connection);
                        internal!(level = INFO, attempt, "Connected to broker");
                        return Ok(());
                    }
                    Ok(_) => BrokerError::Connection("connection was not open after connecting".to_string()),
                    Err(e) => e,
                },
                () = cancel.cancelled() => return self.abandon(BrokerError::Cancelled),
                () = self.lifetime.cancelled() => return self.abandon(BrokerError::Disposed),
            };

            if attempt >= max_attempts {
                break error;
            }

            internal!(
                level = WARN,
                attempt,
                max_attempts,
                ?interval,
                error = %error,
                "Broker connection attempt {attempt}/{max_attempts} failed, retrying in {interval:?}: {error}"
            );

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel.cancelled() => return self.abandon(BrokerError::Cancelled),
                () = self.lifetime.cancelled() => return self.abandon(BrokerError::Disposed),
            }
            attempt += 1;
        };

        let error = BrokerError::ReconnectExhausted {
            attempts: max_attempts,
            last: Box::new(last),
        };
        internal!(level = ERROR, error = %error, "{error}");
        self.set_state(ConnectionState::Disconnected);
        self.terminate(error.clone());

        Err(error)
    }

    fn abandon(&self, error: BrokerError) -> Result<(), BrokerError> {
        self.set_state(ConnectionState::Disconnected);
        Err(error)
    }

    fn terminate(&self, error: BrokerError) {
        self.fatal_error.lock().get_or_insert(error);
        self.fatal.cancel();
    }

    fn install(self: &Arc<Self>, connection: Box<dyn BrokerConnection>) {
        let connection: Arc<dyn BrokerConnection> = Arc::from(connection);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.connection.write() = Some(Arc::clone(&connection));
        self.set_state(ConnectionState::Connected);

        let manager = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        connection.on_failure(Box::new(move |error| {
            runtime.spawn(Self::recover(Weak::clone(&manager), generation, error));
        }));
    }

    /// Background reconnection after the connection of `generation` failed.
    fn recover(
        manager: Weak<Self>,
        generation: u64,
        error: BrokerError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };

            if manager.disposed.load(Ordering::SeqCst)
                || manager.generation.load(Ordering::SeqCst) != generation
            {
                return;
            }

            internal!(level = WARN, error = %error, "Broker connection lost: {error}");
            if let Some(health) = &manager.health {
                health.set_broker_ready(false);
            }

            let lifetime = manager.lifetime.clone();
            match manager.ensure_connected(&lifetime).await {
                Ok(()) => internal!(level = INFO, "Broker connection restored"),
                Err(BrokerError::Cancelled | BrokerError::Disposed) => {}
                Err(e) => {
                    internal!(level = ERROR, error = %e, "Broker reconnection failed: {e}");
                }
            }
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

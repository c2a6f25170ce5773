//! Connection manager behaviour against the in-memory broker

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use courier_broker::{
    BrokerError, ConnectionManager, ConnectionState, ReconnectPolicy,
    backends::{MemoryBroker, Operation},
};
use courier_health::HealthChecker;
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn manager(broker: &MemoryBroker, policy: ReconnectPolicy) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(broker.connector(), policy))
}

async fn wait_until_connected(manager: &ConnectionManager) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !manager.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnected in time");
}

#[tokio::test(start_paused = true)]
async fn test_connects_on_last_allowed_attempt() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(9);
    let manager = manager(&broker, ReconnectPolicy::default());

    let started = Instant::now();
    manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect("connected");

    assert_eq!(broker.connect_attempts(), 10);
    assert_eq!(started.elapsed(), Duration::from_secs(45));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_budget() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(10);
    let manager = manager(&broker, ReconnectPolicy::default());

    let error = manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect_err("budget exhausted");

    match &error {
        BrokerError::ReconnectExhausted { attempts, last } => {
            assert_eq!(*attempts, 10);
            assert!(matches!(**last, BrokerError::Connection(_)), "{last:?}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(broker.connect_attempts(), 10);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.fatal_error().is_some_and(|e| e.is_exhausted()));

    // Resolves immediately once terminated
    manager.terminated().await;

    let again = manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect_err("still exhausted");
    assert!(again.is_exhausted(), "{again:?}");
    assert_eq!(broker.connect_attempts(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_closed_connection_counts_as_failed_attempt() {
    let broker = MemoryBroker::new();
    broker.hand_out_closed_connections(1);
    let manager = manager(&broker, ReconnectPolicy::default());

    let started = Instant::now();
    manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect("connected");

    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_connection() {
    let broker = MemoryBroker::new();
    broker.delay_connections(Duration::from_secs(1));
    let manager = manager(&broker, ReconnectPolicy::default());
    let cancel = CancellationToken::new();

    let (first, second, third) = tokio::join!(
        manager.ensure_connected(&cancel),
        manager.ensure_connected(&cancel),
        manager.ensure_connected(&cancel),
    );

    assert!(first.is_ok() && second.is_ok() && third.is_ok());
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_in_background_after_failure() {
    let broker = MemoryBroker::new();
    let health = Arc::new(HealthChecker::new());
    let manager = Arc::new(
        ConnectionManager::new(broker.connector(), ReconnectPolicy::default())
            .with_health_checker(Arc::clone(&health)),
    );

    manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect("connected");
    assert!(health.get_status().broker_ready);

    broker.refuse_connections(2);
    broker.fail_connections();
    wait_until_connected(&manager).await;

    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(health.get_status().broker_ready);
    assert!(manager.fatal_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_background_reconnect_terminates() {
    let broker = MemoryBroker::new();
    let manager = manager(
        &broker,
        ReconnectPolicy {
            max_attempts: 3,
            interval_secs: 1,
        },
    );

    manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect("connected");

    broker.refuse_connections(3);
    broker.fail_connections();

    tokio::time::timeout(Duration::from_secs(60), manager.terminated())
        .await
        .expect("terminated in time");

    assert_eq!(broker.connect_attempts(), 4);
    assert!(manager.fatal_error().is_some_and(|e| e.is_exhausted()));
    assert!(!manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_connecting() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(10);
    let manager = manager(&broker, ReconnectPolicy::default());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        canceller.cancel();
    });

    let error = manager
        .ensure_connected(&cancel)
        .await
        .expect_err("cancelled");

    assert!(error.is_cancelled(), "{error:?}");
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.fatal_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_interrupts_connecting() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(10);
    let manager = manager(&broker, ReconnectPolicy::default());

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.ensure_connected(&CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    manager.dispose().await;

    let result = connecting.await.expect("task completed");
    assert!(matches!(result, Err(BrokerError::Disposed)), "{result:?}");
    assert!(manager.fatal_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_is_idempotent() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker, ReconnectPolicy::default());

    manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect("connected");

    manager.dispose().await;
    manager.dispose().await;

    assert_eq!(broker.operations(), vec![Operation::CloseConnection]);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let error = manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect_err("disposed");
    assert!(matches!(error, BrokerError::Disposed), "{error:?}");
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_channel_requires_connection() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker, ReconnectPolicy::default());

    let before = manager.create_channel().await;
    assert!(matches!(before, Err(BrokerError::NotConnected)));

    manager
        .ensure_connected(&CancellationToken::new())
        .await
        .expect("connected");
    let channel = manager.create_channel().await.expect("channel");
    assert!(channel.is_open());

    manager.dispose().await;
    let after = manager.create_channel().await;
    assert!(matches!(after, Err(BrokerError::NotConnected)));
}

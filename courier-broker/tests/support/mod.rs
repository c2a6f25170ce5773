//! Scripted [`Dispatch`] for consumption tests
#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_broker::{BrokerConfig, ReconnectPolicy};
use courier_common::Cancelled;
use courier_delivery::{Dispatch, DispatchError, EmailRequest, TransientError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// What a single `send` should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Deliver,
    Fail,
    Panic,
    /// Succeed after the given time
    Slow(Duration),
    /// Never finish on its own; only cancellation ends it
    Hang,
}

/// Dispatcher that plays back one [`Outcome`] per call and records every
/// request it was given. Once the script runs out every send succeeds.
#[derive(Default)]
pub struct FakeDispatcher {
    script: Mutex<VecDeque<Outcome>>,
    requests: Mutex<Vec<EmailRequest>>,
    cancelled: Mutex<u32>,
    in_flight: Mutex<InFlight>,
}

#[derive(Default)]
struct InFlight {
    current: usize,
    peak: usize,
}

/// Counts a send as in flight until dropped.
struct InFlightGuard<'a>(&'a Mutex<InFlight>);

impl<'a> InFlightGuard<'a> {
    fn enter(in_flight: &'a Mutex<InFlight>) -> Self {
        let mut guard = in_flight.lock();
        guard.current += 1;
        guard.peak = guard.peak.max(guard.current);
        drop(guard);
        Self(in_flight)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().current -= 1;
    }
}

impl FakeDispatcher {
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn requests(&self) -> Vec<EmailRequest> {
        self.requests.lock().clone()
    }

    /// Most sends that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.lock().peak
    }

    /// Sends that ended because their cancellation token fired.
    pub fn cancelled(&self) -> u32 {
        *self.cancelled.lock()
    }
}

#[async_trait]
impl Dispatch for FakeDispatcher {
    async fn send(
        &self,
        request: &EmailRequest,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let _in_flight = InFlightGuard::enter(&self.in_flight);
        self.requests.lock().push(request.clone());
        let outcome = self.script.lock().pop_front().unwrap_or(Outcome::Deliver);

        match outcome {
            Outcome::Deliver => Ok(()),
            Outcome::Fail => Err(TransientError::TransmissionFailed(
                "550 mailbox unavailable".to_string(),
            )
            .into()),
            Outcome::Panic => panic!("dispatcher exploded"),
            Outcome::Slow(duration) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => Ok(()),
                    () = cancel.cancelled() => {
                        *self.cancelled.lock() += 1;
                        Err(Cancelled.into())
                    }
                }
            }
            Outcome::Hang => {
                cancel.cancelled().await;
                *self.cancelled.lock() += 1;
                Err(Cancelled.into())
            }
        }
    }
}

/// JSON body for a valid request to `to`.
pub fn payload(to: &str) -> Vec<u8> {
    format!(r#"{{"To":"{to}","Subject":"Welcome","Body":"<h1>Hello</h1>"}}"#).into_bytes()
}

/// Broker settings with short, test-friendly timings.
pub fn config() -> BrokerConfig {
    BrokerConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            interval_secs: 1,
        },
        drain_timeout_secs: 5,
        resubscribe_delay_secs: 1,
        ..BrokerConfig::default()
    }
}

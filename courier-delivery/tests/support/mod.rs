//! Scripted [`MailTransport`] for dispatcher tests
#![allow(dead_code)]

pub mod mock_server;

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use courier_delivery::{MailSession, MailTransport, Message, TransientError};
use lettre::transport::smtp::authentication::Credentials;
use parking_lot::Mutex;

/// What a single attempt should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    RefuseConnection,
    RejectCredentials,
    RejectMessage,
    Accept,
}

/// What the dispatcher did to the transport, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Authenticate,
    Transmit(Vec<String>),
    Close { graceful: bool },
}

/// Transport that plays back one [`Step`] per opened session and records
/// every call. Once the script runs out every attempt is accepted.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    events: Arc<Mutex<Vec<Event>>>,
    attempts: Mutex<u32>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn opens(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == Event::Open)
            .count()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    fn server(&self) -> &str {
        "scripted:25"
    }

    async fn open(&self) -> Result<Box<dyn MailSession>, TransientError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            *attempts
        };
        let step = self.script.lock().pop_front().unwrap_or(Step::Accept);
        self.events.lock().push(Event::Open);

        if step == Step::RefuseConnection {
            return Err(TransientError::ConnectionFailed {
                server: self.server().to_string(),
                reason: format!("refused on attempt {attempt}"),
            });
        }

        Ok(Box::new(ScriptedSession {
            step,
            attempt,
            events: Arc::clone(&self.events),
        }))
    }
}

struct ScriptedSession {
    step: Step,
    attempt: u32,
    events: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl MailSession for ScriptedSession {
    async fn authenticate(&mut self, _credentials: &Credentials) -> Result<(), TransientError> {
        self.events.lock().push(Event::Authenticate);
        if self.step == Step::RejectCredentials {
            return Err(TransientError::AuthenticationFailed(format!(
                "535 rejected on attempt {}",
                self.attempt
            )));
        }
        Ok(())
    }

    async fn transmit(&mut self, message: &Message) -> Result<(), TransientError> {
        let recipients = message
            .envelope()
            .to()
            .iter()
            .map(ToString::to_string)
            .collect();
        self.events.lock().push(Event::Transmit(recipients));

        if self.step == Step::RejectMessage {
            return Err(TransientError::TransmissionFailed(format!(
                "451 rejected on attempt {}",
                self.attempt
            )));
        }
        Ok(())
    }

    async fn close(self: Box<Self>, graceful: bool) {
        self.events.lock().push(Event::Close { graceful });
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{outgoing, tracing};
use courier_tracing::traced;
use lettre::{
    Address, Message,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SmtpConfig,
    error::{DispatchError, SmtpConfigError, StructuralError, TransientError},
    policy::RetryPolicy,
    request::EmailRequest,
    transport::{MailSession, MailTransport, SmtpTransport},
};

/// Sends one decoded request; implemented by [`MailDispatcher`] and by test doubles.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// # Errors
    /// Structural failures immediately, the last transient failure once the
    /// retry budget is spent, or `Cancelled` if `cancel` fires while waiting
    /// between attempts.
    async fn send(
        &self,
        request: &EmailRequest,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError>;
}

/// Builds an HTML message per request and relays it over SMTP, one session
/// per attempt, under a [`RetryPolicy`].
pub struct MailDispatcher {
    sender: Mailbox,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    transport: Arc<dyn MailTransport>,
}

impl MailDispatcher {
    /// Dispatcher over the lettre-backed [`SmtpTransport`].
    ///
    /// # Errors
    /// If the configured from address isn't valid.
    pub fn new(config: &SmtpConfig, retry: RetryPolicy) -> Result<Self, SmtpConfigError> {
        Self::with_transport(config, retry, Arc::new(SmtpTransport::new(config)))
    }

    /// # Errors
    /// If the configured from address isn't valid.
    pub fn with_transport(
        config: &SmtpConfig,
        retry: RetryPolicy,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self, SmtpConfigError> {
        Ok(Self {
            sender: config.sender()?,
            credentials: config.credentials(),
            retry,
            transport,
        })
    }

    /// Turn a request into a `text/html` message from the configured sender.
    ///
    /// # Errors
    /// [`StructuralError`] if the recipient isn't an address or the builder
    /// rejects the message.
    pub fn build_message(&self, request: &EmailRequest) -> Result<Message, StructuralError> {
        let to: Address =
            request
                .to()
                .parse()
                .map_err(|e: lettre::address::AddressError| StructuralError::InvalidRecipient {
                    address: request.to().to_string(),
                    reason: e.to_string(),
                })?;

        Message::builder()
            .from(self.sender.clone())
            .to(Mailbox::new(None, to))
            .subject(request.subject())
            .header(ContentType::TEXT_HTML)
            .body(request.body().to_string())
            .map_err(|e| StructuralError::Build(e.to_string()))
    }

    #[traced(instrument(level = tracing::Level::INFO, skip_all, fields(to = %request.to(), server = %self.transport.server())), timing(precision = "ms"))]
    async fn deliver(
        &self,
        request: &EmailRequest,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let message = match self.build_message(request) {
            Ok(message) => message,
            Err(e) => {
                outgoing!(level = ERROR, to = %request.to(), error = %e, "Not sending, message could not be built: {e}");
                return Err(e.into());
            }
        };

        let result = self
            .retry
            .execute(cancel, |attempt| self.attempt(&message, attempt))
            .await;

        match &result {
            Ok(()) => {
                outgoing!(level = INFO, to = %request.to(), "Message to {} accepted by relay", request.to());
            }
            Err(e) => {
                outgoing!(level = ERROR, to = %request.to(), error = %e, "Giving up on message to {}: {e}", request.to());
            }
        }

        result
    }

    /// One full session: connect, authenticate when configured, transmit, close.
    async fn attempt(&self, message: &Message, attempt: u32) -> Result<(), DispatchError> {
        let server = self.transport.server();

        let mut session = match self.transport.open().await {
            Ok(session) => session,
            Err(e) => {
                outgoing!(level = WARN, attempt, server, error = %e, "Connect failed: {e}");
                return Err(e.into());
            }
        };
        outgoing!(level = DEBUG, attempt, server, "Connected to {server}");

        let result = self.converse(session.as_mut(), message, attempt).await;
        session.close(result.is_ok()).await;

        result.map_err(DispatchError::from)
    }

    async fn converse(
        &self,
        session: &mut dyn MailSession,
        message: &Message,
        attempt: u32,
    ) -> Result<(), TransientError> {
        if let Some(credentials) = &self.credentials {
            if let Err(e) = session.authenticate(credentials).await {
                outgoing!(level = WARN, attempt, error = %e, "Authentication failed: {e}");
                return Err(e);
            }
            outgoing!(level = DEBUG, attempt, "Authenticated");
        }

        if let Err(e) = session.transmit(message).await {
            outgoing!(level = WARN, attempt, error = %e, "Send failed: {e}");
            return Err(e);
        }
        outgoing!(level = DEBUG, attempt, "Message transmitted");

        Ok(())
    }
}

#[async_trait]
impl Dispatch for MailDispatcher {
    async fn send(
        &self,
        request: &EmailRequest,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        self.deliver(request, cancel).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dispatcher() -> MailDispatcher {
        let config = SmtpConfig {
            host: "mail.example.com".to_string(),
            from_address: "noreply@example.com".to_string(),
            from_name: "Example".to_string(),
            ..SmtpConfig::default()
        };
        MailDispatcher::new(&config, RetryPolicy::default()).expect("valid config")
    }

    #[test]
    fn test_build_message_headers() {
        let message = dispatcher()
            .build_message(&EmailRequest::new("a@b.com", "Hello", "<p>hi</p>"))
            .expect("valid request");

        let formatted = String::from_utf8(message.formatted()).expect("utf-8 message");
        assert!(formatted.contains("From: Example <noreply@example.com>"));
        assert!(formatted.contains("To: a@b.com"));
        assert!(formatted.contains("Subject: Hello"));
        assert!(formatted.contains("Content-Type: text/html; charset=utf-8"));
        assert!(formatted.contains("<p>hi</p>"));

        let recipients: Vec<String> = message
            .envelope()
            .to()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(recipients, vec!["a@b.com".to_string()]);
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let dispatcher = dispatcher();

        for to in ["", "   ", "not-an-address", "a@", " a@b.com", "a@b.com "] {
            let error = dispatcher
                .build_message(&EmailRequest::new(to, "S", "B"))
                .expect_err("invalid recipient");
            assert!(
                matches!(error, StructuralError::InvalidRecipient { .. }),
                "{to:?} gave {error:?}"
            );
        }
    }

    #[test]
    fn test_new_rejects_bad_sender() {
        let config = SmtpConfig {
            host: "mail.example.com".to_string(),
            from_address: "nope".to_string(),
            ..SmtpConfig::default()
        };
        assert!(matches!(
            MailDispatcher::new(&config, RetryPolicy::default()),
            Err(SmtpConfigError::InvalidFromAddress { .. })
        ));
    }
}

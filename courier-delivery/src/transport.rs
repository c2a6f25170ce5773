//! SMTP session seam
//!
//! A [`MailTransport`] opens one [`MailSession`] per dispatch attempt. Sessions
//! are never pooled or reused: each is closed (gracefully or not) before the
//! attempt ends, and dropping one releases the underlying connection.

use std::time::Duration;

use async_trait::async_trait;
use courier_common::tracing;
use courier_tracing::traced;
use lettre::{
    Message,
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
    },
};

use crate::{
    config::{SmtpConfig, TlsMode},
    error::TransientError,
};

/// Opens sessions to the configured relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// `host:port` of the relay, for logs and errors.
    fn server(&self) -> &str;

    /// Connect, greet and secure a new session.
    ///
    /// # Errors
    /// [`TransientError::ConnectionFailed`] if any part of session setup fails.
    async fn open(&self) -> Result<Box<dyn MailSession>, TransientError>;
}

/// One open SMTP session.
#[async_trait]
pub trait MailSession: Send {
    /// # Errors
    /// [`TransientError::AuthenticationFailed`] if the relay refuses the credentials.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), TransientError>;

    /// # Errors
    /// [`TransientError::TransmissionFailed`] if the relay doesn't accept the message.
    async fn transmit(&mut self, message: &Message) -> Result<(), TransientError>;

    /// End the session: QUIT when `graceful`, otherwise drop the connection.
    async fn close(self: Box<Self>, graceful: bool);
}

/// [`MailTransport`] backed by lettre's async SMTP client.
pub struct SmtpTransport {
    host: String,
    port: u16,
    server: String,
    tls: TlsMode,
    timeout: Duration,
    hello: ClientId,
}

impl SmtpTransport {
    #[must_use]
    pub fn new(config: &SmtpConfig) -> Self {
        let hello = config
            .hello_name
            .as_ref()
            .map_or_else(ClientId::default, |name| ClientId::Domain(name.clone()));

        if config.tls == TlsMode::None {
            tracing::warn!(
                server = %config.server(),
                "SECURITY WARNING: SMTP sessions are not encrypted, credentials and content are sent in plaintext"
            );
        }

        Self {
            host: config.host.clone(),
            port: config.port,
            server: config.server(),
            tls: config.tls,
            timeout: config.timeout(),
            hello,
        }
    }

    fn connection_failed(&self, reason: impl ToString) -> TransientError {
        TransientError::ConnectionFailed {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    fn tls_parameters(&self) -> Result<TlsParameters, TransientError> {
        TlsParameters::new(self.host.clone()).map_err(|e| self.connection_failed(e))
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(server = %self.server, tls = ?self.tls)), timing(precision = "ms"))]
    async fn connect(&self) -> Result<AsyncSmtpConnection, TransientError> {
        let wrapper = match self.tls {
            TlsMode::Wrapper => Some(self.tls_parameters()?),
            TlsMode::Opportunistic | TlsMode::StartTls | TlsMode::None => None,
        };

        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.host.as_str(), self.port),
            Some(self.timeout),
            &self.hello,
            wrapper,
            None,
        )
        .await
        .map_err(|e| self.connection_failed(e))?;

        let upgrade = match self.tls {
            TlsMode::StartTls => true,
            TlsMode::Opportunistic => connection.can_starttls(),
            TlsMode::Wrapper | TlsMode::None => false,
        };

        if self.tls == TlsMode::Opportunistic && !upgrade {
            tracing::debug!(server = %self.server, "Relay does not offer STARTTLS, continuing in plaintext");
        }

        if upgrade {
            let parameters = self.tls_parameters()?;
            if let Err(e) = connection.starttls(parameters, &self.hello).await {
                connection.abort().await;
                return Err(self.connection_failed(format!("STARTTLS failed: {e}")));
            }
        }

        Ok(connection)
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn server(&self) -> &str {
        &self.server
    }

    async fn open(&self) -> Result<Box<dyn MailSession>, TransientError> {
        let connection = self.connect().await?;
        Ok(Box::new(SmtpSession { connection }))
    }
}

struct SmtpSession {
    connection: AsyncSmtpConnection,
}

#[async_trait]
impl MailSession for SmtpSession {
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), TransientError> {
        self.connection
            .auth(&[Mechanism::Plain, Mechanism::Login], credentials)
            .await
            .map(|_| ())
            .map_err(|e| TransientError::AuthenticationFailed(e.to_string()))
    }

    async fn transmit(&mut self, message: &Message) -> Result<(), TransientError> {
        self.connection
            .send(message.envelope(), &message.formatted())
            .await
            .map(|_| ())
            .map_err(|e| TransientError::TransmissionFailed(e.to_string()))
    }

    async fn close(mut self: Box<Self>, graceful: bool) {
        if graceful {
            // The message is already accepted; a failed QUIT changes nothing
            if let Err(e) = self.connection.quit().await {
                tracing::debug!("QUIT after successful send failed: {e}");
            }
        } else {
            self.connection.abort().await;
        }
    }
}

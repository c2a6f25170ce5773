//! Typed error handling for dispatch operations.
//!
//! Errors are split by what the caller should do with them:
//! - Structural failures (the message cannot be built) - never retried
//! - Transient failures (connect, authenticate, transmit) - retried with backoff
//! - Cancellation - the retry wait was interrupted by shutdown

use courier_common::Cancelled;
use thiserror::Error;

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request could not be turned into a message; retrying cannot help.
    #[error("Structural failure: {0}")]
    Structural(#[from] StructuralError),

    /// A step of the SMTP conversation failed; may succeed on a later attempt.
    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    /// Cancelled while waiting between attempts.
    #[error("Dispatch cancelled: {0}")]
    Cancelled(#[from] Cancelled),
}

/// Failures building the outbound message.
#[derive(Debug, Error)]
pub enum StructuralError {
    /// Recipient is empty or not a valid mailbox address.
    #[error("Invalid recipient {address:?}: {reason}")]
    InvalidRecipient { address: String, reason: String },

    /// The message builder rejected the request.
    #[error("Message could not be built: {0}")]
    Build(String),
}

/// Failures during an SMTP session.
#[derive(Debug, Error)]
pub enum TransientError {
    /// Could not open a session (TCP connect, greeting, EHLO or TLS).
    #[error("Connection to {server} failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// The server refused the configured credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server did not accept the message.
    #[error("Transmission failed: {0}")]
    TransmissionFailed(String),
}

/// Invalid SMTP configuration, detected at startup.
#[derive(Debug, Error)]
pub enum SmtpConfigError {
    /// No relay host configured.
    #[error("SMTP host is not configured")]
    MissingHost,

    /// Port 0 can't be connected to.
    #[error("SMTP port must be non-zero")]
    InvalidPort,

    /// The from-address doesn't parse as a mailbox address.
    #[error("Invalid from address {address:?}: {reason}")]
    InvalidFromAddress { address: String, reason: String },
}

/// Failures decoding a queue payload into an [`EmailRequest`](crate::EmailRequest).
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not a valid email request: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl DispatchError {
    /// Returns `true` if the failure came from building the message.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }

    /// Returns `true` if the failure came from the SMTP session.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if the dispatch was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

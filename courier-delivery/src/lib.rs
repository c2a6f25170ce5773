//! Outbound mail dispatch for courier
//!
//! This crate provides:
//! - The [`EmailRequest`] decoded from a queue delivery
//! - A generic bounded exponential-backoff [`RetryPolicy`]
//! - The [`MailDispatcher`], which builds a message and sends it over SMTP
//!   with each attempt running in its own session
//! - The [`MailTransport`] seam over the SMTP client, with the lettre-backed
//!   [`SmtpTransport`] used in production

mod config;
mod dispatcher;
mod error;
pub mod policy;
mod request;
mod transport;

pub use config::{SmtpConfig, TlsMode};
pub use dispatcher::{Dispatch, MailDispatcher};
pub use error::{DispatchError, PayloadError, SmtpConfigError, StructuralError, TransientError};
pub use policy::RetryPolicy;
pub use request::EmailRequest;
pub use transport::{MailSession, MailTransport, SmtpTransport};

pub use lettre::Message;

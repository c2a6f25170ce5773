//! SMTP relay configuration

use std::{fmt, time::Duration};

use lettre::{Address, message::Mailbox, transport::smtp::authentication::Credentials};
use serde::{Deserialize, Serialize};

use crate::error::SmtpConfigError;

/// How the session to the relay is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Plaintext for the whole session.
    None,
    /// Upgrade with STARTTLS when the relay offers it, otherwise stay plaintext.
    #[default]
    Opportunistic,
    /// Plaintext connect, then a mandatory STARTTLS upgrade before authenticating.
    StartTls,
    /// TLS from the first byte (SMTPS, usually port 465).
    Wrapper,
}

/// Static SMTP settings shared by every dispatch attempt.
#[derive(Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay host name or address
    #[serde(default)]
    pub host: String,

    /// Relay port
    ///
    /// Default: 25
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Username for AUTH; blank means the relay is used anonymously
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Sender address on every outbound message
    #[serde(default)]
    pub from_address: String,

    /// Display name paired with `from_address`
    #[serde(default)]
    pub from_name: String,

    /// Default: [`TlsMode::Opportunistic`]
    #[serde(default)]
    pub tls: TlsMode,

    /// Per-command timeout for the SMTP conversation (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// Name sent in EHLO; the local host name when unset
    #[serde(default)]
    pub hello_name: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: defaults::port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            from_name: String::new(),
            tls: TlsMode::default(),
            timeout_secs: defaults::timeout_secs(),
            hello_name: None,
        }
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "<redacted>" },
            )
            .field("from_address", &self.from_address)
            .field("from_name", &self.from_name)
            .field("tls", &self.tls)
            .field("timeout_secs", &self.timeout_secs)
            .field("hello_name", &self.hello_name)
            .finish()
    }
}

impl SmtpConfig {
    /// Check the settings before anything connects.
    ///
    /// # Errors
    /// If the host is blank, the port is zero, or the from address doesn't
    /// parse.
    pub fn validate(&self) -> Result<(), SmtpConfigError> {
        if self.host.trim().is_empty() {
            return Err(SmtpConfigError::MissingHost);
        }

        if self.port == 0 {
            return Err(SmtpConfigError::InvalidPort);
        }

        self.sender().map(|_| ())
    }

    /// `host:port`, as used in logs and errors.
    #[must_use]
    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Credentials for AUTH, or `None` when the username is blank.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        if self.username.trim().is_empty() {
            None
        } else {
            Some(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ))
        }
    }

    /// The `From` mailbox built from `from_name` and `from_address`.
    ///
    /// # Errors
    /// If `from_address` isn't a valid address.
    pub fn sender(&self) -> Result<Mailbox, SmtpConfigError> {
        let address: Address =
            self.from_address
                .trim()
                .parse()
                .map_err(|e: lettre::address::AddressError| SmtpConfigError::InvalidFromAddress {
                    address: self.from_address.clone(),
                    reason: e.to_string(),
                })?;

        let name = self.from_name.trim();
        Ok(Mailbox::new(
            (!name.is_empty()).then(|| name.to_string()),
            address,
        ))
    }
}

mod defaults {
    pub const fn port() -> u16 {
        25
    }

    pub const fn timeout_secs() -> u64 {
        30
    }
}

//! Broker connection and topology configuration

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Where and how to connect to the AMQP broker.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Default: `rabbitmq`
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Default: 5672
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Default: `guest`
    #[serde(default = "defaults::credential")]
    pub username: String,

    /// Default: `guest`
    #[serde(default = "defaults::credential")]
    pub password: String,

    /// Default: `/`
    #[serde(default = "defaults::virtual_host")]
    pub virtual_host: String,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub topology: Topology,

    /// How long shutdown waits for in-flight deliveries before cancelling
    /// their retries (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Pause between failed attempts to resubscribe after a channel or
    /// connection loss (in seconds)
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::resubscribe_delay_secs")]
    pub resubscribe_delay_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            username: defaults::credential(),
            password: defaults::credential(),
            virtual_host: defaults::virtual_host(),
            reconnect: ReconnectPolicy::default(),
            topology: Topology::default(),
            drain_timeout_secs: defaults::drain_timeout_secs(),
            resubscribe_delay_secs: defaults::resubscribe_delay_secs(),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("reconnect", &self.reconnect)
            .field("topology", &self.topology)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .field("resubscribe_delay_secs", &self.resubscribe_delay_secs)
            .finish()
    }
}

impl BrokerConfig {
    /// `host:port/vhost`, without credentials, for logs.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.virtual_host)
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    #[must_use]
    pub const fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_delay_secs)
    }
}

/// Fixed-interval retry budget for (re)connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Default: 10 attempts
    #[serde(default = "defaults::reconnect_attempts")]
    pub max_attempts: u32,

    /// Wait between attempts (in seconds)
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::reconnect_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::reconnect_attempts(),
            interval_secs: defaults::reconnect_interval_secs(),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Exchange, queue and subscription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Durable direct exchange requests are published to
    #[serde(default = "defaults::exchange")]
    pub exchange: String,

    #[serde(default = "defaults::queue")]
    pub queue: String,

    #[serde(default = "defaults::routing_key")]
    pub routing_key: String,

    /// Appended to the exchange name (after a `.`) to name the queue's
    /// dead-letter exchange
    #[serde(default = "defaults::dead_letter_suffix")]
    pub dead_letter_suffix: String,

    /// Maximum unacknowledged deliveries, and so concurrent handlers
    #[serde(default = "defaults::prefetch")]
    pub prefetch: u16,

    #[serde(default = "defaults::consumer_tag")]
    pub consumer_tag: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: defaults::exchange(),
            queue: defaults::queue(),
            routing_key: defaults::routing_key(),
            dead_letter_suffix: defaults::dead_letter_suffix(),
            prefetch: defaults::prefetch(),
            consumer_tag: defaults::consumer_tag(),
        }
    }
}

impl Topology {
    #[must_use]
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.{}", self.exchange, self.dead_letter_suffix)
    }
}

mod defaults {
    pub fn host() -> String {
        "rabbitmq".to_string()
    }

    pub const fn port() -> u16 {
        5672
    }

    pub fn credential() -> String {
        "guest".to_string()
    }

    pub fn virtual_host() -> String {
        "/".to_string()
    }

    pub const fn drain_timeout_secs() -> u64 {
        30
    }

    pub const fn resubscribe_delay_secs() -> u64 {
        5
    }

    pub const fn reconnect_attempts() -> u32 {
        10
    }

    pub const fn reconnect_interval_secs() -> u64 {
        5
    }

    pub fn exchange() -> String {
        "sub-email-sender-exchange".to_string()
    }

    pub fn queue() -> String {
        "sub-email-sender".to_string()
    }

    pub fn routing_key() -> String {
        "sub-email".to_string()
    }

    pub fn dead_letter_suffix() -> String {
        "dlx".to_string()
    }

    pub const fn prefetch() -> u16 {
        10
    }

    pub fn consumer_tag() -> String {
        "courier".to_string()
    }
}

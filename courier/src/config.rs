//! Loading the courier configuration
//!
//! The configuration is a single RON file holding a [`Courier`]. Secrets and
//! deployment-specific values can be supplied through the environment, which
//! takes precedence over the file. Everything is validated before anything
//! connects.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use courier_delivery::SmtpConfigError;
use ron::extensions::Extensions;
use thiserror::Error;

use crate::controller::Courier;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Searched in order when [`CONFIG_ENV`] isn't set.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = [
    "./courier.config.ron",
    "/etc/courier/courier.config.ron",
];

/// Configuration that can't be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("COURIER_CONFIG points to non-existent file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("No configuration file found. Tried:\n  - COURIER_CONFIG environment variable\n{}", list(.0))]
    NotFound(Vec<PathBuf>),

    #[error("Failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config from {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("Invalid value {value:?} for {variable}: {reason}")]
    InvalidOverride {
        variable: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid SMTP configuration: {0}")]
    Smtp(#[from] SmtpConfigError),

    #[error("Broker topology {0} must not be empty")]
    EmptyTopology(&'static str),

    #[error("Broker prefetch must be greater than zero")]
    ZeroPrefetch,

    #[error("Retry policy needs at least one attempt")]
    ZeroRetryAttempts,

    #[error("Broker reconnect policy needs at least one attempt")]
    ZeroReconnectAttempts,
}

fn list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| format!("  - {}", path.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Locate, read, override and validate the configuration.
///
/// # Errors
/// If no file is found, it can't be read or parsed, an environment override
/// is malformed, or the result fails [`Courier::validate`].
pub fn load() -> Result<Courier, ConfigError> {
    let path = find_config_file(
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &DEFAULT_CONFIG_PATHS.map(PathBuf::from),
    )?;

    let mut courier = read_config_file(&path)?;
    courier.apply_overrides(|variable| std::env::var(variable).ok())?;
    courier.validate()?;

    Ok(courier)
}

/// Find the configuration file using the following precedence:
/// 1. `explicit` (the value of [`CONFIG_ENV`]), which must exist when given
/// 2. The first of `defaults` that exists
///
/// # Errors
/// If `explicit` doesn't exist, or none of `defaults` do.
pub fn find_config_file(
    explicit: Option<PathBuf>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path)
        } else {
            Err(ConfigError::MissingFile(path))
        };
    }

    defaults
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or_else(|| ConfigError::NotFound(defaults.to_vec()))
}

/// Read and parse `path` without applying overrides or validating.
///
/// # Errors
/// If the file can't be read or isn't a valid [`Courier`].
pub fn read_config_file(path: &Path) -> Result<Courier, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a RON document. `Option` fields may be written without `Some(..)`.
///
/// # Errors
/// If the document isn't a valid [`Courier`].
pub fn parse(content: &str) -> Result<Courier, ron::error::SpannedError> {
    ron::Options::default()
        .with_default_extension(Extensions::IMPLICIT_SOME)
        .from_str(content)
}

impl Courier {
    /// Replace file values with those found through `lookup`.
    ///
    /// Recognised variables: `COURIER_SMTP_HOST`, `COURIER_SMTP_PORT`,
    /// `COURIER_SMTP_USERNAME`, `COURIER_SMTP_PASSWORD`,
    /// `COURIER_SMTP_FROM_ADDRESS`, `COURIER_SMTP_FROM_NAME`,
    /// `COURIER_BROKER_USERNAME` and `COURIER_BROKER_PASSWORD`.
    ///
    /// # Errors
    /// If `COURIER_SMTP_PORT` isn't a port number.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let strings = [
            ("COURIER_SMTP_HOST", &mut self.smtp.host),
            ("COURIER_SMTP_USERNAME", &mut self.smtp.username),
            ("COURIER_SMTP_PASSWORD", &mut self.smtp.password),
            ("COURIER_SMTP_FROM_ADDRESS", &mut self.smtp.from_address),
            ("COURIER_SMTP_FROM_NAME", &mut self.smtp.from_name),
            ("COURIER_BROKER_USERNAME", &mut self.broker.username),
            ("COURIER_BROKER_PASSWORD", &mut self.broker.password),
        ];

        for (variable, field) in strings {
            if let Some(value) = lookup(variable) {
                *field = value;
            }
        }

        if let Some(port) = parsed(&lookup, "COURIER_SMTP_PORT")? {
            self.smtp.port = port;
        }

        Ok(())
    }

    /// Check the configuration before anything connects.
    ///
    /// # Errors
    /// On the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.smtp.validate()?;

        let topology = &self.broker.topology;
        for (name, value) in [
            ("exchange", &topology.exchange),
            ("queue", &topology.queue),
            ("routing key", &topology.routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyTopology(name));
            }
        }

        if topology.prefetch == 0 {
            return Err(ConfigError::ZeroPrefetch);
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }

        if self.broker.reconnect.max_attempts == 0 {
            return Err(ConfigError::ZeroReconnectAttempts);
        }

        Ok(())
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(variable)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidOverride {
                    variable,
                    reason: e.to_string(),
                    value,
                })
        })
        .transpose()
}

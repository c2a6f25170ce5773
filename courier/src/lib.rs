pub mod config;
pub mod controller;

pub use config::ConfigError;
pub use controller::Courier;

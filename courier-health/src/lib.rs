//! Health check endpoints for courier
//!
//! Serves HTTP probes so an orchestrator can tell whether the worker is
//! running and whether it is currently consuming.
//!
//! # Endpoints
//!
//! - **`/health/live`** - Liveness probe: 200 while the process can respond
//! - **`/health/ready`** - Readiness probe: 200 once the broker connection is
//!   open and the consumer is subscribed, 503 with a JSON status otherwise
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_health::{HealthChecker, HealthConfig, HealthServer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let checker = Arc::new(HealthChecker::new());
//! let server = HealthServer::new(&HealthConfig::default(), Arc::clone(&checker)).await?;
//!
//! let shutdown = CancellationToken::new();
//! server.serve(shutdown).await?;
//! # Ok(())
//! # }
//! ```

mod checker;
mod config;
mod error;
mod server;

pub use checker::{HealthChecker, HealthStatus};
pub use config::HealthConfig;
pub use error::HealthError;
pub use server::HealthServer;

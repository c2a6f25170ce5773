pub mod error;
pub mod logging;

pub use courier_tracing::traced;
pub use error::Cancelled;
pub use tracing;

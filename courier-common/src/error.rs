//! Error types shared by every courier crate.

use thiserror::Error;

/// Returned when a wait was interrupted by a cancellation request.
///
/// Crate error types wrap this with `#[from]` so that cancellable helpers
/// such as the retry policy can hand it back as the caller's own error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_cancelled_display() {
        assert_eq!(Cancelled.to_string(), "Operation cancelled");
    }
}

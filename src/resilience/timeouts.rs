//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound guarded upstream calls by a per-route deadline
//! - Cancel the call cleanly on expiry (the future is dropped)
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities, so paused-clock tests drive it
//! - Timeout errors are distinct from upstream errors

use std::future::Future;
use std::time::Duration;

/// The deadline passed before the wrapped future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {}ms exceeded", .deadline.as_millis())]
pub struct DeadlineExceeded {
    deadline: Duration,
}

impl DeadlineExceeded {
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Await `fut` for at most `deadline`.
pub async fn with_deadline<F: Future>(deadline: Duration, fut: F) -> Result<F::Output, DeadlineExceeded> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| DeadlineExceeded { deadline })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_deadline() {
        let out = with_deadline(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_millis(999)).await;
            5
        })
        .await;
        assert_eq!(out, Ok(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires() {
        let err = with_deadline(Duration::from_secs(1), tokio::time::sleep(Duration::from_secs(3)))
            .await
            .unwrap_err();
        assert_eq!(err.deadline(), Duration::from_secs(1));
        assert_eq!(err.to_string(), "deadline of 1000ms exceeded");
    }
}

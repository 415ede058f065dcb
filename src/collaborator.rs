//! Shared error type and pacing hook for external collaborators.

use crate::usage::BudgetExceeded;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

/// Failure of a single call to an external system.
///
/// These are item scoped: the batch processor logs and counts them and moves on, with the
/// exception of [`CollaboratorError::BudgetExceeded`], which aborts the stage.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Collaborator could not be reached.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
    /// Collaborator answered with an error.
    #[error("Collaborator call failed: {0}")]
    Failed(String),
    /// Collaborator answered with something we could not use.
    #[error("Malformed collaborator response: {0}")]
    InvalidResponse(String),
    /// The process-wide spend ceiling was crossed.
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else if error.is_status() {
            Self::Failed(error.to_string())
        } else {
            Self::Unavailable(error.to_string())
        }
    }
}

/// Enforces a minimum spacing between calls to a rate-limited vendor.
///
/// Callers `wait` before each request; concurrent callers queue on the internal lock, so
/// requests leave at most once per interval regardless of fan-out.
pub struct Pacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    /// Allow at most `requests` calls per minute.
    pub fn per_minute(requests: u32) -> Self {
        Self::with_interval(Duration::from_secs(60) / requests.max(1))
    }

    /// Space calls at least `interval` apart.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Suspend until the next slot is available, then claim it.
    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(slot) = *next_slot
            && slot > now
        {
            sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = Pacer::with_interval(Duration::from_secs(15));
        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn per_minute_derives_interval() {
        let pacer = Pacer::per_minute(4);
        assert_eq!(pacer.interval, Duration::from_secs(15));
    }
}

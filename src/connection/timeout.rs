//! Client-side deadlines for blocking reads.
//!
//! The server never learns about these deadlines. A `Deadline` only bounds
//! how long the caller waits. Whatever the server eventually sends is still
//! on its way and is drained by the connection's reply ledger.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::TimeoutError;

/// Point in time after which a read is abandoned.
///
/// Built when a blocking read starts and dropped when that read returns,
/// times out or fails. Never stored between operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    /// A deadline that never elapses.
    pub fn never() -> Self {
        Self {
            at: None,
            budget: None,
        }
    }

    /// Deadline `timeout` from now. `None` or zero means no deadline.
    ///
    /// # Arguments
    /// * `timeout` - Time budget for the read
    ///
    /// # Returns
    /// * `Deadline` - Deadline anchored at the current instant
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(budget) if !budget.is_zero() => Self {
                at: Some(Instant::now() + budget),
                budget: Some(budget),
            },
            _ => Self::never(),
        }
    }

    /// The budget this deadline was built from.
    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether a bounded deadline has already passed.
    pub fn is_elapsed(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Drive `fut` until it completes or the deadline passes.
    ///
    /// When the deadline passes first, `fut` is dropped and a
    /// [`TimeoutError`] is returned. Only cancel-safe futures may be passed
    /// here, otherwise bytes read by the dropped future would be lost.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        match self.at {
            None => Ok(fut.await),
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| TimeoutError {
                    after: self.budget.unwrap_or_default(),
                    request_id: None,
                }),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::never()
    }
}

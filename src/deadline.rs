//! # Deadline Races
//!
//! One primitive for "run this operation, but give up after a budget".
//! Disconnect cleanup, process shutdown, the summary call and relay flushing
//! all race an operation against a timer and act on whichever finishes first.
//!
//! ## Cancellation semantics:
//! When the timer wins, the operation future is dropped at its current
//! suspension point. Nothing after that point runs, and nothing awaits it.

use std::future::Future;
use std::time::Duration;

/// Which side of the race finished first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deadline<T> {
    /// The operation finished inside the budget, with its output.
    Completed(T),
    /// The budget elapsed first; the operation was abandoned.
    Expired,
}

/// Race `operation` against a timer of `budget`.
pub async fn race<F>(budget: Duration, operation: F) -> Deadline<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(budget, operation).await {
        Ok(output) => Deadline::Completed(output),
        Err(_elapsed) => Deadline::Expired,
    }
}

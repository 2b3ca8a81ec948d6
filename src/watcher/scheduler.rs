//! Fixed-cadence polling loop.
//!
//! The loop waits on a cancellation token and a deadline at the same time
//! (`tokio::select!`), so it never blocks a runtime thread and stops
//! promptly when asked to.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One unit of periodic work.
pub trait Tick: Send {
    type Error: Display;

    fn tick(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub ticks: u64,
    pub failures: u64,
}

/// Runs `ticker` every `interval` until `cancel` fires.
///
/// The cadence is measured between tick *starts*: after a tick that took `d`,
/// the loop sleeps `interval - d`, or not at all when `d >= interval`. A slow
/// tick therefore shortens the following sleep but never causes a tick to be
/// skipped or run twice to catch up.
///
/// Cancellation is checked before every tick and raced against the sleep. A
/// tick already in progress is never interrupted.
///
/// Tick errors and panics are logged and counted; they never end the loop.
pub async fn run<T: Tick>(ticker: &mut T, interval: Duration, cancel: CancellationToken) -> PollStats {
    let mut stats = PollStats::default();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        stats.ticks += 1;

        match AssertUnwindSafe(ticker.tick()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.failures += 1;
                tracing::warn!(tick = stats.ticks, error = %e, "Poll tick failed");
            }
            Err(panic) => {
                stats.failures += 1;
                tracing::error!(
                    tick = stats.ticks,
                    panic = %panic_message(panic.as_ref()),
                    "Poll tick panicked"
                );
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= interval {
            tracing::debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "Tick overran the poll interval, starting next tick immediately"
            );
        }

        // An interval too large to represent means the next tick never comes
        let deadline = started.checked_add(interval);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline) => {}
        }
    }

    tracing::debug!(ticks = stats.ticks, failures = stats.failures, "Poll loop exited");
    stats
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Extracts the message from a panic payload (`&str` or `String`).
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

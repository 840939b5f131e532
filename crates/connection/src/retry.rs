//! Retry scheduling with bounded exponential backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::handler::Dispatcher;
use crate::types::{ConnectionError, ConnectionEvent, RetryConfig};

/// The wait was interrupted by teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cancelled;

/// Tracks the current failure streak and turns it into retry delays.
///
/// Only a successful connection ends a streak; nothing here ever gives up.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    config: RetryConfig,
    failures: u32,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.failures
    }

    /// Delay that the next failure will be given.
    pub fn next_delay(&self) -> Duration {
        self.config
            .delay_for_attempt(self.failures.saturating_add(1))
    }

    /// Counts one more failure and returns the delay before the next try.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_attempt(self.failures)
    }

    /// Ends the current streak.
    pub fn reset(&mut self) {
        if self.failures > 0 {
            debug!(failures = self.failures, "retry streak reset");
        }
        self.failures = 0;
    }

    /// Records `error`, reports the retry and sleeps for the backoff delay.
    pub(crate) async fn backoff(
        &mut self,
        error: ConnectionError,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let delay = self.record_failure();
        let total_tries = self.failures;
        info!(
            total_tries,
            delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
            error = %error,
            "retrying"
        );
        dispatcher.dispatch(ConnectionEvent::Retry {
            total_tries,
            error,
            delay,
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("retry wait cancelled");
                Err(Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

//! Round-robin health probing of the candidate base URIs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sessionlink_protocol::HostConfig;

use crate::handler::Dispatcher;
use crate::retry::{Cancelled, RetryScheduler};
use crate::transport::Transport;
use crate::types::{BaseUri, ConfigError, ConnectionError};

/// A candidate that answered both its health check and host-config request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProbeSuccess {
    pub index: usize,
    pub host_config: HostConfig,
}

/// Finds a responsive server among an ordered list of candidates.
pub struct UriProber {
    candidates: Vec<BaseUri>,
    transport: Arc<dyn Transport>,
    ping_timeout: Duration,
}

impl UriProber {
    pub fn new(
        candidates: Vec<BaseUri>,
        transport: Arc<dyn Transport>,
        ping_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if candidates.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        Ok(Self {
            candidates,
            transport,
            ping_timeout,
        })
    }

    pub fn candidates(&self) -> &[BaseUri] {
        &self.candidates
    }

    pub fn candidate(&self, index: usize) -> Option<&BaseUri> {
        self.candidates.get(index)
    }

    /// Pings one candidate, giving up after the ping timeout.
    pub async fn ping(&self, index: usize) -> Result<HostConfig, ConnectionError> {
        let base = &self.candidates[index % self.candidates.len()];
        debug!(uri = %base, "pinging server");
        match tokio::time::timeout(self.ping_timeout, self.transport.ping(base)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::TimedOut),
        }
    }

    /// Pings candidates round-robin from the first one until one answers.
    ///
    /// Every failed ping counts as a failure on `retry` and waits out its
    /// backoff before the next candidate is tried.
    pub(crate) async fn probe(
        &self,
        retry: &mut RetryScheduler,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Result<ProbeSuccess, Cancelled> {
        let mut index = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                r = self.ping(index) => r,
            };

            let base = &self.candidates[index];
            match result {
                Ok(host_config) => {
                    info!(uri = %base, "server is reachable");
                    return Ok(ProbeSuccess { index, host_config });
                }
                Err(error) => {
                    warn!(uri = %base, error = %error, "health check failed");
                    index = (index + 1) % self.candidates.len();
                    retry.backoff(error, dispatcher, cancel).await?;
                }
            }
        }
    }
}

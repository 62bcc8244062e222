//! Prioritized multi-source polling.
//!
//! Enabled proxies are tried first, then enabled sensors, each group in
//! ascending priority. Queries are strictly sequential and the first
//! structurally valid reading ends the cycle; lower-priority endpoints are
//! not contacted. Every query runs under a hard deadline, and a deadline
//! overrun is handled like any other endpoint failure.

mod http;


pub use http::HttpFetcher;

use crate::endpoint::SourceEndpoint;
use crate::error::{EndpointError, EndpointFailure, SourceFailure};
use crate::reading::RawReading;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Performs one read request against one endpoint.
#[async_trait]
pub trait ReadingFetcher: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        deadline: Duration,
    ) -> Result<RawReading, EndpointError>;
}

pub struct SourceCascade<F> {
    endpoints: Vec<SourceEndpoint>,
    fetcher: F,
    first_poll_done: AtomicBool,
}

impl<F: ReadingFetcher> SourceCascade<F> {
    /// Keeps only enabled endpoints, ordered proxies-then-sensors by priority.
    pub fn new(endpoints: Vec<SourceEndpoint>, fetcher: F) -> Self {
        let mut endpoints: Vec<SourceEndpoint> =
            endpoints.into_iter().filter(|ep| ep.enabled).collect();
        endpoints.sort_by_key(|ep| (ep.role, ep.priority));
        Self {
            endpoints,
            fetcher,
            first_poll_done: AtomicBool::new(false),
        }
    }

    pub fn endpoints(&self) -> &[SourceEndpoint] {
        &self.endpoints
    }

    pub fn is_first_poll(&self) -> bool {
        !self.first_poll_done.load(Ordering::Acquire)
    }

    pub async fn poll(&self) -> Result<RawReading, SourceFailure> {
        let first_poll = self.is_first_poll();
        let mut failures = Vec::new();
        let mut winner = None;

        for endpoint in &self.endpoints {
            let deadline = endpoint.deadline(first_poll);
            let outcome =
                match tokio::time::timeout(deadline, self.fetcher.fetch(endpoint, deadline)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EndpointError::Timeout { after: deadline }),
                };

            match outcome {
                Ok(reading) => {
                    tracing::debug!(
                        source = %endpoint.id(),
                        observed_at = %reading.observed_at,
                        skipped = failures.len(),
                        "source answered"
                    );
                    winner = Some(reading);
                    break;
                }
                Err(error) => {
                    tracing::info!(
                        source = %endpoint.id(),
                        kind = error.kind(),
                        deadline_ms = deadline.as_millis() as u64,
                        error = %error,
                        "source failed; trying next"
                    );
                    failures.push(EndpointFailure {
                        source: endpoint.id(),
                        error,
                    });
                }
            }
        }

        self.first_poll_done.store(true, Ordering::Release);
        winner.ok_or(SourceFailure { failures })
    }
}

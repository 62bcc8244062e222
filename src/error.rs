use crate::endpoint::SourceId;
use crate::payload::PayloadError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a single endpoint produced no reading. Always handled inside the
/// cascade by moving on to the next endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),
}

impl EndpointError {
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointError::Timeout { .. } => "endpoint_timeout",
            EndpointError::Unreachable(_) => "endpoint_unreachable",
            EndpointError::MalformedPayload(_) => "malformed_payload",
        }
    }
}

impl From<reqwest::Error> for EndpointError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return EndpointError::MalformedPayload(PayloadError::Json(err.to_string()));
        }
        if let Some(status) = err.status() {
            return EndpointError::Unreachable(format!("HTTP {status}"));
        }
        EndpointError::Unreachable(err.to_string())
    }
}

#[derive(Debug)]
pub struct EndpointFailure {
    pub source: SourceId,
    pub error: EndpointError,
}

/// Every enabled endpoint failed during one cycle.
#[derive(Debug, Error)]
#[error("all sources failed: {}", summarize(.failures))]
pub struct SourceFailure {
    pub failures: Vec<EndpointFailure>,
}

fn summarize(failures: &[EndpointFailure]) -> String {
    if failures.is_empty() {
        return "no enabled sources".to_string();
    }
    failures
        .iter()
        .map(|failure| format!("[{}: {}]", failure.source, failure.error))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A cycle that ended without publishing a new value.
#[derive(Debug)]
pub enum NoUpdate {
    AllSourcesFailed(SourceFailure),
    StaleReading {
        source: SourceId,
        observed_at: DateTime<Utc>,
        age_secs: f64,
        max_age_secs: f64,
    },
    InsaneReading {
        source: SourceId,
        channel_a_pm2_5_cf1: f64,
        channel_b_pm2_5_cf1: f64,
    },
}

impl NoUpdate {
    pub fn kind(&self) -> NoUpdateKind {
        match self {
            NoUpdate::AllSourcesFailed(_) => NoUpdateKind::AllSourcesFailed,
            NoUpdate::StaleReading { .. } => NoUpdateKind::StaleReading,
            NoUpdate::InsaneReading { .. } => NoUpdateKind::InsaneReading,
        }
    }
}

impl fmt::Display for NoUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoUpdate::AllSourcesFailed(failure) => write!(f, "{failure}"),
            NoUpdate::StaleReading {
                source,
                age_secs,
                max_age_secs,
                ..
            } => write!(
                f,
                "stale reading from {source}: {age_secs:.0}s old (limit {max_age_secs:.0}s)"
            ),
            NoUpdate::InsaneReading {
                source,
                channel_a_pm2_5_cf1,
                channel_b_pm2_5_cf1,
            } => write!(
                f,
                "channels disagree on {source}: A={channel_a_pm2_5_cf1} B={channel_b_pm2_5_cf1}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoUpdateKind {
    AllSourcesFailed,
    StaleReading,
    InsaneReading,
}

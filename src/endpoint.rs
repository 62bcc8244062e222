use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// Intermediary aggregator, queried before any sensor.
    Proxy,
    Sensor,
}

impl SourceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceRole::Proxy => "proxy",
            SourceRole::Sensor => "sensor",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            SourceRole::Proxy => 8000,
            SourceRole::Sensor => 80,
        }
    }
}

/// Identity of a source, attached to readings and failures for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceId {
    pub role: SourceRole,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.role.as_str(), self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    pub role: SourceRole,
    /// Unique within a role; lower is tried first.
    pub priority: u32,
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    /// Only honoured for proxies, and only on the first poll after start.
    pub startup_timeout: Option<Duration>,
    pub enabled: bool,
}

impl SourceEndpoint {
    pub fn id(&self) -> SourceId {
        SourceId {
            role: self.role,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/json", self.host, self.port)
    }

    /// Deadline for a single request to this endpoint.
    pub fn deadline(&self, first_poll: bool) -> Duration {
        match (self.role, first_poll, self.startup_timeout) {
            (SourceRole::Proxy, true, Some(startup)) => startup.max(self.request_timeout),
            _ => self.request_timeout,
        }
    }
}

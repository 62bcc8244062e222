use crate::endpoint::SourceId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One physical sensing element of a PurpleAir unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Channel {
    pub pm2_5_cf1: f64,
    pub temperature_f: f64,
    pub humidity: f64,
}

/// One decoded sample, as reported by a source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawReading {
    pub source: SourceId,
    /// Sample time assigned by the source.
    pub observed_at: DateTime<Utc>,
    pub pm1_0: Option<f64>,
    pub pm10_0: Option<f64>,
    pub channel_a: Channel,
    /// Absent for indoor/single-channel units.
    pub channel_b: Option<Channel>,
}

impl RawReading {
    pub fn is_dual_channel(&self) -> bool {
        self.channel_b.is_some()
    }

    /// Signed age in seconds; negative when the source clock runs ahead.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.observed_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Fresh,
    Stale,
    Insane,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedReading {
    pub reading: RawReading,
    pub verdict: Verdict,
}

/// Output of one successful cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectedReading {
    pub source: SourceId,
    pub observed_at: DateTime<Utc>,
    pub pm2_5_epa: f64,
    pub aqi: u32,
    pub aqi_color: u32,
    pub category: crate::aqi::Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_a_aqi: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_b_aqi: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm1_0: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm10_0: Option<f64>,
    pub temperature_f: f64,
    pub humidity: f64,
}

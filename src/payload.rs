//! Decoding of the PurpleAir `/json` document (served identically by sensors
//! and proxies) into a [`RawReading`].

use crate::endpoint::SourceId;
use crate::reading::{Channel, RawReading};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

const PURPLE_DATETIME_FORMAT: &str = "%Y/%m/%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} has no usable value: {raw}")]
    InvalidField { field: &'static str, raw: String },
    #[error("unparseable DateTime: {0}")]
    BadTimestamp(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Non-negative finite value, or `None` for "no data".
    fn concentration(&self) -> Option<f64> {
        let value = match self {
            Scalar::Number(value) => *value,
            Scalar::Text(raw) => raw.trim().parse::<f64>().ok()?,
        };
        (value.is_finite() && value >= 0.0).then_some(value)
    }

    fn finite(&self) -> Option<f64> {
        let value = match self {
            Scalar::Number(value) => *value,
            Scalar::Text(raw) => raw.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    fn raw(&self) -> String {
        match self {
            Scalar::Number(value) => value.to_string(),
            Scalar::Text(raw) => raw.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PurpleDocument {
    #[serde(rename = "DateTime", default)]
    date_time: Option<String>,
    #[serde(default)]
    current_temp_f: Option<Scalar>,
    #[serde(default)]
    current_humidity: Option<Scalar>,
    #[serde(default)]
    pm2_5_cf_1: Option<Scalar>,
    #[serde(default)]
    pm1_0_atm: Option<Scalar>,
    #[serde(default)]
    pm1_0_cf_1: Option<Scalar>,
    #[serde(default)]
    pm10_0_atm: Option<Scalar>,
    #[serde(default)]
    pm10_0_cf_1: Option<Scalar>,
    #[serde(default)]
    pm2_5_cf_1_b: Option<Scalar>,
    #[serde(default)]
    pm1_0_atm_b: Option<Scalar>,
    #[serde(default)]
    pm1_0_cf_1_b: Option<Scalar>,
    #[serde(default)]
    pm10_0_atm_b: Option<Scalar>,
    #[serde(default)]
    pm10_0_cf_1_b: Option<Scalar>,
}

/// Decodes a response body. `body` is parsed in place.
pub fn decode_reading(source: SourceId, body: &mut [u8]) -> Result<RawReading, PayloadError> {
    let doc: PurpleDocument =
        simd_json::serde::from_slice(body).map_err(|err| PayloadError::Json(err.to_string()))?;
    reading_from_document(source, doc)
}

fn reading_from_document(
    source: SourceId,
    doc: PurpleDocument,
) -> Result<RawReading, PayloadError> {
    let raw_ts = doc
        .date_time
        .as_deref()
        .ok_or(PayloadError::MissingField("DateTime"))?;
    let observed_at = parse_purple_datetime(raw_ts)?;

    let temperature_f = required(&doc.current_temp_f, "current_temp_f", Scalar::finite)?;
    let humidity = required(&doc.current_humidity, "current_humidity", Scalar::concentration)?;
    let pm2_5_cf1 = required(&doc.pm2_5_cf_1, "pm2_5_cf_1", Scalar::concentration)?;

    let channel_a = Channel {
        pm2_5_cf1,
        temperature_f,
        humidity,
    };

    // A dead B laser leaves channel A usable; the unit reads as single-channel.
    let channel_b = match &doc.pm2_5_cf_1_b {
        Some(scalar) => match scalar.concentration() {
            Some(pm2_5_cf1) => Some(Channel {
                pm2_5_cf1,
                temperature_f,
                humidity,
            }),
            None => {
                tracing::debug!(
                    source = %source,
                    raw = %scalar.raw(),
                    "channel B has no usable pm2_5_cf_1_b; using channel A only"
                );
                None
            }
        },
        None => None,
    };

    let pm1_0 = average(
        optional(&doc.pm1_0_atm).or_else(|| optional(&doc.pm1_0_cf_1)),
        optional(&doc.pm1_0_atm_b).or_else(|| optional(&doc.pm1_0_cf_1_b)),
    );
    let pm10_0 = average(
        optional(&doc.pm10_0_atm).or_else(|| optional(&doc.pm10_0_cf_1)),
        optional(&doc.pm10_0_atm_b).or_else(|| optional(&doc.pm10_0_cf_1_b)),
    );

    Ok(RawReading {
        source,
        observed_at,
        pm1_0,
        pm10_0,
        channel_a,
        channel_b,
    })
}

fn required(
    value: &Option<Scalar>,
    field: &'static str,
    extract: fn(&Scalar) -> Option<f64>,
) -> Result<f64, PayloadError> {
    let scalar = value.as_ref().ok_or(PayloadError::MissingField(field))?;
    extract(scalar).ok_or_else(|| PayloadError::InvalidField {
        field,
        raw: scalar.raw(),
    })
}

fn optional(value: &Option<Scalar>) -> Option<f64> {
    value.as_ref().and_then(Scalar::concentration)
}

fn average(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(value), None) | (None, Some(value)) => Some(value),
        (None, None) => None,
    }
}

/// Parses `2020/03/20T17:16:00z` (always UTC), falling back to RFC 3339.
pub fn parse_purple_datetime(raw: &str) -> Result<DateTime<Utc>, PayloadError> {
    let trimmed = raw.trim();
    let without_zone = trimmed.trim_end_matches(['z', 'Z']);
    if let Ok(naive) = NaiveDateTime::parse_from_str(without_zone, PURPLE_DATETIME_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PayloadError::BadTimestamp(raw.to_string()))
}

use crate::aqi::to_aqi;
use crate::cascade::{ReadingFetcher, SourceCascade};
use crate::correction::{correct, correct_channels};
use crate::error::NoUpdate;
use crate::reading::{CorrectedReading, RawReading, ValidatedReading, Verdict};
use crate::validate::{validate, ValidationPolicy};
use chrono::{DateTime, Utc};

/// Result of one polling cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    Updated(CorrectedReading),
    NoUpdate(NoUpdate),
}

impl CycleOutcome {
    pub fn reading(&self) -> Option<&CorrectedReading> {
        match self {
            CycleOutcome::Updated(reading) => Some(reading),
            CycleOutcome::NoUpdate(_) => None,
        }
    }
}

/// Owns the cascade and the last validated reading. Driven by a single task;
/// cycles never overlap.
pub struct ReadingPipeline<F> {
    cascade: SourceCascade<F>,
    policy: ValidationPolicy,
    last_validated: Option<ValidatedReading>,
}

impl<F: ReadingFetcher> ReadingPipeline<F> {
    pub fn new(cascade: SourceCascade<F>, policy: ValidationPolicy) -> Self {
        Self {
            cascade,
            policy,
            last_validated: None,
        }
    }

    pub fn cascade(&self) -> &SourceCascade<F> {
        &self.cascade
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        let reading = match self.cascade.poll().await {
            Ok(reading) => reading,
            Err(failure) => {
                tracing::error!(
                    endpoints = failure.failures.len(),
                    error = %failure,
                    "could not get a reading from any source"
                );
                return CycleOutcome::NoUpdate(NoUpdate::AllSourcesFailed(failure));
            }
        };

        match validate(&self.policy, &reading, self.last_validated.as_ref(), now) {
            Verdict::Stale => CycleOutcome::NoUpdate(NoUpdate::StaleReading {
                source: reading.source.clone(),
                observed_at: reading.observed_at,
                age_secs: reading.age_secs(now),
                max_age_secs: self.policy.max_age().as_secs_f64(),
            }),
            Verdict::Insane => CycleOutcome::NoUpdate(NoUpdate::InsaneReading {
                source: reading.source.clone(),
                channel_a_pm2_5_cf1: reading.channel_a.pm2_5_cf1,
                channel_b_pm2_5_cf1: reading
                    .channel_b
                    .as_ref()
                    .map(|b| b.pm2_5_cf1)
                    .unwrap_or(f64::NAN),
            }),
            Verdict::Fresh => {
                let corrected = correct_reading(&reading);
                tracing::debug!(
                    source = %corrected.source,
                    pm2_5_epa = corrected.pm2_5_epa,
                    aqi = corrected.aqi,
                    "corrected reading"
                );
                self.last_validated = Some(ValidatedReading {
                    reading,
                    verdict: Verdict::Fresh,
                });
                CycleOutcome::Updated(corrected)
            }
        }
    }

    /// Last validated reading, only while it is still fresh at `now`.
    pub fn last_known(&self, now: DateTime<Utc>) -> Option<&ValidatedReading> {
        self.last_validated
            .as_ref()
            .filter(|validated| !self.policy.is_stale(&validated.reading, now))
    }
}

/// Applies the EPA correction per channel and maps the result to an AQI.
pub fn correct_reading(reading: &RawReading) -> CorrectedReading {
    let a = &reading.channel_a;
    let b = reading.channel_b.as_ref();
    let pm2_5_epa = correct_channels(a, b);
    let index = to_aqi(pm2_5_epa);

    let (channel_a_aqi, channel_b_aqi) = match b {
        Some(b) => (
            Some(to_aqi(correct(a.pm2_5_cf1, a.humidity)).aqi),
            Some(to_aqi(correct(b.pm2_5_cf1, b.humidity)).aqi),
        ),
        None => (None, None),
    };

    CorrectedReading {
        source: reading.source.clone(),
        observed_at: reading.observed_at,
        pm2_5_epa,
        aqi: index.aqi,
        aqi_color: index.color,
        category: index.category,
        channel_a_aqi,
        channel_b_aqi,
        pm1_0: reading.pm1_0,
        pm10_0: reading.pm10_0,
        temperature_f: a.temperature_f,
        humidity: a.humidity,
    }
}

use crate::reading::{RawReading, ValidatedReading, Verdict};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_FRESHNESS_BASE: Duration = Duration::from_secs(120);
pub const DEFAULT_SANITY_ABS_FLOOR: f64 = 5.0;
pub const DEFAULT_SANITY_REL_FRACTION: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationPolicy {
    pub poll_interval: Duration,
    pub freshness_base: Duration,
    /// ug/m3 the channels may always disagree by.
    pub sanity_abs_floor: f64,
    /// Fraction of the channel average the channels may disagree by.
    pub sanity_rel_fraction: f64,
}

impl ValidationPolicy {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            freshness_base: DEFAULT_FRESHNESS_BASE,
            sanity_abs_floor: DEFAULT_SANITY_ABS_FLOOR,
            sanity_rel_fraction: DEFAULT_SANITY_REL_FRACTION,
        }
    }

    /// `max(base, 3 * poll_interval)`; sources stamp their own sample time,
    /// which lags the poll under load.
    pub fn max_age(&self) -> Duration {
        self.freshness_base.max(self.poll_interval.saturating_mul(3))
    }

    pub fn is_stale(&self, reading: &RawReading, now: DateTime<Utc>) -> bool {
        reading.age_secs(now).abs() > self.max_age().as_secs_f64()
    }

    pub fn channels_disagree(&self, a: f64, b: f64) -> bool {
        let diff = (a - b).abs();
        let avg = (a + b) / 2.0;
        diff > self.sanity_abs_floor && diff > self.sanity_rel_fraction * avg
    }
}

/// What gets logged when a reading is rejected, for either verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectionDetail<'a> {
    pub host: &'a str,
    pub observed_at: DateTime<Utc>,
    pub age_secs: f64,
    pub channel_a_pm2_5_cf1: f64,
    pub channel_b_pm2_5_cf1: Option<f64>,
    /// Age of the last reading that passed, if any.
    pub last_good_age_secs: Option<f64>,
}

impl<'a> RejectionDetail<'a> {
    pub fn new(
        current: &'a RawReading,
        previous: Option<&ValidatedReading>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            host: &current.source.host,
            observed_at: current.observed_at,
            age_secs: current.age_secs(now),
            channel_a_pm2_5_cf1: current.channel_a.pm2_5_cf1,
            channel_b_pm2_5_cf1: current.channel_b.as_ref().map(|b| b.pm2_5_cf1),
            last_good_age_secs: previous.map(|prev| prev.reading.age_secs(now)),
        }
    }
}

/// Classifies a freshly polled reading.
///
/// `previous` is the last reading that passed validation. It does not change
/// the verdict; it is reported so that repeated rejections show how long the
/// published value has gone without a refresh.
pub fn validate(
    policy: &ValidationPolicy,
    current: &RawReading,
    previous: Option<&ValidatedReading>,
    now: DateTime<Utc>,
) -> Verdict {
    if policy.is_stale(current, now) {
        let detail = RejectionDetail::new(current, previous, now);
        tracing::info!(
            source = %current.source,
            host = detail.host,
            observed_at = %detail.observed_at,
            age_secs = detail.age_secs,
            max_age_secs = policy.max_age().as_secs_f64(),
            channel_a_pm2_5_cf1 = detail.channel_a_pm2_5_cf1,
            channel_b_pm2_5_cf1 = detail.channel_b_pm2_5_cf1,
            last_good_age_secs = detail.last_good_age_secs,
            "reading is stale"
        );
        return Verdict::Stale;
    }

    if let Some(b) = current.channel_b.as_ref() {
        if policy.channels_disagree(current.channel_a.pm2_5_cf1, b.pm2_5_cf1) {
            let detail = RejectionDetail::new(current, previous, now);
            tracing::warn!(
                source = %current.source,
                host = detail.host,
                observed_at = %detail.observed_at,
                age_secs = detail.age_secs,
                channel_a_pm2_5_cf1 = detail.channel_a_pm2_5_cf1,
                channel_b_pm2_5_cf1 = detail.channel_b_pm2_5_cf1,
                last_good_age_secs = detail.last_good_age_secs,
                "channels A and B disagree; reading is insane"
            );
            return Verdict::Insane;
        }
    }

    Verdict::Fresh
}

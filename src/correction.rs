//! 2021 US EPA correction for PurpleAir PM2.5 (CF=1) readings.
//!
//! Low concentration (`cf1 < 343`):  `0.52 * cf1 - 0.086 * RH + 5.75`
//! High concentration (`cf1 >= 343`): `0.46 * cf1 + 3.93e-4 * cf1^2 + 2.97`

use crate::reading::Channel;

pub const HIGH_CONCENTRATION_THRESHOLD: f64 = 343.0;

/// Corrected PM2.5 for one channel. Never negative.
///
/// The raw value is truncated to one decimal place first; the coefficients
/// were fit against truncated inputs.
pub fn correct(pm2_5_cf1: f64, humidity: f64) -> f64 {
    if !pm2_5_cf1.is_finite() || pm2_5_cf1 < 0.0 {
        return 0.0;
    }
    let cf1 = truncate_to_tenth(pm2_5_cf1);
    let value = if cf1 < HIGH_CONCENTRATION_THRESHOLD {
        0.52 * cf1 - 0.086 * humidity + 5.75
    } else {
        0.46 * cf1 + 3.93e-4 * cf1 * cf1 + 2.97
    };
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Corrects each channel independently and averages the corrected outputs.
pub fn correct_channels(a: &Channel, b: Option<&Channel>) -> f64 {
    let corrected_a = correct(a.pm2_5_cf1, a.humidity);
    match b {
        Some(b) => (corrected_a + correct(b.pm2_5_cf1, b.humidity)) / 2.0,
        None => corrected_a,
    }
}

fn truncate_to_tenth(value: f64) -> f64 {
    (value * 10.0).trunc() / 10.0
}

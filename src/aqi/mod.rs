//! PM2.5 concentration to US EPA Air Quality Index.
//!
//! The concentration is rounded to the nearest tenth, matched against the
//! breakpoint table by inclusive lower bound, and linearly interpolated
//! inside the bucket. Concentrations above the table keep the slope of the
//! top bucket, so the index keeps growing past 500.

mod breakpoints;

pub use breakpoints::{bucket_for, Breakpoint, Category, PM2_5_BREAKPOINTS};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AqiValue {
    pub aqi: u32,
    pub color: u32,
    pub category: Category,
}

/// Maps a corrected PM2.5 concentration (ug/m3) to an AQI and display color.
///
/// Negative and non-finite inputs carry no data and map to 0 / Good.
pub fn to_aqi(concentration: f64) -> AqiValue {
    if !concentration.is_finite() || concentration <= 0.0 {
        let category = PM2_5_BREAKPOINTS[0].category;
        return AqiValue {
            aqi: 0,
            color: category.color(),
            category,
        };
    }

    let c = round_to_tenth(concentration);
    let bp = bucket_for(c);
    let aqi = (bp.slope() * (c - bp.c_lo) + f64::from(bp.aqi_lo)).round();

    AqiValue {
        aqi: aqi.max(0.0) as u32,
        color: bp.category.color(),
        category: bp.category,
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

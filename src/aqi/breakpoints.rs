use serde::Serialize;

/// EPA PM2.5 health category. The variant order matches [`PM2_5_BREAKPOINTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Good,
    Moderate,
    UnhealthyForSensitiveGroups,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Good => "Good",
            Category::Moderate => "Moderate",
            Category::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            Category::Unhealthy => "Unhealthy",
            Category::VeryUnhealthy => "Very Unhealthy",
            Category::Hazardous => "Hazardous",
        }
    }

    /// Packed `0xRRGGBB` display color for the category.
    pub fn color(self) -> u32 {
        match self {
            Category::Good => rgb(0, 128, 0),
            Category::Moderate => rgb(255, 255, 0),
            Category::UnhealthyForSensitiveGroups => rgb(255, 140, 0),
            Category::Unhealthy => rgb(255, 0, 0),
            Category::VeryUnhealthy => rgb(128, 0, 128),
            Category::Hazardous => rgb(128, 0, 0),
        }
    }
}

const fn rgb(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakpoint {
    pub c_lo: f64,
    pub c_hi: f64,
    pub aqi_lo: u32,
    pub aqi_hi: u32,
    pub category: Category,
}

impl Breakpoint {
    pub fn slope(&self) -> f64 {
        f64::from(self.aqi_hi - self.aqi_lo) / (self.c_hi - self.c_lo)
    }
}

// 24-hour PM2.5 breakpoints, ug/m3. Ordered by c_lo; a bucket owns every
// concentration from its c_lo up to the next bucket's c_lo.
pub const PM2_5_BREAKPOINTS: [Breakpoint; 6] = [
    Breakpoint {
        c_lo: 0.0,
        c_hi: 12.0,
        aqi_lo: 0,
        aqi_hi: 50,
        category: Category::Good,
    },
    Breakpoint {
        c_lo: 12.1,
        c_hi: 35.4,
        aqi_lo: 51,
        aqi_hi: 100,
        category: Category::Moderate,
    },
    Breakpoint {
        c_lo: 35.5,
        c_hi: 55.4,
        aqi_lo: 101,
        aqi_hi: 150,
        category: Category::UnhealthyForSensitiveGroups,
    },
    Breakpoint {
        c_lo: 55.5,
        c_hi: 150.4,
        aqi_lo: 151,
        aqi_hi: 200,
        category: Category::Unhealthy,
    },
    Breakpoint {
        c_lo: 150.5,
        c_hi: 250.4,
        aqi_lo: 201,
        aqi_hi: 300,
        category: Category::VeryUnhealthy,
    },
    Breakpoint {
        c_lo: 250.5,
        c_hi: 500.4,
        aqi_lo: 301,
        aqi_hi: 500,
        category: Category::Hazardous,
    },
];

/// Returns the bucket owning `concentration`. Values below the first bucket
/// land in the first one; values above the last stay in the last one.
pub fn bucket_for(concentration: f64) -> &'static Breakpoint {
    PM2_5_BREAKPOINTS
        .iter()
        .rev()
        .find(|bp| concentration >= bp.c_lo)
        .unwrap_or(&PM2_5_BREAKPOINTS[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_ordered_and_contiguous() {
        for pair in PM2_5_BREAKPOINTS.windows(2) {
            assert!(pair[0].c_hi < pair[1].c_lo);
            assert!((pair[1].c_lo - pair[0].c_hi - 0.1).abs() < 1e-9);
            assert_eq!(pair[0].aqi_hi + 1, pair[1].aqi_lo);
        }
    }

    #[test]
    fn colors_match_the_display_palette() {
        assert_eq!(Category::Good.color(), 0x008000);
        assert_eq!(Category::Moderate.color(), 0xFFFF00);
        assert_eq!(Category::UnhealthyForSensitiveGroups.color(), 0xFF8C00);
        assert_eq!(Category::Unhealthy.color(), 0xFF0000);
        assert_eq!(Category::VeryUnhealthy.color(), 0x800080);
        assert_eq!(Category::Hazardous.color(), 0x800000);
    }

    #[test]
    fn bucket_lookup_uses_inclusive_low_bound() {
        assert_eq!(bucket_for(12.0).category, Category::Good);
        assert_eq!(bucket_for(12.1).category, Category::Moderate);
        assert_eq!(bucket_for(35.4).category, Category::Moderate);
        assert_eq!(bucket_for(35.5).category, Category::UnhealthyForSensitiveGroups);
        assert_eq!(bucket_for(900.0).category, Category::Hazardous);
    }
}

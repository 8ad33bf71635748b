//! Feature extraction for the scoring model and the similarity archive.
//!
//! A day's hourly forecast is collapsed into a fixed-order vector of daylight
//! aggregates, min-max scaled to [0, 1]. The scaling is invertible so that a
//! "similar past day" can be rendered in the same display format as a live
//! forecast.

use crate::services::ingest::HourlyWeather;

/// Hours of the day considered for flyability (local solar time).
const DAYLIGHT_START: u8 = 8;
const DAYLIGHT_END: u8 = 18;

/// Fixed per-feature (min, max) bounds used for scaling. Order matches
/// `DayAggregates::to_feature_vector`.
const FEATURE_BOUNDS: [(f64, f64); 8] = [
    (0.0, 30.0),    // wind speed mean, m/s
    (0.0, 45.0),    // wind gust max, m/s
    (0.0, 360.0),   // wind direction mean, deg
    (-20.0, 45.0),  // temperature max, °C
    (0.0, 100.0),   // humidity mean, %
    (0.0, 50.0),    // precipitation sum, mm
    (0.0, 100.0),   // cloud cover mean, %
    (85.0, 107.0),  // pressure mean, kPa
];

pub const FEATURE_DIM: usize = FEATURE_BOUNDS.len();

/// Daylight-window aggregates of one forecast day, in display units.
#[derive(Debug, Clone, PartialEq)]
pub struct DayAggregates {
    pub wind_speed_mean_mps: f64,
    pub wind_gust_max_mps: f64,
    pub wind_direction_mean_deg: f64,
    pub temperature_max_c: f64,
    pub humidity_mean_pct: f64,
    pub precipitation_sum_mm: f64,
    pub cloud_cover_mean_pct: f64,
    pub pressure_mean_kpa: f64,
}

impl DayAggregates {
    pub fn from_hours(hours: &[HourlyWeather]) -> Option<Self> {
        let daylight: Vec<&HourlyWeather> = hours
            .iter()
            .filter(|h| (DAYLIGHT_START..=DAYLIGHT_END).contains(&h.hour))
            .collect();
        let window: Vec<&HourlyWeather> = if daylight.is_empty() {
            hours.iter().collect()
        } else {
            daylight
        };
        if window.is_empty() {
            return None;
        }

        let n = window.len() as f64;
        let mean = |f: fn(&HourlyWeather) -> f64| window.iter().map(|h| f(h)).sum::<f64>() / n;

        Some(Self {
            wind_speed_mean_mps: mean(|h| h.wind_speed_mps),
            wind_gust_max_mps: window
                .iter()
                .map(|h| h.wind_gust_mps)
                .fold(0.0_f64, f64::max),
            wind_direction_mean_deg: mean(|h| h.wind_direction_deg),
            temperature_max_c: window
                .iter()
                .map(|h| h.temperature_c)
                .fold(f64::MIN, f64::max),
            humidity_mean_pct: mean(|h| h.humidity_pct),
            precipitation_sum_mm: window.iter().map(|h| h.precipitation_mm.max(0.0)).sum(),
            cloud_cover_mean_pct: mean(|h| h.cloud_cover_pct),
            pressure_mean_kpa: mean(|h| h.pressure_msl_kpa),
        })
    }

    fn raw_values(&self) -> [f64; FEATURE_DIM] {
        [
            self.wind_speed_mean_mps,
            self.wind_gust_max_mps,
            self.wind_direction_mean_deg,
            self.temperature_max_c,
            self.humidity_mean_pct,
            self.precipitation_sum_mm,
            self.cloud_cover_mean_pct,
            self.pressure_mean_kpa,
        ]
    }
}

/// Scaled feature vector for one site/date. Returns `None` for an empty day.
pub fn to_feature_vector(hours: &[HourlyWeather]) -> Option<Vec<f64>> {
    let aggregates = DayAggregates::from_hours(hours)?;
    Some(scale(&aggregates.raw_values()))
}

/// Inverse transform back to display units. Returns `None` on a dimension
/// mismatch (archive rows written by an older extractor).
pub fn from_feature_vector(features: &[f64]) -> Option<DayAggregates> {
    if features.len() != FEATURE_DIM {
        return None;
    }
    let mut raw = [0.0; FEATURE_DIM];
    for (idx, value) in features.iter().enumerate() {
        let (min, max) = FEATURE_BOUNDS[idx];
        raw[idx] = value.clamp(0.0, 1.0) * (max - min) + min;
    }
    Some(DayAggregates {
        wind_speed_mean_mps: raw[0],
        wind_gust_max_mps: raw[1],
        wind_direction_mean_deg: raw[2],
        temperature_max_c: raw[3],
        humidity_mean_pct: raw[4],
        precipitation_sum_mm: raw[5],
        cloud_cover_mean_pct: raw[6],
        pressure_mean_kpa: raw[7],
    })
}

fn scale(raw: &[f64; FEATURE_DIM]) -> Vec<f64> {
    raw.iter()
        .enumerate()
        .map(|(idx, value)| {
            let (min, max) = FEATURE_BOUNDS[idx];
            ((value - min) / (max - min)).clamp(0.0, 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour(h: u8, wind: f64) -> HourlyWeather {
        HourlyWeather {
            hour: h,
            wind_speed_mps: wind,
            wind_gust_mps: wind * 1.5,
            wind_direction_deg: 180.0,
            temperature_c: 20.0,
            humidity_pct: 50.0,
            precipitation_mm: 0.0,
            cloud_cover_pct: 40.0,
            pressure_msl_kpa: 101.3,
        }
    }

    #[test]
    fn empty_day_produces_no_vector() {
        assert_eq!(to_feature_vector(&[]), None);
    }

    #[test]
    fn vector_is_scaled_into_unit_range() {
        let hours: Vec<HourlyWeather> = (8..=18).map(|h| hour(h, 6.0)).collect();
        let vector = to_feature_vector(&hours).unwrap();
        assert_eq!(vector.len(), FEATURE_DIM);
        assert!(vector.iter().all(|v| (0.0..=1.0).contains(v)));
        // 6 m/s mean wind against a 0..30 bound.
        assert!((vector[0] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn inverse_transform_recovers_display_values() {
        let hours: Vec<HourlyWeather> = (8..=18).map(|h| hour(h, 6.0)).collect();
        let vector = to_feature_vector(&hours).unwrap();
        let display = from_feature_vector(&vector).unwrap();
        assert!((display.wind_speed_mean_mps - 6.0).abs() < 1e-6);
        assert!((display.wind_gust_max_mps - 9.0).abs() < 1e-6);
        assert!((display.temperature_max_c - 20.0).abs() < 1e-6);
        assert!((display.pressure_mean_kpa - 101.3).abs() < 1e-6);
    }

    #[test]
    fn out_of_bounds_values_are_clamped() {
        let mut h = hour(12, 100.0); // above the 30 m/s bound
        h.temperature_c = -60.0; // below the -20 °C bound
        let vector = to_feature_vector(&[h]).unwrap();
        assert_eq!(vector[0], 1.0);
        assert_eq!(vector[3], 0.0);
    }

    #[test]
    fn nighttime_only_forecast_falls_back_to_all_hours() {
        let hours = vec![hour(2, 4.0), hour(23, 4.0)];
        let aggregates = DayAggregates::from_hours(&hours).unwrap();
        assert!((aggregates.wind_speed_mean_mps - 4.0).abs() < 1e-9);
    }

    #[test]
    fn dimension_mismatch_yields_none() {
        assert!(from_feature_vector(&[0.5; 3]).is_none());
    }
}

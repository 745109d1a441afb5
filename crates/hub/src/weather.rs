//! Weather normalization: turns a provider's raw daily payload into one
//! canonical `WeatherObservation` (degC, mm, km/h, MJ/m^2/day).
//!
//! Each provider kind has its own serde model; nothing here inspects JSON
//! shapes at runtime beyond deserializing into that model. The transform is
//! pure, so the same payload always yields the same observation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::error::{EngineError, EngineResult};
use crate::et::saturation_vapour_pressure;

/// Used when a provider omits wind: FAO-56 suggests 2 m/s as a global
/// average when no wind data is available.
pub const DEFAULT_WIND_KMH: f64 = 2.0 * 3.6;

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openweathermap")]
    OpenWeatherMap,
    #[serde(rename = "station")]
    Station,
}

/// What the provider told us about incoming radiation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SolarInput {
    /// Measured global radiation, MJ/m^2/day.
    Measured(f64),
    /// Cloud cover percentage; only a proxy for radiation.
    CloudCover(f64),
    Unavailable,
}

impl SolarInput {
    pub fn is_measured(&self) -> bool {
        matches!(self, SolarInput::Measured(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub date: Date,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub humidity_mean_pct: f64,
    pub wind_speed_kmh: f64,
    pub solar: SolarInput,
    pub precip_mm: f64,
}

impl WeatherObservation {
    pub fn temp_mean_c(&self) -> f64 {
        (self.temp_min_c + self.temp_max_c) / 2.0
    }

    pub fn temp_range_c(&self) -> f64 {
        (self.temp_max_c - self.temp_min_c).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Normalize `raw` (as delivered by the weather source for `date`).
pub fn normalize(raw: &Value, kind: ProviderKind, date: Date) -> EngineResult<WeatherObservation> {
    let obs = match kind {
        ProviderKind::OpenWeatherMap => normalize_owm(raw, date)?,
        ProviderKind::Station => normalize_station(raw, date)?,
    };
    validate(&obs)?;
    Ok(obs)
}

fn validate(obs: &WeatherObservation) -> EngineResult<()> {
    let all = [
        obs.temp_min_c,
        obs.temp_max_c,
        obs.humidity_mean_pct,
        obs.wind_speed_kmh,
        obs.precip_mm,
    ];
    if all.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::Provider("non-finite value in payload".into()));
    }
    if obs.temp_min_c > obs.temp_max_c {
        return Err(EngineError::Provider(format!(
            "temp_min {:.1} exceeds temp_max {:.1}",
            obs.temp_min_c, obs.temp_max_c
        )));
    }
    if !(0.0..=100.0).contains(&obs.humidity_mean_pct) {
        return Err(EngineError::Provider(format!(
            "humidity {:.1}% out of range [0, 100]",
            obs.humidity_mean_pct
        )));
    }
    if obs.wind_speed_kmh < 0.0 {
        return Err(EngineError::Provider(format!(
            "negative wind speed {:.1}",
            obs.wind_speed_kmh
        )));
    }
    if obs.precip_mm < 0.0 {
        return Err(EngineError::Provider(format!(
            "negative precipitation {:.1}",
            obs.precip_mm
        )));
    }
    if let SolarInput::Measured(rs) = obs.solar {
        if !rs.is_finite() || rs < 0.0 {
            return Err(EngineError::Provider(format!("invalid solar radiation {rs}")));
        }
    }
    Ok(())
}

/// Relative humidity (%) implied by a dew point at the given air temperature.
fn humidity_from_dew_point(dew_point_c: f64, temp_c: f64) -> f64 {
    let rh = 100.0 * saturation_vapour_pressure(dew_point_c) / saturation_vapour_pressure(temp_c);
    rh.clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// OpenWeatherMap One Call 3.0 (units=metric)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OwmOneCall {
    #[serde(default)]
    timezone_offset: i32,
    #[serde(default)]
    current: Option<OwmCurrent>,
    #[serde(default)]
    daily: Vec<OwmDaily>,
}

#[derive(Debug, Deserialize)]
struct OwmCurrent {
    #[serde(default)]
    humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmDaily {
    dt: i64,
    #[serde(default)]
    temp: Option<OwmDailyTemp>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    dew_point: Option<f64>,
    /// m/s in metric units.
    #[serde(default)]
    wind_speed: Option<f64>,
    #[serde(default)]
    clouds: Option<f64>,
    #[serde(default)]
    rain: Option<f64>,
    #[serde(default)]
    snow: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmDailyTemp {
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
}

fn normalize_owm(raw: &Value, date: Date) -> EngineResult<WeatherObservation> {
    let payload: OwmOneCall = from_payload(raw)?;
    let offset = owm_offset(&payload)?;
    owm_observation(&payload, offset, date)
}

fn owm_offset(payload: &OwmOneCall) -> EngineResult<UtcOffset> {
    UtcOffset::from_whole_seconds(payload.timezone_offset)
        .map_err(|e| EngineError::Provider(format!("bad timezone_offset: {e}")))
}

/// Local calendar date of a daily entry's timestamp.
fn owm_local_date(dt: i64, offset: UtcOffset) -> Option<Date> {
    OffsetDateTime::from_unix_timestamp(dt)
        .ok()
        .map(|t| t.to_offset(offset).date())
}

fn owm_observation(payload: &OwmOneCall, offset: UtcOffset, date: Date) -> EngineResult<WeatherObservation> {
    let day = payload
        .daily
        .iter()
        .find(|d| owm_local_date(d.dt, offset) == Some(date))
        .ok_or_else(|| EngineError::DataIncomplete(format!("no daily entry for {date}")))?;

    let (temp_min_c, temp_max_c) = match &day.temp {
        Some(OwmDailyTemp {
            min: Some(min),
            max: Some(max),
        }) => (*min, *max),
        _ => return Err(EngineError::DataIncomplete("temperature range".into())),
    };

    let humidity_mean_pct = day
        .humidity
        .or_else(|| payload.current.as_ref().and_then(|c| c.humidity))
        .or_else(|| {
            day.dew_point
                .map(|dp| humidity_from_dew_point(dp, (temp_min_c + temp_max_c) / 2.0))
        })
        .ok_or_else(|| EngineError::DataIncomplete("humidity".into()))?;

    let wind_speed_kmh = day
        .wind_speed
        .map(|ms| ms * 3.6)
        .unwrap_or(DEFAULT_WIND_KMH);

    let solar = day
        .clouds
        .map(SolarInput::CloudCover)
        .unwrap_or(SolarInput::Unavailable);

    Ok(WeatherObservation {
        date,
        temp_min_c,
        temp_max_c,
        humidity_mean_pct,
        wind_speed_kmh,
        solar,
        precip_mm: day.rain.unwrap_or(0.0) + day.snow.unwrap_or(0.0),
    })
}

/// Upcoming days carried by the payload after `after`, at most `days` of
/// them, each normalized like an observed day. Entries that fail
/// normalization are left out. Station reports carry no forecast.
pub fn forecast(raw: &Value, kind: ProviderKind, after: Date, days: usize) -> Vec<WeatherObservation> {
    if kind != ProviderKind::OpenWeatherMap {
        return Vec::new();
    }
    let Ok(payload) = from_payload::<OwmOneCall>(raw) else {
        return Vec::new();
    };
    let Ok(offset) = owm_offset(&payload) else {
        return Vec::new();
    };

    let mut dates: Vec<Date> = payload
        .daily
        .iter()
        .filter_map(|d| owm_local_date(d.dt, offset))
        .filter(|d| *d > after)
        .collect();
    dates.sort();
    dates.dedup();

    dates
        .into_iter()
        .take(days)
        .filter_map(|date| {
            let obs = owm_observation(&payload, offset, date).ok()?;
            validate(&obs).ok()?;
            Some(obs)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Generic weather station report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StationUnits {
    /// degC, km/h, mm, MJ/m^2/day
    #[default]
    Metric,
    /// degF, mph, inches, W/m^2 daily mean
    Imperial,
}

#[derive(Debug, Deserialize)]
struct StationReport {
    #[serde(default)]
    date: Option<Date>,
    #[serde(default)]
    units: StationUnits,
    #[serde(default)]
    temp_min: Option<f64>,
    #[serde(default)]
    temp_max: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    dew_point: Option<f64>,
    #[serde(default)]
    wind_speed: Option<f64>,
    #[serde(default)]
    solar_radiation: Option<f64>,
    #[serde(default)]
    cloud_cover: Option<f64>,
    #[serde(default)]
    precipitation: Option<f64>,
}

fn normalize_station(raw: &Value, date: Date) -> EngineResult<WeatherObservation> {
    let report: StationReport = from_payload(raw)?;

    if let Some(reported) = report.date {
        if reported != date {
            return Err(EngineError::Provider(format!(
                "station report is for {reported}, expected {date}"
            )));
        }
    }

    let imperial = matches!(report.units, StationUnits::Imperial);
    let temp = |v: f64| if imperial { (v - 32.0) * 5.0 / 9.0 } else { v };

    let (temp_min_c, temp_max_c) = match (report.temp_min, report.temp_max) {
        (Some(min), Some(max)) => (temp(min), temp(max)),
        _ => return Err(EngineError::DataIncomplete("temperature range".into())),
    };

    let humidity_mean_pct = report
        .humidity
        .or_else(|| {
            report
                .dew_point
                .map(|dp| humidity_from_dew_point(temp(dp), (temp_min_c + temp_max_c) / 2.0))
        })
        .ok_or_else(|| EngineError::DataIncomplete("humidity".into()))?;

    let wind_speed_kmh = report
        .wind_speed
        .map(|w| if imperial { w * 1.609_344 } else { w })
        .unwrap_or(DEFAULT_WIND_KMH);

    let solar = match (report.solar_radiation, report.cloud_cover) {
        // W/m^2 averaged over 24 h -> MJ/m^2/day
        (Some(rs), _) if imperial => SolarInput::Measured(rs * 0.0864),
        (Some(rs), _) => SolarInput::Measured(rs),
        (None, Some(cc)) => SolarInput::CloudCover(cc),
        (None, None) => SolarInput::Unavailable,
    };

    let precip_mm = report
        .precipitation
        .map(|p| if imperial { p * 25.4 } else { p })
        .unwrap_or(0.0);

    Ok(WeatherObservation {
        date,
        temp_min_c,
        temp_max_c,
        humidity_mean_pct,
        wind_speed_kmh,
        solar,
        precip_mm,
    })
}

/// Deserialize a borrowed payload into a provider model; shape errors map
/// onto `Provider`.
fn from_payload<T: DeserializeOwned>(raw: &Value) -> EngineResult<T> {
    T::deserialize(raw).map_err(|e| EngineError::Provider(format!("malformed payload: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::date;

    fn owm_payload() -> Value {
        // 2024-06-01 12:00 UTC and 2024-06-02 12:00 UTC
        json!({
            "lat": 39.85,
            "lon": -75.78,
            "timezone_offset": -14400,
            "current": { "temp": 22.0, "humidity": 61 },
            "daily": [
                {
                    "dt": 1717243200,
                    "temp": { "day": 24.0, "min": 14.0, "max": 28.0 },
                    "humidity": 55,
                    "dew_point": 12.0,
                    "wind_speed": 3.0,
                    "clouds": 20,
                    "rain": 1.5
                },
                {
                    "dt": 1717329600,
                    "temp": { "day": 20.0, "min": 12.0, "max": 22.0 },
                    "humidity": 80,
                    "wind_speed": 5.0,
                    "clouds": 90,
                    "rain": 10.0,
                    "snow": 0.5
                }
            ]
        })
    }

    // -- OpenWeatherMap ------------------------------------------------------

    #[test]
    fn owm_picks_first_day_and_converts_units() {
        let obs = normalize(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap();
        assert_eq!(obs.date, date!(2024 - 06 - 01));
        assert_eq!(obs.temp_min_c, 14.0);
        assert_eq!(obs.temp_max_c, 28.0);
        assert_eq!(obs.humidity_mean_pct, 55.0);
        assert!((obs.wind_speed_kmh - 10.8).abs() < 1e-9);
        assert_eq!(obs.solar, SolarInput::CloudCover(20.0));
        assert_eq!(obs.precip_mm, 1.5);
    }

    #[test]
    fn owm_picks_entry_matching_requested_date() {
        let obs = normalize(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 06 - 02)).unwrap();
        assert_eq!(obs.temp_max_c, 22.0);
        assert_eq!(obs.precip_mm, 10.5);
    }

    #[test]
    fn owm_without_entry_for_date_is_incomplete() {
        let err = normalize(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 07 - 01)).unwrap_err();
        match err {
            EngineError::DataIncomplete(msg) => assert!(msg.contains("2024-07-01"), "{msg}"),
            other => panic!("expected DataIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn forecast_lists_days_after_today() {
        let days = forecast(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01), 7);
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].date, date!(2024 - 06 - 02));
        assert_eq!(days[0].temp_max_c, 22.0);
        assert_eq!(days[0].precip_mm, 10.5);
    }

    #[test]
    fn forecast_is_bounded_and_skips_bad_days() {
        let mut p = owm_payload();
        p["daily"][1].as_object_mut().unwrap().remove("temp");
        assert!(forecast(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01), 7).is_empty());

        let all = forecast(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 05 - 31), 1);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].date, date!(2024 - 06 - 01));
    }

    #[test]
    fn station_reports_have_no_forecast() {
        let report = json!({ "temp_min": 10, "temp_max": 20, "humidity": 50 });
        assert!(forecast(&report, ProviderKind::Station, date!(2024 - 06 - 01), 7).is_empty());
    }

    #[test]
    fn owm_humidity_falls_back_to_current() {
        let mut p = owm_payload();
        p["daily"][0].as_object_mut().unwrap().remove("humidity");
        let obs = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap();
        assert_eq!(obs.humidity_mean_pct, 61.0);
    }

    #[test]
    fn owm_humidity_approximated_from_dew_point() {
        let mut p = owm_payload();
        p["daily"][0].as_object_mut().unwrap().remove("humidity");
        p.as_object_mut().unwrap().remove("current");
        let obs = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap();
        // dew point 12 degC at a 21 degC mean is roughly 56% RH
        assert!((obs.humidity_mean_pct - 56.0).abs() < 2.0, "{}", obs.humidity_mean_pct);
    }

    #[test]
    fn owm_missing_humidity_everywhere_is_incomplete() {
        let mut p = owm_payload();
        let day = p["daily"][0].as_object_mut().unwrap();
        day.remove("humidity");
        day.remove("dew_point");
        p.as_object_mut().unwrap().remove("current");
        let err = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::DataIncomplete(ref f) if f == "humidity"));
    }

    #[test]
    fn owm_missing_temperature_is_incomplete() {
        let mut p = owm_payload();
        p["daily"][0]["temp"].as_object_mut().unwrap().remove("min");
        let err = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::DataIncomplete(_)));
    }

    #[test]
    fn owm_empty_daily_is_incomplete() {
        let p = json!({ "daily": [] });
        let err = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::DataIncomplete(_)));
    }

    #[test]
    fn owm_malformed_payload_is_provider_error() {
        let p = json!({ "daily": "not a list" });
        let err = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[test]
    fn owm_missing_wind_uses_default() {
        let mut p = owm_payload();
        p["daily"][0].as_object_mut().unwrap().remove("wind_speed");
        let obs = normalize(&p, ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap();
        assert_eq!(obs.wind_speed_kmh, DEFAULT_WIND_KMH);
    }

    #[test]
    fn normalization_is_deterministic() {
        let a = normalize(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap();
        let b = normalize(&owm_payload(), ProviderKind::OpenWeatherMap, date!(2024 - 06 - 01)).unwrap();
        assert_eq!(a, b);
    }

    // -- Station -------------------------------------------------------------

    #[test]
    fn station_metric_with_measured_radiation() {
        let p = json!({
            "date": "2024-06-01",
            "temp_min": 12.3,
            "temp_max": 21.5,
            "humidity": 73.5,
            "wind_speed": 7.5,
            "solar_radiation": 22.07,
            "precipitation": 0.0
        });
        let obs = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap();
        assert_eq!(obs.solar, SolarInput::Measured(22.07));
        assert_eq!(obs.wind_speed_kmh, 7.5);
    }

    #[test]
    fn station_imperial_units_are_converted() {
        let p = json!({
            "units": "imperial",
            "temp_min": 50.0,
            "temp_max": 86.0,
            "humidity": 60,
            "wind_speed": 10.0,
            "solar_radiation": 250.0,
            "precipitation": 0.5
        });
        let obs = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap();
        assert!((obs.temp_min_c - 10.0).abs() < 1e-9);
        assert!((obs.temp_max_c - 30.0).abs() < 1e-9);
        assert!((obs.wind_speed_kmh - 16.09344).abs() < 1e-9);
        assert!((obs.precip_mm - 12.7).abs() < 1e-9);
        assert_eq!(obs.solar, SolarInput::Measured(250.0 * 0.0864));
    }

    #[test]
    fn station_cloud_cover_is_a_proxy() {
        let p = json!({ "temp_min": 10, "temp_max": 20, "humidity": 50, "cloud_cover": 40 });
        let obs = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap();
        assert_eq!(obs.solar, SolarInput::CloudCover(40.0));
        assert!(!obs.solar.is_measured());
        assert_eq!(obs.precip_mm, 0.0);
    }

    #[test]
    fn station_wrong_date_rejected() {
        let p = json!({ "date": "2024-05-31", "temp_min": 10, "temp_max": 20, "humidity": 50 });
        let err = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[test]
    fn station_single_temperature_is_incomplete() {
        let p = json!({ "temp_max": 20, "humidity": 50 });
        let err = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::DataIncomplete(_)));
    }

    #[test]
    fn inverted_temperature_range_rejected() {
        let p = json!({ "temp_min": 25, "temp_max": 20, "humidity": 50 });
        let err = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[test]
    fn humidity_out_of_range_rejected() {
        let p = json!({ "temp_min": 10, "temp_max": 20, "humidity": 140 });
        let err = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[test]
    fn negative_precipitation_rejected() {
        let p = json!({ "temp_min": 10, "temp_max": 20, "humidity": 50, "precipitation": -1 });
        let err = normalize(&p, ProviderKind::Station, date!(2024 - 06 - 01)).unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }
}

//! Reference (ET0) and crop (ETc) evapotranspiration.
//!
//! Formulas follow FAO Irrigation and Drainage Paper 56 (Allen et al., 1998):
//!
//! - Hargreaves-Samani (eq. 52) when radiation is only a proxy or missing,
//! - Penman-Monteith (eq. 6, daily step, soil heat flux G = 0) when measured
//!   solar radiation is supplied.
//!
//! Everything in here is pure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::Date;

use crate::budget::Zone;
use crate::error::{EngineError, EngineResult};
use crate::weather::{SolarInput, WeatherObservation};

/// Upper clamp on daily ET0; anything above is a data problem, not weather.
pub const MAX_ET0_MM: f64 = 15.0;

/// MJ m^-2 min^-1
const SOLAR_CONSTANT: f64 = 0.0820;
/// MJ K^-4 m^-2 day^-1
const STEFAN_BOLTZMANN: f64 = 4.903e-9;
/// Radiation adjustment coefficient for interior locations (FAO-56 eq. 50).
const HARGREAVES_KRS: f64 = 0.16;

/// Configured method. `Auto` uses Penman-Monteith only when the observation
/// carries measured radiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtMethod {
    #[default]
    Auto,
    Hargreaves,
    PenmanMonteith,
}

/// The formula that actually produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Et0Formula {
    Hargreaves,
    PenmanMonteith,
}

impl Et0Formula {
    pub fn as_str(&self) -> &'static str {
        match self {
            Et0Formula::Hargreaves => "hargreaves",
            Et0Formula::PenmanMonteith => "penman_monteith",
        }
    }
}

/// Static facts about the property needed by the formulas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub latitude: f64,
    pub elevation_m: f64,
    /// Anemometer height of the provider's wind figure.
    pub wind_height_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Et0 {
    pub mm: f64,
    pub formula: Et0Formula,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtRecord {
    pub date: Date,
    pub et0_mm: f64,
    pub formula: Et0Formula,
    pub per_zone: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// Saturation vapour pressure e°(T) in kPa (FAO-56 eq. 11).
pub fn saturation_vapour_pressure(temp_c: f64) -> f64 {
    0.6108 * ((17.27 * temp_c) / (temp_c + 237.3)).exp()
}

/// Extraterrestrial radiation Ra in MJ/m^2/day (FAO-56 eq. 21).
pub fn extraterrestrial_radiation(latitude_deg: f64, day_of_year: u16) -> f64 {
    let j = f64::from(day_of_year);
    let phi = latitude_deg.to_radians();
    let dr = 1.0 + 0.033 * (2.0 * std::f64::consts::PI * j / 365.0).cos();
    let decl = 0.409 * (2.0 * std::f64::consts::PI * j / 365.0 - 1.39).sin();
    // Clamped so polar day/night don't take acos out of its domain.
    let ws = (-phi.tan() * decl.tan()).clamp(-1.0, 1.0).acos();

    let ra = (24.0 * 60.0 / std::f64::consts::PI)
        * SOLAR_CONSTANT
        * dr
        * (ws * phi.sin() * decl.sin() + phi.cos() * decl.cos() * ws.sin());
    ra.max(0.0)
}

/// Wind speed at 2 m from a reading taken at `height_m` (FAO-56 eq. 47).
pub fn wind_at_2m(speed_ms: f64, height_m: f64) -> f64 {
    speed_ms * 4.87 / (67.8 * height_m - 5.42).ln()
}

fn clamp_et0(mm: f64) -> f64 {
    if mm.is_finite() {
        mm.clamp(0.0, MAX_ET0_MM)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// ET0
// ---------------------------------------------------------------------------

pub fn compute_et0(obs: &WeatherObservation, site: &Site, method: EtMethod) -> Et0 {
    let ra = extraterrestrial_radiation(site.latitude, obs.date.ordinal());

    let formula = match method {
        EtMethod::Hargreaves => Et0Formula::Hargreaves,
        EtMethod::PenmanMonteith => Et0Formula::PenmanMonteith,
        EtMethod::Auto if obs.solar.is_measured() => Et0Formula::PenmanMonteith,
        EtMethod::Auto => Et0Formula::Hargreaves,
    };

    let mm = match formula {
        Et0Formula::Hargreaves => hargreaves(obs, ra),
        Et0Formula::PenmanMonteith => penman_monteith(obs, site, ra),
    };

    Et0 {
        mm: clamp_et0(mm),
        formula,
    }
}

/// Hargreaves-Samani; driven by the temperature range, monotonic in it.
fn hargreaves(obs: &WeatherObservation, ra: f64) -> f64 {
    0.0023 * (obs.temp_mean_c() + 17.8) * obs.temp_range_c().sqrt() * 0.408 * ra
}

/// Global radiation Rs, measured when available, otherwise estimated.
fn solar_radiation(obs: &WeatherObservation, ra: f64) -> f64 {
    match obs.solar {
        SolarInput::Measured(rs) => rs,
        // Angstrom (eq. 35) with n/N approximated by the clear-sky fraction.
        SolarInput::CloudCover(pct) => {
            let sunshine = 1.0 - (pct / 100.0).clamp(0.0, 1.0);
            (0.25 + 0.50 * sunshine) * ra
        }
        SolarInput::Unavailable => HARGREAVES_KRS * obs.temp_range_c().sqrt() * ra,
    }
}

fn penman_monteith(obs: &WeatherObservation, site: &Site, ra: f64) -> f64 {
    let t_mean = obs.temp_mean_c();
    let e_mean = saturation_vapour_pressure(t_mean);
    let delta = 4098.0 * e_mean / (t_mean + 237.3).powi(2);

    let pressure = 101.3 * ((293.0 - 0.0065 * site.elevation_m) / 293.0).powf(5.26);
    let gamma = 0.000665 * pressure;

    let es = (saturation_vapour_pressure(obs.temp_max_c) + saturation_vapour_pressure(obs.temp_min_c)) / 2.0;
    let ea = es * obs.humidity_mean_pct / 100.0;

    let u2 = wind_at_2m(obs.wind_speed_kmh / 3.6, site.wind_height_m);

    let rs = solar_radiation(obs, ra);
    let rso = (0.75 + 2e-5 * site.elevation_m) * ra;
    let rs_rso = if rso > 0.0 { (rs / rso).min(1.0) } else { 1.0 };

    let rns = 0.77 * rs;
    let tmax_k = obs.temp_max_c + 273.16;
    let tmin_k = obs.temp_min_c + 273.16;
    let rnl = STEFAN_BOLTZMANN
        * ((tmax_k.powi(4) + tmin_k.powi(4)) / 2.0)
        * (0.34 - 0.14 * ea.max(0.0).sqrt())
        * (1.35 * rs_rso - 0.35);
    let rn = rns - rnl;

    let numerator = 0.408 * delta * rn + gamma * (900.0 / (t_mean + 273.0)) * u2 * (es - ea);
    let denominator = delta + gamma * (1.0 + 0.34 * u2);
    numerator / denominator
}

// ---------------------------------------------------------------------------
// ETc
// ---------------------------------------------------------------------------

/// Crop coefficient for a named planting type.
pub fn crop_coefficient_preset(zone_type: &str) -> Option<f64> {
    match zone_type.trim().to_ascii_lowercase().as_str() {
        "lawn" => Some(0.8),
        "garden" => Some(1.0),
        "drip" => Some(0.6),
        "flowers" => Some(0.7),
        "trees" => Some(0.5),
        _ => None,
    }
}

pub fn compute_etc(et0_mm: f64, zone: &Zone) -> EngineResult<f64> {
    if !(zone.crop_coefficient > 0.0) {
        return Err(EngineError::Configuration(format!(
            "zone '{}': crop_coefficient must be positive, got {}",
            zone.zone_id, zone.crop_coefficient
        )));
    }
    Ok(et0_mm * zone.crop_coefficient)
}

impl EtRecord {
    /// Compute the day's record for every enabled zone. Zones with bad
    /// configuration are left out of `per_zone` and returned alongside.
    pub fn build(
        obs: &WeatherObservation,
        site: &Site,
        method: EtMethod,
        zones: &[Zone],
    ) -> (Self, Vec<(String, EngineError)>) {
        let et0 = compute_et0(obs, site, method);
        let mut per_zone = BTreeMap::new();
        let mut failures = Vec::new();

        for zone in zones.iter().filter(|z| z.enabled) {
            match compute_etc(et0.mm, zone) {
                Ok(etc) => {
                    per_zone.insert(zone.zone_id.clone(), etc);
                }
                Err(e) => failures.push((zone.zone_id.clone(), e)),
            }
        }

        let record = Self {
            date: obs.date,
            et0_mm: et0.mm,
            formula: et0.formula,
            per_zone,
        };
        (record, failures)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

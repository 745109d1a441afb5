//! TOML config file loading, validation, and database seeding for zones.
//!
//! ```toml
//! [property]
//! latitude = 45.52
//! longitude = -122.68
//! elevation_m = 50
//! utc_offset_hours = -7
//!
//! [weather]
//! provider = "openweathermap"     # or "station" (MQTT tele/<station_id>/weather)
//! et_method = "auto"              # auto | hargreaves | penman_monteith
//!
//! [schedule]
//! run_at = "06:00"
//! max_run_min = 60
//!
//! [[zones]]
//! zone_id = "front"
//! name = "Front lawn"
//! zone_type = "lawn"
//! available_water_capacity_mm = 25
//! precipitation_rate_mm_per_min = 0.5
//! area_m2 = 40
//! days = ["mon", "wed", "fri"]
//! valve_gpio_pin = 17
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::macros::format_description;
use time::{Time, UtcOffset};

use crate::budget::{parse_weekday, Zone};
use crate::db::Db;
use crate::et::{crop_coefficient_preset, EtMethod, Site};
use crate::provider::Location;
use crate::scheduler::{BusyPolicy, Settings};
use crate::weather::ProviderKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub property: PropertySection,
    #[serde(default)]
    pub weather: WeatherSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub valves: ValveSection,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertySection {
    #[serde(default = "default_name")]
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation_m: f64,
    #[serde(default)]
    pub utc_offset_hours: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherSection {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    /// Falls back to the OWM_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub station_id: Option<String>,
    /// Anemometer height of the provider's wind speed.
    #[serde(default = "default_wind_height")]
    pub wind_height_m: f64,
    #[serde(default)]
    pub et_method: EtMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    #[serde(default = "default_run_at")]
    pub run_at: String,
    #[serde(default = "default_max_run_min")]
    pub max_run_min: u32,
    #[serde(default = "default_test_run_min")]
    pub test_run_min: u32,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    /// Added to a run's duration to form its timeout.
    #[serde(default = "default_run_timeout_slack_min")]
    pub run_timeout_slack_min: u32,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveDriver {
    #[default]
    Gpio,
    Mqtt,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValveSection {
    #[serde(default)]
    pub driver: ValveDriver,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    /// lawn | garden | drip | flowers | trees
    #[serde(default)]
    pub zone_type: Option<String>,
    /// Overrides the `zone_type` preset.
    #[serde(default)]
    pub crop_coefficient: Option<f64>,
    pub available_water_capacity_mm: f64,
    #[serde(default = "default_allowable_depletion")]
    pub allowable_depletion: f64,
    pub precipitation_rate_mm_per_min: f64,
    pub area_m2: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_days")]
    pub days: Vec<String>,
    #[serde(default)]
    pub valve_gpio_pin: Option<i64>,
}

fn default_name() -> String {
    "EnviroDrip".into()
}
fn default_provider() -> ProviderKind {
    ProviderKind::OpenWeatherMap
}
fn default_wind_height() -> f64 {
    10.0
}
fn default_run_at() -> String {
    "06:00".into()
}
fn default_max_run_min() -> u32 {
    60
}
fn default_test_run_min() -> u32 {
    1
}
fn default_max_concurrent_runs() -> u32 {
    1
}
fn default_run_timeout_slack_min() -> u32 {
    5
}
fn default_allowable_depletion() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_days() -> Vec<String> {
    vec!["mon".into(), "wed".into(), "fri".into()]
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            station_id: None,
            wind_height_m: default_wind_height(),
            et_method: EtMethod::default(),
        }
    }
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            run_at: default_run_at(),
            max_run_min: default_max_run_min(),
            test_run_min: default_test_run_min(),
            max_concurrent_runs: default_max_concurrent_runs(),
            run_timeout_slack_min: default_run_timeout_slack_min(),
            busy_policy: BusyPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Longest single run the hub will ever command.
const MAX_RUN_MIN_LIMIT: u32 = 240;

fn parse_run_at(s: &str) -> Result<Time> {
    Time::parse(s.trim(), format_description!("[hour]:[minute]"))
        .with_context(|| format!("run_at '{s}' is not HH:MM"))
}

fn utc_offset(hours: f64) -> Result<UtcOffset> {
    let secs = (hours * 3600.0).round() as i32;
    UtcOffset::from_whole_seconds(secs).with_context(|| format!("utc_offset_hours {hours} out of range"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_property(&mut errors);
        self.validate_weather(&mut errors);
        self.validate_schedule(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_property(&self, errors: &mut Vec<String>) {
        let p = &self.property;
        if !(-90.0..=90.0).contains(&p.latitude) {
            errors.push(format!("property: latitude {} out of range [-90, 90]", p.latitude));
        }
        if !(-180.0..=180.0).contains(&p.longitude) {
            errors.push(format!("property: longitude {} out of range [-180, 180]", p.longitude));
        }
        if !(-500.0..=9000.0).contains(&p.elevation_m) {
            errors.push(format!("property: elevation_m {} out of range [-500, 9000]", p.elevation_m));
        }
        if !(-14.0..=14.0).contains(&p.utc_offset_hours) {
            errors.push(format!(
                "property: utc_offset_hours {} out of range [-14, 14]",
                p.utc_offset_hours
            ));
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let w = &self.weather;
        match w.provider {
            ProviderKind::OpenWeatherMap => {
                if w.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                    errors.push(
                        "weather: openweathermap needs api_key (or OWM_API_KEY in the environment)"
                            .into(),
                    );
                }
            }
            ProviderKind::Station => {
                if w.station_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    errors.push("weather: station provider needs station_id".into());
                }
            }
        }
        if !(w.wind_height_m >= 0.5) {
            errors.push(format!("weather: wind_height_m must be at least 0.5, got {}", w.wind_height_m));
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let s = &self.schedule;
        if let Err(e) = parse_run_at(&s.run_at) {
            errors.push(format!("schedule: {e}"));
        }
        if s.max_run_min == 0 || s.max_run_min > MAX_RUN_MIN_LIMIT {
            errors.push(format!(
                "schedule: max_run_min {} out of range [1, {MAX_RUN_MIN_LIMIT}]",
                s.max_run_min
            ));
        }
        if s.test_run_min == 0 || s.test_run_min > s.max_run_min {
            errors.push(format!(
                "schedule: test_run_min {} must be between 1 and max_run_min ({})",
                s.test_run_min, s.max_run_min
            ));
        }
        if s.max_concurrent_runs == 0 {
            errors.push("schedule: max_concurrent_runs must be at least 1".into());
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }
            // zone ids become MQTT topic segments
            if z.zone_id.contains(['/', '+', '#']) {
                errors.push(format!("{}: zone_id may not contain '/', '+' or '#'", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Crop coefficient ────────────────────────────────
            match (z.crop_coefficient, z.zone_type.as_deref()) {
                (Some(kc), _) if !(kc > 0.0 && kc <= 2.0) => {
                    errors.push(format!(
                        "{}: crop_coefficient {kc} out of range (0, 2]",
                        ctx()
                    ));
                }
                (Some(_), _) => {}
                (None, Some(t)) if crop_coefficient_preset(t).is_none() => {
                    errors.push(format!(
                        "{}: unknown zone_type '{t}' (lawn, garden, drip, flowers, trees)",
                        ctx()
                    ));
                }
                (None, Some(_)) => {}
                (None, None) => {
                    errors.push(format!("{}: needs zone_type or crop_coefficient", ctx()));
                }
            }

            // ── Water balance parameters ────────────────────────
            if !(z.available_water_capacity_mm > 0.0) {
                errors.push(format!(
                    "{}: available_water_capacity_mm must be positive, got {}",
                    ctx(),
                    z.available_water_capacity_mm
                ));
            }
            if !(z.allowable_depletion > 0.0 && z.allowable_depletion <= 1.0) {
                errors.push(format!(
                    "{}: allowable_depletion {} out of range (0, 1]",
                    ctx(),
                    z.allowable_depletion
                ));
            }
            if !(z.precipitation_rate_mm_per_min > 0.0) {
                errors.push(format!(
                    "{}: precipitation_rate_mm_per_min must be positive, got {}",
                    ctx(),
                    z.precipitation_rate_mm_per_min
                ));
            }
            if !(z.area_m2 > 0.0) {
                errors.push(format!("{}: area_m2 must be positive, got {}", ctx(), z.area_m2));
            }

            // ── Watering days ───────────────────────────────────
            for d in &z.days {
                if parse_weekday(d).is_none() {
                    errors.push(format!("{}: unknown day '{d}'", ctx()));
                }
            }

            // ── GPIO pin whitelist ──────────────────────────────
            match z.valve_gpio_pin {
                None if self.valves.driver == ValveDriver::Gpio => {
                    errors.push(format!("{}: valve_gpio_pin is required with the gpio driver", ctx()));
                }
                None => {}
                Some(pin) if !VALID_GPIO_PINS.contains(&pin) => {
                    errors.push(format!(
                        "{}: valve_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx(),
                        pin
                    ));
                }
                Some(pin) => {
                    if !seen_pins.insert(pin) {
                        errors.push(format!(
                            "{}: valve_gpio_pin {} is already used by another zone",
                            ctx(),
                            pin
                        ));
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived values (only meaningful after validate())
    // -----------------------------------------------------------------------

    pub fn site(&self) -> Site {
        Site {
            latitude: self.property.latitude,
            elevation_m: self.property.elevation_m,
            wind_height_m: self.weather.wind_height_m,
        }
    }

    pub fn location(&self) -> Location {
        Location {
            latitude: self.property.latitude,
            longitude: self.property.longitude,
        }
    }

    pub fn settings(&self) -> Result<Settings> {
        let s = &self.schedule;
        Ok(Settings {
            site: self.site(),
            location: self.location(),
            method: self.weather.et_method,
            offset: utc_offset(self.property.utc_offset_hours)?,
            run_at: parse_run_at(&s.run_at)?,
            max_run_min: s.max_run_min,
            test_run_min: s.test_run_min,
            max_concurrent_runs: s.max_concurrent_runs.max(1) as usize,
            run_timeout_slack: Duration::from_secs(u64::from(s.run_timeout_slack_min) * 60),
            busy_policy: s.busy_policy,
        })
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.zones
            .iter()
            .map(|z| Zone {
                zone_id: z.zone_id.clone(),
                name: z.name.clone(),
                crop_coefficient: z
                    .crop_coefficient
                    .or_else(|| z.zone_type.as_deref().and_then(crop_coefficient_preset))
                    .unwrap_or(0.0),
                available_water_capacity_mm: z.available_water_capacity_mm,
                allowable_depletion: z.allowable_depletion,
                precipitation_rate_mm_per_min: z.precipitation_rate_mm_per_min,
                area_m2: z.area_m2,
                enabled: z.enabled,
                watering_days: z.days.iter().filter_map(|d| parse_weekday(d)).collect(),
                valve_gpio_pin: z.valve_gpio_pin.and_then(|p| u8::try_from(p).ok()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    if config.weather.api_key.is_none() {
        config.weather.api_key = std::env::var("OWM_API_KEY").ok();
    }
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all zones from the config into the database and drop zones no
/// longer in the file (their budgets go with them).
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let zones = config.zones();
    for z in &zones {
        db.upsert_zone(z)
            .await
            .with_context(|| format!("failed to upsert zone '{}'", z.zone_id))?;
    }

    let keep: Vec<String> = zones.iter().map(|z| z.zone_id.clone()).collect();
    let removed = db
        .delete_zones_not_in(&keep)
        .await
        .context("failed to remove stale zones")?;
    for zone_id in &removed {
        tracing::info!(zone = %zone_id, "zone removed from config");
    }

    tracing::info!(zones = zones.len(), removed = removed.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

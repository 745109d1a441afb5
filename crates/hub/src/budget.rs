//! Per-zone soil-moisture water budget.
//!
//! Each zone tracks a root-zone deficit in mm: ETc pushes it up, effective
//! rainfall and irrigation pull it back down. The deficit is bounded by the
//! zone's available water capacity (field capacity at 0, wilting side at
//! `available_water_capacity_mm`). Irrigation becomes due once the deficit
//! reaches `available_water_capacity_mm * allowable_depletion`.
//!
//! Status lifecycle:
//!
//!   BelowThreshold ──(deficit ≥ threshold)──▶ Due ──(dispatch)──▶ Running
//!         ▲                                                        │
//!         └──────────── Completed ◀───────────┬────────────────────┘
//!                                             └──▶ Failed (stays due)
//!
//! All functions here are pure: they take a budget by reference and return
//! the next one.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset, Weekday};

use crate::error::EngineError;

/// Deficits below this round to "nothing to do".
const DEFICIT_EPSILON_MM: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Zone configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub name: String,
    pub crop_coefficient: f64,
    pub available_water_capacity_mm: f64,
    /// Fraction (0-1] of the capacity that may be used before irrigating.
    pub allowable_depletion: f64,
    pub precipitation_rate_mm_per_min: f64,
    /// Area factor: litres = mm * m^2.
    pub area_m2: f64,
    pub enabled: bool,
    /// Empty means every day.
    pub watering_days: Vec<Weekday>,
    pub valve_gpio_pin: Option<u8>,
}

impl Zone {
    pub fn threshold_mm(&self) -> f64 {
        self.available_water_capacity_mm * self.allowable_depletion
    }

    pub fn waters_on(&self, date: Date) -> bool {
        self.watering_days.is_empty() || self.watering_days.contains(&date.weekday())
    }

    pub fn liters_for(&self, mm: f64) -> f64 {
        mm * self.area_m2
    }

    /// Checks the parameters the water balance depends on.
    pub fn check(&self) -> Result<(), BudgetError> {
        let invalid = |reason: String| BudgetError::InvalidZone {
            zone_id: self.zone_id.clone(),
            reason,
        };
        if !(self.available_water_capacity_mm > 0.0) {
            return Err(invalid(format!(
                "available_water_capacity_mm must be positive, got {}",
                self.available_water_capacity_mm
            )));
        }
        if !(self.allowable_depletion > 0.0 && self.allowable_depletion <= 1.0) {
            return Err(invalid(format!(
                "allowable_depletion must be in (0, 1], got {}",
                self.allowable_depletion
            )));
        }
        if !(self.precipitation_rate_mm_per_min > 0.0) {
            return Err(invalid(format!(
                "precipitation_rate_mm_per_min must be positive, got {}",
                self.precipitation_rate_mm_per_min
            )));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("zone '{zone_id}' already advanced through {last}, refusing {date}")]
    AlreadyAdvanced { zone_id: String, date: Date, last: Date },

    #[error("zone '{zone_id}': {reason}")]
    InvalidZone { zone_id: String, reason: String },
}

impl From<BudgetError> for EngineError {
    fn from(e: BudgetError) -> Self {
        EngineError::Configuration(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    BelowThreshold,
    Due,
    Running,
    Completed,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneBudget {
    pub zone_id: String,
    pub deficit_mm: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_eligible_at: Option<OffsetDateTime>,
    pub last_advanced_on: Option<Date>,
}

/// Result of one daily advancement.
#[derive(Debug, Clone, PartialEq)]
pub struct DayAdvance {
    pub budget: ZoneBudget,
    pub effective_rain_mm: f64,
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() {
        v.max(0.0)
    } else {
        0.0
    }
}

impl ZoneBudget {
    /// Fresh budget for a newly configured zone: soil at field capacity.
    pub fn new(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            deficit_mm: 0.0,
            last_run_at: None,
            next_eligible_at: None,
            last_advanced_on: None,
        }
    }

    pub fn advance_day(
        &self,
        zone: &Zone,
        date: Date,
        etc_mm: f64,
        precip_mm: f64,
    ) -> Result<DayAdvance, BudgetError> {
        if let Some(last) = self.last_advanced_on {
            if date <= last {
                return Err(BudgetError::AlreadyAdvanced {
                    zone_id: self.zone_id.clone(),
                    date,
                    last,
                });
            }
        }
        zone.check()?;

        let awc = zone.available_water_capacity_mm;
        let deficit = self.deficit_mm.clamp(0.0, awc);
        let effective = non_negative(precip_mm).min(awc - deficit);
        let next = (deficit + non_negative(etc_mm) - effective).clamp(0.0, awc);

        Ok(DayAdvance {
            budget: Self {
                deficit_mm: next,
                last_advanced_on: Some(date),
                ..self.clone()
            },
            effective_rain_mm: effective,
        })
    }

    pub fn is_due(&self, zone: &Zone) -> bool {
        self.deficit_mm > DEFICIT_EPSILON_MM && self.deficit_mm >= zone.threshold_mm()
    }

    /// Minutes needed to refill the root zone, capped at `max_run_min`.
    pub fn required_duration(&self, zone: &Zone, max_run_min: u32) -> u32 {
        if self.deficit_mm <= DEFICIT_EPSILON_MM || !(zone.precipitation_rate_mm_per_min > 0.0) {
            return 0;
        }
        // Nudge down so 16.0 / 2.0 landing on 8.000000001 stays 8.
        let minutes = (self.deficit_mm / zone.precipitation_rate_mm_per_min - 1e-9).ceil();
        if minutes >= f64::from(max_run_min) {
            max_run_min
        } else {
            minutes.max(0.0) as u32
        }
    }

    pub fn record_run(&self, water_applied_mm: f64, at: OffsetDateTime) -> Self {
        Self {
            deficit_mm: (self.deficit_mm - non_negative(water_applied_mm)).max(0.0),
            last_run_at: Some(at),
            ..self.clone()
        }
    }

    /// Deficit relative to the zone's threshold; used to order dispatch.
    pub fn deficit_fraction(&self, zone: &Zone) -> f64 {
        let threshold = zone.threshold_mm();
        if threshold > 0.0 {
            self.deficit_mm / threshold
        } else {
            0.0
        }
    }

    pub fn eligible_at(&self, now: OffsetDateTime) -> bool {
        self.next_eligible_at.map_or(true, |t| t <= now)
    }

    pub fn status(&self, zone: &Zone) -> ZoneStatus {
        if !zone.enabled {
            ZoneStatus::Disabled
        } else if self.is_due(zone) {
            ZoneStatus::Due
        } else {
            ZoneStatus::BelowThreshold
        }
    }
}

/// Accepts "mon" or "monday" in any case.
pub fn parse_weekday(s: &str) -> Option<Weekday> {
    let s = s.trim().to_ascii_lowercase();
    let day = match s.get(..3)? {
        "mon" => Weekday::Monday,
        "tue" => Weekday::Tuesday,
        "wed" => Weekday::Wednesday,
        "thu" => Weekday::Thursday,
        "fri" => Weekday::Friday,
        "sat" => Weekday::Saturday,
        "sun" => Weekday::Sunday,
        _ => return None,
    };
    let full = day.to_string().to_ascii_lowercase();
    (s.len() == 3 || s == full).then_some(day)
}

pub fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "mon",
        Weekday::Tuesday => "tue",
        Weekday::Wednesday => "wed",
        Weekday::Thursday => "thu",
        Weekday::Friday => "fri",
        Weekday::Saturday => "sat",
        Weekday::Sunday => "sun",
    }
}

/// Next allowed weekday at `run_at` local time strictly after `after`.
pub fn next_watering_slot(
    days: &[Weekday],
    run_at: Time,
    offset: UtcOffset,
    after: OffsetDateTime,
) -> Option<OffsetDateTime> {
    let local = after.to_offset(offset).date();
    (0..=7).find_map(|i| {
        let day = local.checked_add(Duration::days(i))?;
        if !days.is_empty() && !days.contains(&day.weekday()) {
            return None;
        }
        let slot = day.with_time(run_at).assume_offset(offset);
        (slot > after).then_some(slot)
    })
}

// ===========================================================================
// Tests
// ===========================================================================

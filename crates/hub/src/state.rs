use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

use crate::budget::{Zone, ZoneBudget, ZoneStatus};
use crate::et::{Et0, Et0Formula, EtRecord};
use crate::history::{Outcome, RunRecord};
use crate::weather::WeatherObservation;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub cycle_running: bool,
    pub last_cycle: Option<Date>,
    pub weather: WeatherStatus,
    pub zones: BTreeMap<String, ZoneView>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Default, Serialize)]
pub struct WeatherStatus {
    pub available: bool,
    pub date: Option<Date>,
    pub et0_mm: Option<f64>,
    pub method: Option<Et0Formula>,
    pub precip_mm: Option<f64>,
    pub last_error: Option<String>,
    /// Upcoming days, as of the last successful fetch.
    pub forecast: Vec<ForecastDay>,
}

/// One forecast day with the reference ET it implies. Informational only;
/// budgets never advance on forecast data.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastDay {
    pub date: Date,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub humidity_mean_pct: f64,
    pub precip_mm: f64,
    pub et0_mm: f64,
    pub method: Et0Formula,
}

impl ForecastDay {
    pub fn new(obs: &WeatherObservation, et0: Et0) -> Self {
        Self {
            date: obs.date,
            temp_min_c: obs.temp_min_c,
            temp_max_c: obs.temp_max_c,
            humidity_mean_pct: obs.humidity_mean_pct,
            precip_mm: obs.precip_mm,
            et0_mm: et0.mm,
            method: et0.formula,
        }
    }
}

#[derive(Clone, Serialize)]
pub struct ZoneView {
    pub name: String,
    pub enabled: bool,
    pub status: ZoneStatus,
    pub deficit_mm: f64,
    pub threshold_mm: f64,
    pub etc_today_mm: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Weather,
    Cycle,
    Run,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub cycle_running: bool,
    pub last_cycle: Option<Date>,
    pub weather: WeatherStatus,
    pub zones: BTreeMap<String, ZoneView>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            cycle_running: false,
            last_cycle: None,
            weather: WeatherStatus::default(),
            zones: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Refresh a zone's view from its configuration and budget.
    pub fn sync_zone(&mut self, zone: &Zone, budget: &ZoneBudget) {
        let view = self.zones.entry(zone.zone_id.clone()).or_insert_with(|| ZoneView {
            name: zone.name.clone(),
            enabled: zone.enabled,
            status: ZoneStatus::BelowThreshold,
            deficit_mm: 0.0,
            threshold_mm: 0.0,
            etc_today_mm: None,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
        });
        view.name = zone.name.clone();
        view.enabled = zone.enabled;
        view.status = budget.status(zone);
        view.deficit_mm = budget.deficit_mm;
        view.threshold_mm = zone.threshold_mm();
        view.last_run_at = budget.last_run_at;
        view.next_run_at = budget.next_eligible_at;
    }

    /// Drop views of zones no longer configured.
    pub fn retain_zones(&mut self, zone_ids: &[String]) {
        self.zones.retain(|id, _| zone_ids.contains(id));
    }

    pub fn set_zone_status(&mut self, zone_id: &str, status: ZoneStatus) {
        if let Some(view) = self.zones.get_mut(zone_id) {
            view.status = status;
        }
    }

    pub fn set_zone_error(&mut self, zone_id: &str, error: Option<String>) {
        if let Some(view) = self.zones.get_mut(zone_id) {
            view.last_error = error;
        }
    }

    /// Record a successful weather/ET computation for the day.
    pub fn record_weather(&mut self, record: &EtRecord, precip_mm: f64) {
        self.weather = WeatherStatus {
            available: true,
            date: Some(record.date),
            et0_mm: Some(record.et0_mm),
            method: Some(record.formula),
            precip_mm: Some(precip_mm),
            last_error: None,
            forecast: std::mem::take(&mut self.weather.forecast),
        };
        for (zone_id, view) in self.zones.iter_mut() {
            view.etc_today_mm = record.per_zone.get(zone_id).copied();
            view.last_error = None;
        }
        self.push_event(
            EventKind::Weather,
            format!(
                "{}: ET0 {:.2} mm ({}), rain {:.1} mm",
                record.date,
                record.et0_mm,
                record.formula.as_str(),
                precip_mm
            ),
        );
    }

    /// Weather could not be obtained: every zone reports it, nothing else
    /// changes.
    pub fn set_forecast(&mut self, days: Vec<ForecastDay>) {
        self.weather.forecast = days;
    }

    pub fn record_weather_unavailable(&mut self, date: Date, error: &str) {
        self.weather.available = false;
        self.weather.last_error = Some(error.to_string());
        for view in self.zones.values_mut() {
            view.last_error = Some(format!("weather unavailable: {error}"));
        }
        self.push_event(EventKind::Weather, format!("{date}: weather unavailable: {error}"));
    }

    /// Record the outcome of a valve run.
    pub fn record_run(&mut self, run: &RunRecord) {
        let detail = format!(
            "{} {} {} min, {:.1} mm ({})",
            run.zone_id,
            run.outcome.as_str(),
            run.duration_min,
            run.water_applied_mm,
            run.trigger.as_str()
        );
        if let Some(view) = self.zones.get_mut(&run.zone_id) {
            match run.outcome {
                Outcome::Completed => {
                    view.status = ZoneStatus::Completed;
                    view.last_error = None;
                }
                Outcome::Failed => {
                    view.status = ZoneStatus::Failed;
                    view.last_error = run.detail.clone();
                }
                Outcome::Skipped => {}
            }
        }
        let kind = if run.outcome == Outcome::Failed {
            EventKind::Error
        } else {
            EventKind::Run
        };
        self.push_event(kind, detail);
    }

    pub fn record_cycle(&mut self, detail: String) {
        self.push_event(EventKind::Cycle, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            cycle_running: self.cycle_running,
            last_cycle: self.last_cycle,
            weather: self.weather.clone(),
            zones: self.zones.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::tests::zone;
    use crate::history::Trigger;
    use time::macros::{date, datetime};

    fn run(zone_id: &str, outcome: Outcome) -> RunRecord {
        RunRecord {
            zone_id: zone_id.to_string(),
            requested_at: datetime!(2024-06-01 06:00 UTC),
            duration_min: 4,
            water_applied_mm: 8.0,
            water_applied_l: 80.0,
            trigger: Trigger::Scheduled,
            outcome,
            detail: (outcome == Outcome::Failed).then(|| "relay stuck".to_string()),
        }
    }

    #[test]
    fn events_are_capped() {
        let mut s = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            s.record_system(format!("event {i}"));
        }
        assert_eq!(s.events.len(), MAX_EVENTS);
        assert_eq!(s.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut s = SystemState::new();
        s.record_system("first".into());
        s.record_error("second".into());
        let status = s.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Error);
    }

    #[test]
    fn sync_zone_reflects_budget() {
        let mut s = SystemState::new();
        let z = zone("z1");
        let b = ZoneBudget {
            deficit_mm: 13.0,
            ..ZoneBudget::new("z1")
        };
        s.sync_zone(&z, &b);
        let view = &s.zones["z1"];
        assert_eq!(view.status, ZoneStatus::Due);
        assert_eq!(view.deficit_mm, 13.0);
        assert_eq!(view.threshold_mm, 12.5);
    }

    #[test]
    fn forecast_shows_in_status() {
        let obs = WeatherObservation {
            date: date!(2024 - 06 - 02),
            temp_min_c: 14.0,
            temp_max_c: 26.0,
            humidity_mean_pct: 60.0,
            wind_speed_kmh: 7.2,
            solar: crate::weather::SolarInput::Unavailable,
            precip_mm: 3.0,
        };
        let et0 = Et0 {
            mm: 4.2,
            formula: Et0Formula::Hargreaves,
        };
        let mut s = SystemState::new();
        s.set_forecast(vec![ForecastDay::new(&obs, et0)]);

        let json = serde_json::to_value(s.to_status()).unwrap();
        let day = &json["weather"]["forecast"][0];
        assert_eq!(day["date"], "2024-06-02");
        assert_eq!(day["precip_mm"], 3.0);
        assert_eq!(day["et0_mm"], 4.2);
    }

    #[test]
    fn weather_unavailable_marks_every_zone() {
        let mut s = SystemState::new();
        s.sync_zone(&zone("a"), &ZoneBudget::new("a"));
        s.sync_zone(&zone("b"), &ZoneBudget::new("b"));
        s.record_weather_unavailable(date!(2024 - 06 - 01), "timeout");

        assert!(!s.weather.available);
        assert!(s.zones.values().all(|v| v
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("weather unavailable"))));
    }

    #[test]
    fn failed_run_sets_status_and_error() {
        let mut s = SystemState::new();
        s.sync_zone(&zone("a"), &ZoneBudget::new("a"));
        s.record_run(&run("a", Outcome::Failed));
        assert_eq!(s.zones["a"].status, ZoneStatus::Failed);
        assert_eq!(s.zones["a"].last_error.as_deref(), Some("relay stuck"));
        assert_eq!(s.events.back().unwrap().kind, EventKind::Error);

        s.record_run(&run("a", Outcome::Completed));
        assert_eq!(s.zones["a"].status, ZoneStatus::Completed);
        assert!(s.zones["a"].last_error.is_none());
    }

    #[test]
    fn retain_drops_removed_zones() {
        let mut s = SystemState::new();
        s.sync_zone(&zone("a"), &ZoneBudget::new("a"));
        s.sync_zone(&zone("b"), &ZoneBudget::new("b"));
        s.retain_zones(&["a".to_string()]);
        assert_eq!(s.zones.len(), 1);
        assert!(s.zones.contains_key("a"));
    }
}

//! Daily totals and the append-only run log.
//!
//! Days accumulate additively. Once a later day has been recorded the earlier
//! ones are sealed: `record_day` refuses them, and run usage that would land
//! on a sealed day is attributed to the latest open day instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

pub type SharedLedger = Arc<RwLock<HistoryLedger>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
    Skipped,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Test => "test",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "manual" => Ok(Trigger::Manual),
            "test" => Ok(Trigger::Test),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Outcome::Completed),
            "failed" => Ok(Outcome::Failed),
            "skipped" => Ok(Outcome::Skipped),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub zone_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    pub duration_min: u32,
    pub water_applied_mm: f64,
    pub water_applied_l: f64,
    pub trigger: Trigger,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyHistory {
    pub date: Date,
    pub total_et_mm: f64,
    pub total_rainfall_mm: f64,
    pub total_water_used_mm: f64,
    pub total_water_used_l: f64,
    pub scheduled_water_l: f64,
    pub scheduled_runs: u32,
    pub manual_runs: u32,
    pub test_runs: u32,
    pub failed_runs: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WaterUse {
    pub mm: f64,
    pub liters: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistoryError {
    #[error("history for {date} is sealed (latest recorded day is {latest})")]
    Sealed { date: Date, latest: Date },
}

impl DailyHistory {
    pub fn empty(date: Date) -> Self {
        Self {
            date,
            total_et_mm: 0.0,
            total_rainfall_mm: 0.0,
            total_water_used_mm: 0.0,
            total_water_used_l: 0.0,
            scheduled_water_l: 0.0,
            scheduled_runs: 0,
            manual_runs: 0,
            test_runs: 0,
            failed_runs: 0,
        }
    }

    fn absorb(&mut self, delta: &DailyHistory) {
        self.total_et_mm += delta.total_et_mm;
        self.total_rainfall_mm += delta.total_rainfall_mm;
        self.total_water_used_mm += delta.total_water_used_mm;
        self.total_water_used_l += delta.total_water_used_l;
        self.scheduled_water_l += delta.scheduled_water_l;
        self.scheduled_runs += delta.scheduled_runs;
        self.manual_runs += delta.manual_runs;
        self.test_runs += delta.test_runs;
        self.failed_runs += delta.failed_runs;
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct HistoryLedger {
    days: BTreeMap<Date, DailyHistory>,
    runs: Vec<RunRecord>,
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted rows.
    pub fn restore(days: Vec<DailyHistory>, runs: Vec<RunRecord>) -> Self {
        Self {
            days: days.into_iter().map(|d| (d.date, d)).collect(),
            runs,
        }
    }

    pub fn latest_day(&self) -> Option<Date> {
        self.days.keys().next_back().copied()
    }

    /// The additive change `record_day` would make, without applying it.
    pub fn day_delta(
        &self,
        date: Date,
        et_total_mm: f64,
        rainfall_total_mm: f64,
        water_used: WaterUse,
    ) -> Result<DailyHistory, HistoryError> {
        if let Some(latest) = self.latest_day() {
            if date < latest {
                return Err(HistoryError::Sealed { date, latest });
            }
        }
        Ok(DailyHistory {
            total_et_mm: et_total_mm,
            total_rainfall_mm: rainfall_total_mm,
            total_water_used_mm: water_used.mm,
            total_water_used_l: water_used.liters,
            ..DailyHistory::empty(date)
        })
    }

    /// The additive change `record_run` would make. Usage lands on the run's
    /// own day unless that day is sealed.
    pub fn run_delta(&self, run: &RunRecord) -> DailyHistory {
        let run_day = run.requested_at.date();
        let date = match self.latest_day() {
            Some(latest) if latest > run_day => latest,
            _ => run_day,
        };

        let mut delta = DailyHistory {
            total_water_used_mm: run.water_applied_mm,
            total_water_used_l: run.water_applied_l,
            ..DailyHistory::empty(date)
        };
        if run.outcome == Outcome::Skipped {
            return delta;
        }
        match run.trigger {
            Trigger::Scheduled => {
                delta.scheduled_runs = 1;
                delta.scheduled_water_l = run.water_applied_l;
            }
            Trigger::Manual => delta.manual_runs = 1,
            Trigger::Test => delta.test_runs = 1,
        }
        if run.outcome == Outcome::Failed {
            delta.failed_runs = 1;
        }
        delta
    }

    pub fn record_day(
        &mut self,
        date: Date,
        et_total_mm: f64,
        rainfall_total_mm: f64,
        water_used: WaterUse,
    ) -> Result<(), HistoryError> {
        let delta = self.day_delta(date, et_total_mm, rainfall_total_mm, water_used)?;
        self.absorb(&delta);
        Ok(())
    }

    pub fn record_run(&mut self, run: RunRecord) {
        let delta = self.run_delta(&run);
        self.absorb(&delta);
        self.runs.push(run);
    }

    fn absorb(&mut self, delta: &DailyHistory) {
        self.days
            .entry(delta.date)
            .or_insert_with(|| DailyHistory::empty(delta.date))
            .absorb(delta);
    }

    pub fn day(&self, date: Date) -> Option<&DailyHistory> {
        self.days.get(&date)
    }

    /// Inclusive on both ends, ordered by date.
    pub fn query_range(&self, start: Date, end: Date) -> Vec<DailyHistory> {
        if start > end {
            return Vec::new();
        }
        self.days.range(start..=end).map(|(_, d)| d.clone()).collect()
    }

    /// Runs for one zone, oldest first.
    pub fn runs_for(&self, zone_id: &str) -> Vec<RunRecord> {
        self.runs.iter().filter(|r| r.zone_id == zone_id).cloned().collect()
    }

    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }
}

// ===========================================================================
// Tests
// ===========================================================================

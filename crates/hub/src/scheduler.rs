//! Daily decision loop: weather -> ET -> zone budgets -> valve runs ->
//! history.
//!
//! Everything funnels through one task. A 30 s ticker fires the daily cycle
//! once the configured local `run_at` has passed, and manual/test commands
//! arrive over an mpsc channel; both are handled one at a time, so no two
//! cycles or runs ever interleave their budget updates. Stopping a run in
//! flight is the one request that skips the queue (see `RunStops`).
//!
//! ## Daily cycle for date D
//!
//! ```text
//! reload zones ─▶ D already committed? ──yes──────────────────────────┐
//!                      │ no                                           │
//!                      ▼                                              │
//!                fetch + normalize ──fail──▶ mark zones, change nothing
//!                      │                                              │
//!                      ▼                                              ▼
//!         ET record ─▶ advance budgets ─▶ commit (one tx) ─▶ dispatch due zones
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time, UtcOffset};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};

use crate::budget::{next_watering_slot, BudgetError, Zone, ZoneBudget, ZoneStatus};
use crate::db::{CycleCommit, Db, ZoneAdvance};
use crate::error::{EngineError, EngineResult};
use crate::et::{compute_et0, Et0Formula, EtMethod, EtRecord, Site};
use crate::history::{DailyHistory, HistoryLedger, Outcome, RunRecord, SharedLedger, Trigger, WaterUse};
use crate::provider::{Location, WeatherSource};
use crate::state::{ForecastDay, SharedState};
use crate::valve::{RunOutcome, RunStops, Valve};
use crate::weather::{forecast, normalize, WeatherObservation};

/// How often the loop checks whether the daily cycle is due.
const TICK_INTERVAL_SEC: u64 = 30;

/// Wait before retrying a cycle whose weather fetch failed.
const WEATHER_RETRY_MIN: i64 = 15;

const COMMAND_QUEUE: usize = 16;

/// Days of forecast kept for the status view.
const FORECAST_DAYS: usize = 7;

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Settings + results
// ---------------------------------------------------------------------------

/// What to do with a trigger that arrives while a cycle is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    #[default]
    Queue,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub site: Site,
    pub location: Location,
    pub method: EtMethod,
    pub offset: UtcOffset,
    pub run_at: Time,
    pub max_run_min: u32,
    pub test_run_min: u32,
    pub max_concurrent_runs: usize,
    pub run_timeout_slack: Duration,
    pub busy_policy: BusyPolicy,
}

/// Per-zone result of a run request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneRunResult {
    pub zone_id: String,
    pub ok: bool,
    pub outcome: Outcome,
    pub trigger: Trigger,
    pub duration_min: u32,
    pub water_applied_mm: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub date: Date,
    /// The day was already committed; only dispatch ran.
    pub replay: bool,
    pub et0_mm: Option<f64>,
    pub method: Option<Et0Formula>,
    pub weather_error: Option<String>,
    pub advanced: Vec<String>,
    pub zone_errors: BTreeMap<String, String>,
    pub runs: Vec<ZoneRunResult>,
}

impl CycleReport {
    fn new(date: Date) -> Self {
        Self {
            date,
            replay: false,
            et0_mm: None,
            method: None,
            weather_error: None,
            advanced: Vec::new(),
            zone_errors: BTreeMap::new(),
            runs: Vec::new(),
        }
    }

    pub fn completed(&self) -> bool {
        self.weather_error.is_none()
    }
}

struct PlannedRun {
    zone: Zone,
    duration_min: u32,
    trigger: Trigger,
}

// ---------------------------------------------------------------------------
// Command channel
// ---------------------------------------------------------------------------

pub enum Command {
    RunZone {
        zone_id: String,
        duration_min: Option<u32>,
        reply: oneshot::Sender<EngineResult<ZoneRunResult>>,
    },
    RunAll {
        test: bool,
        reply: oneshot::Sender<EngineResult<Vec<ZoneRunResult>>>,
    },
    Cycle {
        reply: oneshot::Sender<EngineResult<CycleReport>>,
    },
}

/// Cloneable front door to the loop, held by the web layer.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    busy: Arc<AtomicBool>,
    policy: BusyPolicy,
    stops: RunStops,
}

/// The loop's end of the channel.
pub struct CommandRx {
    rx: mpsc::Receiver<Command>,
    busy: Arc<AtomicBool>,
}

impl CommandRx {
    pub(crate) async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }
}

/// `stops` must be the engine's registry (`Engine::stops`).
pub fn command_channel(policy: BusyPolicy, stops: RunStops) -> (SchedulerHandle, CommandRx) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let busy = Arc::new(AtomicBool::new(false));
    (
        SchedulerHandle {
            tx,
            busy: busy.clone(),
            policy,
            stops,
        },
        CommandRx { rx, busy },
    )
}

impl SchedulerHandle {
    pub async fn run_zone(&self, zone_id: &str, duration_min: Option<u32>) -> EngineResult<ZoneRunResult> {
        let zone_id = zone_id.to_string();
        self.submit(|reply| Command::RunZone {
            zone_id,
            duration_min,
            reply,
        })
        .await
    }

    pub async fn run_all(&self, test: bool) -> EngineResult<Vec<ZoneRunResult>> {
        self.submit(|reply| Command::RunAll { test, reply }).await
    }

    pub async fn cycle(&self) -> EngineResult<CycleReport> {
        self.submit(|reply| Command::Cycle { reply }).await
    }

    /// Cut the run in flight on `zone_id` short. The loop settles it with
    /// the water applied until the valve closed.
    pub fn stop_zone(&self, zone_id: &str) -> EngineResult<()> {
        if self.stops.stop(zone_id) {
            info!(zone = %zone_id, "stop requested");
            Ok(())
        } else {
            Err(EngineError::NotRunning(zone_id.to_string()))
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> Command,
    ) -> EngineResult<T> {
        if self.policy == BusyPolicy::Reject && self.is_busy() {
            return Err(EngineError::Busy);
        }
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }
}

/// Whether the loop should start today's cycle at `now`.
fn cycle_due(
    settings: &Settings,
    now: OffsetDateTime,
    done_on: Option<Date>,
    retry_after: Option<OffsetDateTime>,
) -> bool {
    let local = now.to_offset(settings.offset);
    if done_on == Some(local.date()) || local.time() < settings.run_at {
        return false;
    }
    retry_after.map_or(true, |t| now >= t)
}

/// What a valve task left behind, as a run outcome. Errors, timeouts and
/// aborted tasks credit no water.
fn reported_outcome(
    finished: Option<Result<EngineResult<RunOutcome>, Elapsed>>,
    limit: Duration,
) -> RunOutcome {
    let failed = |detail: String| RunOutcome {
        water_applied_mm: 0.0,
        outcome: Outcome::Failed,
        detail: Some(detail),
    };
    match finished {
        Some(Ok(Ok(out))) => out,
        Some(Ok(Err(e))) => failed(e.to_string()),
        Some(Err(_)) => failed(format!("no result within {} s", limit.as_secs())),
        None => failed("valve task aborted".into()),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    db: Db,
    weather: Arc<dyn WeatherSource>,
    valve: Arc<dyn Valve>,
    shared: SharedState,
    ledger: SharedLedger,
    settings: Settings,
    stops: RunStops,
    zones: Vec<Zone>,
    budgets: HashMap<String, ZoneBudget>,
}

impl Engine {
    pub fn new(
        db: Db,
        weather: Arc<dyn WeatherSource>,
        valve: Arc<dyn Valve>,
        shared: SharedState,
        ledger: SharedLedger,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            weather,
            valve,
            shared,
            ledger,
            settings,
            stops: RunStops::default(),
            zones: Vec::new(),
            budgets: HashMap::new(),
        }
    }

    /// Registry of runs in flight; hand it to `command_channel`.
    pub fn stops(&self) -> RunStops {
        self.stops.clone()
    }

    /// Restore budgets and history from the database. Budgets come back
    /// as they were; days missed while down are not backfilled.
    pub async fn load(&mut self) -> EngineResult<()> {
        self.budgets = self
            .db
            .load_budgets()
            .await?
            .into_iter()
            .map(|b| (b.zone_id.clone(), b))
            .collect();

        let days = self.db.load_history().await?;
        let runs = self.db.load_runs().await?;
        info!(days = days.len(), runs = runs.len(), budgets = self.budgets.len(), "engine state restored");
        *self.ledger.write().await = HistoryLedger::restore(days, runs);

        let last = self.db.latest_cycle_day().await?;
        self.shared.write().await.last_cycle = last;

        self.reload_zones().await
    }

    #[cfg(test)]
    fn budget(&self, zone_id: &str) -> Option<&ZoneBudget> {
        self.budgets.get(zone_id)
    }

    pub fn local_date(&self, now: OffsetDateTime) -> Date {
        now.to_offset(self.settings.offset).date()
    }

    /// Pick up zone configuration; create budgets for new zones and drop
    /// those of removed ones.
    async fn reload_zones(&mut self) -> EngineResult<()> {
        let zones = self.db.load_zones().await?;
        let ids: Vec<String> = zones.iter().map(|z| z.zone_id.clone()).collect();

        self.budgets.retain(|zone_id, _| {
            let keep = ids.contains(zone_id);
            if !keep {
                info!(zone = %zone_id, "zone removed, budget dropped");
            }
            keep
        });
        for zone in &zones {
            if !self.budgets.contains_key(&zone.zone_id) {
                let budget = ZoneBudget::new(zone.zone_id.as_str());
                self.db.save_budget(&budget).await?;
                info!(zone = %zone.zone_id, "budget created");
                self.budgets.insert(zone.zone_id.clone(), budget);
            }
        }

        {
            let mut st = self.shared.write().await;
            st.retain_zones(&ids);
            for zone in &zones {
                if let Some(b) = self.budgets.get(&zone.zone_id) {
                    st.sync_zone(zone, b);
                }
            }
        }

        self.zones = zones;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Daily cycle
    // -----------------------------------------------------------------------

    pub async fn daily_cycle(&mut self, today: Date, now: OffsetDateTime) -> EngineResult<CycleReport> {
        self.reload_zones().await?;
        let mut report = CycleReport::new(today);

        if let Some(cycle) = self.db.load_cycle(today).await? {
            info!(date = %today, "cycle already committed, dispatch only");
            report.replay = true;
            report.et0_mm = Some(cycle.et0_mm);
        } else {
            self.warn_on_gap(today).await?;
            if !self.advance(today, now, &mut report).await? {
                return Ok(report);
            }
        }

        let plans = self.due_runs(today, now);
        info!(date = %today, due = plans.len(), "dispatching scheduled runs");
        report.runs = self.execute(plans, now).await;

        self.shared.write().await.record_cycle(format!(
            "{today}: cycle done{}, {} run(s)",
            if report.replay { " (replay)" } else { "" },
            report.runs.len()
        ));
        Ok(report)
    }

    async fn warn_on_gap(&self, today: Date) -> EngineResult<()> {
        if let Some(last) = self.db.latest_cycle_day().await? {
            let missed = (today - last).whole_days() - 1;
            if missed > 0 {
                warn!(date = %today, last = %last, missed, "days without a cycle are not backfilled");
                self.shared
                    .write()
                    .await
                    .record_system(format!("{missed} day(s) since {last} skipped, not backfilled"));
            }
        }
        Ok(())
    }

    /// Steps 3-4: weather, ET, budgets, commit. Returns false when the day
    /// could not be advanced (weather unavailable).
    async fn advance(
        &mut self,
        today: Date,
        now: OffsetDateTime,
        report: &mut CycleReport,
    ) -> EngineResult<bool> {
        let (observation, outlook) = match self.fetch_observation(today).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(date = %today, kind = e.kind(), error = %e, "weather unavailable, budgets untouched");
                self.shared
                    .write()
                    .await
                    .record_weather_unavailable(today, &e.to_string());
                report.weather_error = Some(e.to_string());
                return Ok(false);
            }
        };

        let (record, failures) = EtRecord::build(&observation, &self.settings.site, self.settings.method, &self.zones);
        report.et0_mm = Some(record.et0_mm);
        report.method = Some(record.formula);
        for (zone_id, e) in failures {
            warn!(zone = %zone_id, error = %e, "zone skipped for ET");
            report.zone_errors.insert(zone_id, e.to_string());
        }

        let mut advances = Vec::new();
        for zone in self.zones.iter().filter(|z| z.enabled) {
            let Some(&etc) = record.per_zone.get(&zone.zone_id) else {
                continue;
            };
            let current = self
                .budgets
                .get(&zone.zone_id)
                .cloned()
                .unwrap_or_else(|| ZoneBudget::new(zone.zone_id.as_str()));
            match current.advance_day(zone, today, etc, observation.precip_mm) {
                Ok(adv) => {
                    debug!(
                        zone = %zone.zone_id,
                        etc_mm = etc,
                        effective_rain_mm = adv.effective_rain_mm,
                        deficit_mm = adv.budget.deficit_mm,
                        "budget advanced"
                    );
                    advances.push(ZoneAdvance {
                        budget: adv.budget,
                        etc_mm: etc,
                        effective_rain_mm: adv.effective_rain_mm,
                    });
                }
                Err(e @ BudgetError::AlreadyAdvanced { .. }) => {
                    debug!(zone = %zone.zone_id, error = %e, "budget already advanced");
                }
                Err(e @ BudgetError::InvalidZone { .. }) => {
                    warn!(zone = %zone.zone_id, error = %e, "zone skipped");
                    report.zone_errors.insert(zone.zone_id.clone(), EngineError::from(e).to_string());
                }
            }
        }

        let history = {
            let ledger = self.ledger.read().await;
            match ledger.day_delta(today, record.et0_mm, observation.precip_mm, WaterUse::default()) {
                Ok(delta) => Some(delta),
                Err(e) => {
                    warn!(date = %today, error = %e, "history not recorded for this day");
                    None
                }
            }
        };

        self.db
            .commit_cycle(&CycleCommit {
                record: &record,
                precip_mm: observation.precip_mm,
                advances: &advances,
                history: history.as_ref(),
                completed_at: now,
            })
            .await?;

        // Committed; now publish.
        for adv in &advances {
            self.budgets.insert(adv.budget.zone_id.clone(), adv.budget.clone());
            report.advanced.push(adv.budget.zone_id.clone());
        }
        if history.is_some() {
            let _ = self.ledger.write().await.record_day(
                today,
                record.et0_mm,
                observation.precip_mm,
                WaterUse::default(),
            );
        }
        {
            let mut st = self.shared.write().await;
            st.last_cycle = Some(today);
            for zone in &self.zones {
                if let Some(b) = self.budgets.get(&zone.zone_id) {
                    st.sync_zone(zone, b);
                }
            }
            st.record_weather(&record, observation.precip_mm);
            st.set_forecast(outlook);
            for (zone_id, err) in &report.zone_errors {
                st.set_zone_error(zone_id, Some(err.clone()));
            }
        }

        info!(
            date = %today,
            et0_mm = record.et0_mm,
            method = record.formula.as_str(),
            precip_mm = observation.precip_mm,
            zones = advances.len(),
            "daily cycle committed"
        );
        Ok(true)
    }

    /// Today's observation plus whatever forecast the payload carries.
    async fn fetch_observation(&self, today: Date) -> EngineResult<(WeatherObservation, Vec<ForecastDay>)> {
        let raw = self.weather.fetch_daily(&self.settings.location, today).await?;
        let observation = normalize(&raw, self.weather.kind(), today)?;
        let outlook = forecast(&raw, self.weather.kind(), today, FORECAST_DAYS)
            .iter()
            .map(|obs| ForecastDay::new(obs, compute_et0(obs, &self.settings.site, self.settings.method)))
            .collect();
        Ok((observation, outlook))
    }

    /// Due, enabled zones allowed to water today, most depleted first.
    fn due_runs(&self, today: Date, now: OffsetDateTime) -> Vec<PlannedRun> {
        let mut due: Vec<(f64, PlannedRun)> = self
            .zones
            .iter()
            .filter(|z| z.enabled && z.waters_on(today))
            .filter_map(|zone| {
                let budget = self.budgets.get(&zone.zone_id)?;
                if !budget.is_due(zone) || !budget.eligible_at(now) {
                    return None;
                }
                let duration_min = budget.required_duration(zone, self.settings.max_run_min);
                (duration_min > 0).then(|| {
                    (
                        budget.deficit_fraction(zone),
                        PlannedRun {
                            zone: zone.clone(),
                            duration_min,
                            trigger: Trigger::Scheduled,
                        },
                    )
                })
            })
            .collect();
        due.sort_by(|a, b| b.0.total_cmp(&a.0));
        due.into_iter().map(|(_, plan)| plan).collect()
    }

    // -----------------------------------------------------------------------
    // Manual commands
    // -----------------------------------------------------------------------

    /// Run one zone now regardless of threshold and watering days. An
    /// explicit duration is used as given and the valve credits rate times
    /// that duration. Without one the deficit decides; a zero-minute result
    /// is recorded as skipped.
    pub async fn run_zone(
        &mut self,
        zone_id: &str,
        duration_min: Option<u32>,
        now: OffsetDateTime,
    ) -> EngineResult<ZoneRunResult> {
        self.reload_zones().await?;
        let zone = self
            .zones
            .iter()
            .find(|z| z.zone_id == zone_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownZone(zone_id.to_string()))?;
        if !zone.enabled {
            return Err(EngineError::ZoneDisabled(zone_id.to_string()));
        }

        let duration_min = match duration_min {
            Some(d) => d,
            None => self
                .budgets
                .get(zone_id)
                .map_or(0, |b| b.required_duration(&zone, self.settings.max_run_min)),
        };

        let mut results = self
            .execute(
                vec![PlannedRun {
                    zone,
                    duration_min,
                    trigger: Trigger::Manual,
                }],
                now,
            )
            .await;
        results
            .pop()
            .ok_or_else(|| EngineError::Actuation(format!("no result for zone '{zone_id}'")))
    }

    /// Run every enabled zone. Test mode runs each for `test_run_min`.
    pub async fn run_all_zones(&mut self, test: bool, now: OffsetDateTime) -> EngineResult<Vec<ZoneRunResult>> {
        self.reload_zones().await?;
        let max = self.settings.max_run_min;
        let plans = self
            .zones
            .iter()
            .filter(|z| z.enabled)
            .map(|zone| {
                let (duration_min, trigger) = if test {
                    (self.settings.test_run_min, Trigger::Test)
                } else {
                    let d = self
                        .budgets
                        .get(&zone.zone_id)
                        .map_or(0, |b| b.required_duration(zone, max));
                    (d, Trigger::Manual)
                };
                PlannedRun {
                    zone: zone.clone(),
                    duration_min,
                    trigger,
                }
            })
            .collect();
        Ok(self.execute(plans, now).await)
    }

    // -----------------------------------------------------------------------
    // Dispatch + settle
    // -----------------------------------------------------------------------

    fn run_timeout(&self, duration_min: u32) -> Duration {
        Duration::from_secs(u64::from(duration_min) * 60) + self.settings.run_timeout_slack
    }

    fn next_slot(&self, zone: &Zone, after: OffsetDateTime) -> Option<OffsetDateTime> {
        next_watering_slot(&zone.watering_days, self.settings.run_at, self.settings.offset, after)
    }

    /// Persist the budget as it will stand if the run completes, before the
    /// valve opens. If the run's own commit is lost, a restart finds the
    /// zone watered rather than due.
    async fn persist_in_flight(&self, plan: &PlannedRun, at: OffsetDateTime) -> EngineResult<()> {
        let zone = &plan.zone;
        let current = self
            .budgets
            .get(&zone.zone_id)
            .cloned()
            .unwrap_or_else(|| ZoneBudget::new(zone.zone_id.as_str()));
        let planned_mm = zone.precipitation_rate_mm_per_min * f64::from(plan.duration_min);
        let mut marker = current.record_run(planned_mm, at.to_offset(self.settings.offset));
        marker.next_eligible_at = self.next_slot(zone, at);
        self.db.save_budget(&marker).await?;
        Ok(())
    }

    /// Runs `plans` in batches of `max_concurrent_runs`, settling each run
    /// once its batch is done. The first batch is stamped `now`, later ones
    /// with the time they were dispatched.
    async fn execute(&mut self, plans: Vec<PlannedRun>, now: OffsetDateTime) -> Vec<ZoneRunResult> {
        let mut results = Vec::with_capacity(plans.len());
        let batch_size = self.settings.max_concurrent_runs.max(1);
        let started = tokio::time::Instant::now();

        for (n, batch) in plans.chunks(batch_size).enumerate() {
            let dispatched_at = if n == 0 { now } else { now + started.elapsed() };

            // No valve opens before its in-flight budget is stored.
            let mut not_started = HashMap::new();
            for (i, plan) in batch.iter().enumerate() {
                if plan.duration_min == 0 {
                    continue;
                }
                if let Err(e) = self.persist_in_flight(plan, dispatched_at).await {
                    error!(zone = %plan.zone.zone_id, error = %e, "run not persisted, valve left closed");
                    not_started.insert(
                        i,
                        RunOutcome {
                            water_applied_mm: 0.0,
                            outcome: Outcome::Failed,
                            detail: Some(format!("run not started: {e}")),
                        },
                    );
                }
            }

            let mut set = JoinSet::new();
            {
                let mut st = self.shared.write().await;
                for (i, plan) in batch.iter().enumerate() {
                    if plan.duration_min == 0 || not_started.contains_key(&i) {
                        continue;
                    }
                    st.set_zone_status(&plan.zone.zone_id, ZoneStatus::Running);
                    info!(
                        zone = %plan.zone.zone_id,
                        duration_min = plan.duration_min,
                        trigger = plan.trigger.as_str(),
                        "starting run"
                    );
                    let valve = self.valve.clone();
                    let zone_id = plan.zone.zone_id.clone();
                    let duration_min = plan.duration_min;
                    let limit = self.run_timeout(duration_min);
                    let stop = self.stops.register(&zone_id);
                    set.spawn(async move {
                        let res = tokio::time::timeout(limit, valve.start_zone(&zone_id, duration_min, stop)).await;
                        (i, res)
                    });
                }
            }

            let mut finished = HashMap::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((i, res)) => {
                        finished.insert(i, res);
                    }
                    Err(e) => error!(error = %e, "valve task failed"),
                }
            }

            for (i, plan) in batch.iter().enumerate() {
                let reported = if plan.duration_min == 0 {
                    RunOutcome {
                        water_applied_mm: 0.0,
                        outcome: Outcome::Skipped,
                        detail: Some("nothing to replace".into()),
                    }
                } else if let Some(out) = not_started.remove(&i) {
                    out
                } else {
                    reported_outcome(finished.remove(&i), self.run_timeout(plan.duration_min))
                };
                results.push(self.settle(plan, reported, dispatched_at).await);
            }
        }
        results
    }

    /// Credit the budget, append the run record and history usage, commit,
    /// then publish.
    async fn settle(
        &mut self,
        plan: &PlannedRun,
        reported: RunOutcome,
        dispatched_at: OffsetDateTime,
    ) -> ZoneRunResult {
        let zone = &plan.zone;
        let requested_at = dispatched_at.to_offset(self.settings.offset);
        let water_mm = if reported.water_applied_mm.is_finite() {
            reported.water_applied_mm.max(0.0)
        } else {
            0.0
        };

        let run = RunRecord {
            zone_id: zone.zone_id.clone(),
            requested_at,
            duration_min: plan.duration_min,
            water_applied_mm: water_mm,
            water_applied_l: zone.liters_for(water_mm),
            trigger: plan.trigger,
            outcome: reported.outcome,
            detail: reported.detail.clone(),
        };

        // Any dispatched run replaces its in-flight budget, even when skipped.
        let budget = (plan.duration_min > 0).then(|| {
            let current = self
                .budgets
                .get(&zone.zone_id)
                .cloned()
                .unwrap_or_else(|| ZoneBudget::new(zone.zone_id.as_str()));
            match reported.outcome {
                Outcome::Skipped => current,
                Outcome::Failed => current.record_run(water_mm, requested_at),
                Outcome::Completed => {
                    let mut next = current.record_run(water_mm, requested_at);
                    next.next_eligible_at = self.next_slot(zone, dispatched_at);
                    next
                }
            }
        });

        let delta = self.ledger.read().await.run_delta(&run);
        if let Err(e) = self.commit_run(budget.as_ref(), &run, &delta).await {
            // The water is already on the ground; memory follows reality and
            // the stored in-flight budget stands in until the next commit.
            error!(zone = %zone.zone_id, error = %format!("{e:#}"), "failed to persist run");
            self.shared
                .write()
                .await
                .record_error(format!("{}: run not persisted: {e}", zone.zone_id));
        }

        if let Some(b) = &budget {
            self.budgets.insert(zone.zone_id.clone(), b.clone());
        }
        self.ledger.write().await.record_run(run.clone());
        {
            let mut st = self.shared.write().await;
            if let Some(b) = &budget {
                st.sync_zone(zone, b);
            }
            st.record_run(&run);
        }

        match run.outcome {
            Outcome::Failed => warn!(
                zone = %zone.zone_id,
                water_applied_mm = water_mm,
                detail = run.detail.as_deref().unwrap_or(""),
                "run failed"
            ),
            _ => info!(
                zone = %zone.zone_id,
                outcome = run.outcome.as_str(),
                water_applied_mm = water_mm,
                deficit_mm = budget.as_ref().map(|b| b.deficit_mm),
                "run settled"
            ),
        }

        ZoneRunResult {
            zone_id: run.zone_id,
            ok: run.outcome != Outcome::Failed,
            outcome: run.outcome,
            trigger: run.trigger,
            duration_min: run.duration_min,
            water_applied_mm: water_mm,
            error: if run.outcome == Outcome::Failed { run.detail } else { None },
        }
    }

    async fn commit_run(
        &self,
        budget: Option<&ZoneBudget>,
        run: &RunRecord,
        delta: &DailyHistory,
    ) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.db.commit_run(budget, run, delta).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < COMMIT_ATTEMPTS => {
                    warn!(zone = %run.zone_id, attempt, error = %format!("{e:#}"), "run commit failed, retrying");
                    tokio::time::sleep(COMMIT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Returns the date of a cycle that completed, if the command ran one.
    async fn handle_command(&mut self, cmd: Command) -> Option<Date> {
        let now = OffsetDateTime::now_utc();
        match cmd {
            Command::RunZone {
                zone_id,
                duration_min,
                reply,
            } => {
                let res = self.run_zone(&zone_id, duration_min, now).await;
                let _ = reply.send(res);
                None
            }
            Command::RunAll { test, reply } => {
                let res = self.run_all_zones(test, now).await;
                let _ = reply.send(res);
                None
            }
            Command::Cycle { reply } => {
                let today = self.local_date(now);
                let res = self.daily_cycle(today, now).await;
                let done = matches!(&res, Ok(r) if r.completed()).then_some(today);
                let _ = reply.send(res);
                done
            }
        }
    }

    async fn set_busy(&self, commands: &CommandRx, busy: bool) {
        commands.busy.store(busy, Ordering::SeqCst);
        self.shared.write().await.cycle_running = busy;
    }

    /// Run the loop. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut commands: CommandRx) {
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut done_on: Option<Date> = None;
        let mut retry_after: Option<OffsetDateTime> = None;

        info!(
            zones = self.zones.len(),
            tick_sec = TICK_INTERVAL_SEC,
            run_at = %self.settings.run_at,
            max_concurrent_runs = self.settings.max_concurrent_runs,
            busy_policy = ?self.settings.busy_policy,
            "scheduler started"
        );
        self.shared.write().await.record_system(format!(
            "scheduler started (daily at {}, {} zone(s))",
            self.settings.run_at,
            self.zones.len()
        ));

        loop {
            let next = tokio::select! {
                _ = ticker.tick() => None,
                cmd = commands.recv() => Some(cmd),
            };

            match next {
                None => {
                    let now = OffsetDateTime::now_utc();
                    if !cycle_due(&self.settings, now, done_on, retry_after) {
                        continue;
                    }
                    let today = self.local_date(now);
                    self.set_busy(&commands, true).await;
                    match self.daily_cycle(today, now).await {
                        Ok(report) if report.completed() => {
                            done_on = Some(today);
                            retry_after = None;
                        }
                        Ok(_) => {
                            retry_after = Some(now + time::Duration::minutes(WEATHER_RETRY_MIN));
                        }
                        Err(e) => {
                            error!(date = %today, kind = e.kind(), error = %e, "daily cycle failed");
                            self.shared
                                .write()
                                .await
                                .record_error(format!("{today}: cycle failed: {e}"));
                            retry_after = Some(now + time::Duration::minutes(WEATHER_RETRY_MIN));
                        }
                    }
                    self.set_busy(&commands, false).await;
                }
                Some(None) => {
                    info!("command channel closed, scheduler stopping");
                    break;
                }
                Some(Some(cmd)) => {
                    self.set_busy(&commands, true).await;
                    if let Some(day) = self.handle_command(cmd).await {
                        done_on = Some(day);
                        retry_after = None;
                    }
                    self.set_busy(&commands, false).await;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::tests::zone;
    use crate::et::compute_et0;
    use crate::state::SystemState;
    use crate::valve::StopSignal;
    use crate::weather::ProviderKind;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use time::macros::{date, datetime, offset, time};
    use time::Weekday;
    use tokio::sync::RwLock;

    // -- Scripted collaborators ---------------------------------------------

    struct ScriptedWeather {
        script: Mutex<VecDeque<EngineResult<Value>>>,
        calls: Mutex<usize>,
        kind: Mutex<ProviderKind>,
    }

    impl ScriptedWeather {
        fn new(script: Vec<EngineResult<Value>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
                kind: Mutex::new(ProviderKind::Station),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl WeatherSource for ScriptedWeather {
        fn kind(&self) -> ProviderKind {
            *self.kind.lock().unwrap()
        }

        async fn fetch_daily(&self, _location: &Location, _date: Date) -> EngineResult<Value> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::TransientNetwork("script exhausted".into())))
        }
    }

    /// Completes at 2 mm/min unless a step is scripted. With `hold` set, a
    /// run lasts until it is stopped and then reports 1 mm.
    struct ScriptedValve {
        script: Mutex<VecDeque<EngineResult<RunOutcome>>>,
        calls: Mutex<Vec<(String, u32)>>,
        hold: Mutex<bool>,
        delay: Mutex<Duration>,
        /// When set, every run snapshots the stored budgets before it ends.
        db: Mutex<Option<Db>>,
        stored: Mutex<Vec<ZoneBudget>>,
    }

    impl ScriptedValve {
        fn new(script: Vec<EngineResult<RunOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                hold: Mutex::new(false),
                delay: Mutex::new(Duration::ZERO),
                db: Mutex::new(None),
                stored: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }

        fn stored(&self) -> Vec<ZoneBudget> {
            self.stored.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Valve for ScriptedValve {
        async fn start_zone(&self, zone_id: &str, duration_min: u32, mut stop: StopSignal) -> EngineResult<RunOutcome> {
            self.calls.lock().unwrap().push((zone_id.to_string(), duration_min));

            let db = self.db.lock().unwrap().clone();
            if let Some(db) = db {
                let budgets = db.load_budgets().await.unwrap();
                self.stored.lock().unwrap().extend(budgets);
            }
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let hold = *self.hold.lock().unwrap();
            if hold {
                stop.requested().await;
                return Ok(RunOutcome {
                    water_applied_mm: 1.0,
                    outcome: Outcome::Completed,
                    detail: Some("stopped".into()),
                });
            }

            let step = self.script.lock().unwrap().pop_front();
            step.unwrap_or_else(|| {
                Ok(RunOutcome {
                    water_applied_mm: 2.0 * f64::from(duration_min),
                    outcome: Outcome::Completed,
                    detail: None,
                })
            })
        }
    }

    // -- Fixtures -----------------------------------------------------------

    /// 2024-06-03 is a Monday.
    const TODAY: Date = date!(2024 - 06 - 03);

    fn now_on(day: Date) -> OffsetDateTime {
        day.with_time(time!(06:00)).assume_utc()
    }

    fn dry_day() -> Value {
        json!({"temp_min": 12.0, "temp_max": 28.0, "humidity": 50, "precipitation": 0})
    }

    fn rainy_day(mm: f64) -> Value {
        json!({"temp_min": 12.0, "temp_max": 20.0, "humidity": 90, "precipitation": mm})
    }

    fn expected_et0(payload: &Value, day: Date) -> f64 {
        let obs = normalize(payload, ProviderKind::Station, day).unwrap();
        compute_et0(&obs, &settings().site, EtMethod::Auto).mm
    }

    fn settings() -> Settings {
        Settings {
            site: Site {
                latitude: 45.0,
                elevation_m: 100.0,
                wind_height_m: 2.0,
            },
            location: Location {
                latitude: 45.0,
                longitude: 5.0,
            },
            method: EtMethod::Auto,
            offset: offset!(UTC),
            run_at: time!(06:00),
            max_run_min: 60,
            test_run_min: 1,
            max_concurrent_runs: 1,
            run_timeout_slack: Duration::from_secs(60),
            busy_policy: BusyPolicy::Queue,
        }
    }

    struct Harness {
        engine: Engine,
        weather: Arc<ScriptedWeather>,
        valve: Arc<ScriptedValve>,
        shared: SharedState,
        ledger: SharedLedger,
        db: Db,
    }

    async fn harness(
        zones: Vec<Zone>,
        preset_deficits: &[(&str, f64)],
        weather: Vec<EngineResult<Value>>,
        valve: Vec<EngineResult<RunOutcome>>,
    ) -> Harness {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        for z in &zones {
            db.upsert_zone(z).await.unwrap();
        }
        for (zone_id, deficit) in preset_deficits {
            db.save_budget(&ZoneBudget {
                deficit_mm: *deficit,
                ..ZoneBudget::new(*zone_id)
            })
            .await
            .unwrap();
        }

        let weather = ScriptedWeather::new(weather);
        let valve = ScriptedValve::new(valve);
        let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
        let ledger: SharedLedger = Arc::new(RwLock::new(HistoryLedger::new()));
        let mut engine = Engine::new(
            db.clone(),
            weather.clone(),
            valve.clone(),
            shared.clone(),
            ledger.clone(),
            settings(),
        );
        engine.load().await.unwrap();
        Harness {
            engine,
            weather,
            valve,
            shared,
            ledger,
            db,
        }
    }

    fn deficit(h: &Harness, zone_id: &str) -> f64 {
        h.engine.budget(zone_id).unwrap().deficit_mm
    }

    // -- Daily cycle: advancement -------------------------------------------

    #[tokio::test]
    async fn cycle_advances_budget_by_etc() {
        let mut h = harness(vec![zone("z1")], &[], vec![Ok(dry_day())], vec![]).await;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();

        let et0 = expected_et0(&dry_day(), TODAY);
        assert!(report.completed());
        assert_eq!(report.advanced, vec!["z1".to_string()]);
        assert!((deficit(&h, "z1") - et0).abs() < 1e-9);

        // persisted and recorded
        let stored = h.db.load_budgets().await.unwrap();
        assert!((stored[0].deficit_mm - et0).abs() < 1e-9);
        assert!(h.db.load_cycle(TODAY).await.unwrap().is_some());
        let ledger = h.ledger.read().await;
        assert!((ledger.day(TODAY).unwrap().total_et_mm - et0).abs() < 1e-9);
        assert_eq!(h.shared.read().await.last_cycle, Some(TODAY));
    }

    #[tokio::test]
    async fn weather_failure_mutates_nothing() {
        let mut h = harness(
            vec![zone("a"), zone("b")],
            &[("a", 4.0)],
            vec![Err(EngineError::TransientNetwork("timeout".into()))],
            vec![],
        )
        .await;

        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(!report.completed());
        assert!(report.advanced.is_empty());
        assert_eq!(deficit(&h, "a"), 4.0);
        assert_eq!(deficit(&h, "b"), 0.0);
        assert!(h.db.load_cycle(TODAY).await.unwrap().is_none());
        assert!(h.ledger.read().await.day(TODAY).is_none());

        let st = h.shared.read().await;
        assert!(!st.weather.available);
        assert!(st.zones.values().all(|z| z.last_error.is_some()));
    }

    #[tokio::test]
    async fn malformed_weather_is_treated_like_missing() {
        let mut h = harness(vec![zone("a")], &[], vec![Ok(json!({"temp_min": 10}))], vec![]).await;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(report.weather_error.unwrap().contains("incomplete"));
        assert_eq!(deficit(&h, "a"), 0.0);
    }

    #[tokio::test]
    async fn skipped_day_is_not_applied_twice() {
        let day1 = TODAY;
        let day2 = date!(2024 - 06 - 04);
        let day3 = date!(2024 - 06 - 05);
        let mut h = harness(
            vec![zone("a")],
            &[],
            vec![
                Ok(dry_day()),
                Err(EngineError::TransientNetwork("down".into())),
                Ok(dry_day()),
            ],
            vec![],
        )
        .await;

        h.engine.daily_cycle(day1, now_on(day1)).await.unwrap();
        h.engine.daily_cycle(day2, now_on(day2)).await.unwrap();
        h.engine.daily_cycle(day3, now_on(day3)).await.unwrap();

        let expected = expected_et0(&dry_day(), day1) + expected_et0(&dry_day(), day3);
        assert!((deficit(&h, "a") - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replay_does_not_refetch_or_readvance() {
        let mut h = harness(vec![zone("a")], &[], vec![Ok(dry_day()), Ok(dry_day())], vec![]).await;
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        let after_first = deficit(&h, "a");

        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(report.replay);
        assert_eq!(h.weather.calls(), 1);
        assert_eq!(deficit(&h, "a"), after_first);
    }

    #[tokio::test]
    async fn rain_refills_to_zero() {
        let mut h = harness(vec![zone("a")], &[("a", 5.0)], vec![Ok(rainy_day(20.0))], vec![]).await;
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert_eq!(deficit(&h, "a"), 0.0);
        assert!(h.valve.calls().is_empty());
    }

    #[tokio::test]
    async fn disabled_zone_is_frozen() {
        let mut off = zone("off");
        off.enabled = false;
        let mut h = harness(vec![off], &[("off", 20.0)], vec![Ok(dry_day())], vec![]).await;
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert_eq!(deficit(&h, "off"), 20.0);
        assert!(h.valve.calls().is_empty());
        assert_eq!(h.shared.read().await.zones["off"].status, ZoneStatus::Disabled);
    }

    #[tokio::test]
    async fn bad_zone_does_not_block_others() {
        let mut bad = zone("bad");
        bad.crop_coefficient = 0.0;
        let mut h = harness(vec![bad, zone("good")], &[], vec![Ok(dry_day())], vec![]).await;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();

        assert_eq!(report.advanced, vec!["good".to_string()]);
        assert!(report.zone_errors.contains_key("bad"));
        assert_eq!(deficit(&h, "bad"), 0.0);
        assert!(deficit(&h, "good") > 0.0);
        assert!(h.shared.read().await.zones["bad"].last_error.is_some());
    }

    // -- Daily cycle: dispatch ----------------------------------------------

    #[tokio::test]
    async fn due_zone_is_watered_and_credited() {
        let mut h = harness(vec![zone("a")], &[("a", 14.0)], vec![Ok(dry_day())], vec![]).await;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();

        let before = 14.0 + expected_et0(&dry_day(), TODAY);
        let minutes = (before / 2.0).ceil() as u32;
        assert_eq!(h.valve.calls(), vec![("a".to_string(), minutes)]);
        assert_eq!(report.runs.len(), 1);
        assert!(report.runs[0].ok);
        assert_eq!(deficit(&h, "a"), 0.0);

        let budget = h.engine.budget("a").unwrap();
        assert_eq!(budget.last_run_at, Some(now_on(TODAY)));
        assert_eq!(budget.next_eligible_at, Some(now_on(date!(2024 - 06 - 04))));

        let ledger = h.ledger.read().await;
        let day = ledger.day(TODAY).unwrap();
        assert_eq!(day.scheduled_runs, 1);
        assert!((day.scheduled_water_l - 2.0 * f64::from(minutes) * 10.0).abs() < 1e-9);
        assert_eq!(h.db.load_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_run_keeps_zone_due() {
        let mut h = harness(
            vec![zone("a")],
            &[("a", 14.0)],
            vec![Ok(dry_day()), Ok(dry_day())],
            vec![Err(EngineError::Actuation("relay stuck".into()))],
        )
        .await;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();

        let before = 14.0 + expected_et0(&dry_day(), TODAY);
        assert!(!report.runs[0].ok);
        assert_eq!(report.runs[0].outcome, Outcome::Failed);
        assert!((deficit(&h, "a") - before).abs() < 1e-9);
        assert_eq!(h.shared.read().await.zones["a"].status, ZoneStatus::Failed);
        assert_eq!(h.ledger.read().await.day(TODAY).unwrap().failed_runs, 1);

        // still due and eligible the next day
        let next = date!(2024 - 06 - 04);
        let report = h.engine.daily_cycle(next, now_on(next)).await.unwrap();
        assert_eq!(report.runs.len(), 1);
        assert!(report.runs[0].ok);
    }

    #[tokio::test]
    async fn partial_failure_credits_reported_water() {
        let mut h = harness(
            vec![zone("a")],
            &[("a", 14.0)],
            vec![Ok(dry_day())],
            vec![Ok(RunOutcome {
                water_applied_mm: 3.0,
                outcome: Outcome::Failed,
                detail: Some("pressure dropped".into()),
            })],
        )
        .await;
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        let before = 14.0 + expected_et0(&dry_day(), TODAY);
        assert!((deficit(&h, "a") - (before - 3.0)).abs() < 1e-9);
        // a failed zone stays eligible for a retry
        assert_eq!(h.engine.budget("a").unwrap().next_eligible_at, None);
    }

    #[tokio::test]
    async fn timeout_and_abort_credit_nothing() {
        let limit = Duration::from_secs(120);
        let elapsed = tokio::time::timeout(Duration::ZERO, std::future::pending::<EngineResult<RunOutcome>>()).await;
        let out = reported_outcome(Some(elapsed), limit);
        assert_eq!(out.outcome, Outcome::Failed);
        assert_eq!(out.water_applied_mm, 0.0);
        assert_eq!(out.detail.as_deref(), Some("no result within 120 s"));

        let out = reported_outcome(None, limit);
        assert_eq!(out.outcome, Outcome::Failed);
        assert_eq!(out.water_applied_mm, 0.0);

        let out = reported_outcome(Some(Ok(Err(EngineError::Actuation("stuck".into())))), limit);
        assert_eq!(out.detail.as_deref(), Some("actuation failure: stuck"));
    }

    #[tokio::test]
    async fn later_batches_are_stamped_when_dispatched() {
        let mut h = harness(
            vec![zone("a"), zone("b")],
            &[("a", 13.0), ("b", 20.0)],
            vec![Ok(dry_day())],
            vec![],
        )
        .await;
        *h.valve.delay.lock().unwrap() = Duration::from_millis(50);
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();

        let ledger = h.ledger.read().await;
        let first = ledger.runs_for("b").remove(0);
        let second = ledger.runs_for("a").remove(0);
        assert_eq!(first.requested_at, now_on(TODAY));
        assert!(second.requested_at >= now_on(TODAY) + time::Duration::milliseconds(50));
        assert_eq!(h.engine.budget("a").unwrap().last_run_at, Some(second.requested_at));
    }

    #[tokio::test]
    async fn dispatch_stores_in_flight_budget_before_valve_opens() {
        let mut h = harness(
            vec![zone("a")],
            &[("a", 14.0)],
            vec![Ok(dry_day())],
            vec![Err(EngineError::Actuation("relay stuck".into()))],
        )
        .await;
        *h.valve.db.lock().unwrap() = Some(h.db.clone());
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();

        // while the valve ran, storage already assumed the run completes
        let before = 14.0 + expected_et0(&dry_day(), TODAY);
        let marker = h.valve.stored().into_iter().find(|b| b.zone_id == "a").unwrap();
        assert_eq!(marker.deficit_mm, 0.0);
        assert_eq!(marker.last_run_at, Some(now_on(TODAY)));
        assert_eq!(marker.next_eligible_at, Some(now_on(date!(2024 - 06 - 04))));

        // the failed run put the zone back to due
        let stored = h.db.load_budgets().await.unwrap();
        assert!((stored[0].deficit_mm - before).abs() < 1e-9);
        assert_eq!(stored[0].next_eligible_at, None);

        // a restart that only saw the in-flight budget does not water again
        h.db.save_budget(&marker).await.unwrap();
        let mut again = Engine::new(
            h.db.clone(),
            h.weather.clone(),
            h.valve.clone(),
            Arc::new(RwLock::new(SystemState::new())),
            Arc::new(RwLock::new(HistoryLedger::new())),
            settings(),
        );
        again.load().await.unwrap();
        let report = again.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(report.replay);
        assert!(report.runs.is_empty());
        assert_eq!(h.valve.calls().len(), 1);
    }

    #[tokio::test]
    async fn owm_cycle_publishes_forecast() {
        // 2024-06-03..05 12:00 UTC
        let payload = json!({
            "timezone_offset": 0,
            "daily": [
                {"dt": 1717416000, "temp": {"min": 12.0, "max": 28.0}, "humidity": 50, "wind_speed": 2.0},
                {"dt": 1717502400, "temp": {"min": 14.0, "max": 30.0}, "humidity": 45, "rain": 2.0},
                {"dt": 1717588800, "temp": {"min": 10.0, "max": 18.0}, "humidity": 90, "rain": 12.0}
            ]
        });
        let mut h = harness(vec![zone("a")], &[], vec![Ok(payload)], vec![]).await;
        *h.weather.kind.lock().unwrap() = ProviderKind::OpenWeatherMap;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(report.completed());

        let st = h.shared.read().await;
        let days: Vec<Date> = st.weather.forecast.iter().map(|d| d.date).collect();
        assert_eq!(days, vec![date!(2024 - 06 - 04), date!(2024 - 06 - 05)]);
        assert_eq!(st.weather.forecast[1].precip_mm, 12.0);
        assert!(st.weather.forecast.iter().all(|d| d.et0_mm > 0.0));
        // the warmer day evaporates more
        assert!(st.weather.forecast[0].et0_mm > st.weather.forecast[1].et0_mm);
    }

    #[tokio::test]
    async fn watering_days_are_respected() {
        let mut z = zone("a");
        z.watering_days = vec![Weekday::Tuesday];
        let mut h = harness(vec![z], &[("a", 20.0)], vec![Ok(dry_day())], vec![]).await;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(report.runs.is_empty());
        assert!(h.valve.calls().is_empty());
    }

    #[tokio::test]
    async fn most_depleted_zone_goes_first() {
        let mut h = harness(
            vec![zone("a"), zone("b")],
            &[("a", 13.0), ("b", 20.0)],
            vec![Ok(dry_day())],
            vec![],
        )
        .await;
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        let order: Vec<String> = h.valve.calls().into_iter().map(|(z, _)| z).collect();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_batches_run_everything() {
        let mut h = harness(
            vec![zone("a"), zone("b"), zone("c")],
            &[("a", 13.0), ("b", 14.0), ("c", 15.0)],
            vec![Ok(dry_day())],
            vec![],
        )
        .await;
        h.engine.settings.max_concurrent_runs = 2;
        let report = h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert_eq!(report.runs.len(), 3);
        assert!(report.runs.iter().all(|r| r.ok));
        assert_eq!(h.valve.calls().len(), 3);
    }

    #[tokio::test]
    async fn removed_zone_loses_budget() {
        let mut h = harness(vec![zone("a"), zone("b")], &[], vec![Ok(dry_day())], vec![]).await;
        h.db.delete_zones_not_in(&["a".to_string()]).await.unwrap();
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        assert!(h.engine.budget("b").is_none());
        assert!(!h.shared.read().await.zones.contains_key("b"));
    }

    #[tokio::test]
    async fn restart_restores_budgets_and_history() {
        let mut h = harness(vec![zone("a")], &[], vec![Ok(dry_day())], vec![]).await;
        h.engine.daily_cycle(TODAY, now_on(TODAY)).await.unwrap();
        let before = deficit(&h, "a");

        let ledger: SharedLedger = Arc::new(RwLock::new(HistoryLedger::new()));
        let mut again = Engine::new(
            h.db.clone(),
            h.weather.clone(),
            h.valve.clone(),
            Arc::new(RwLock::new(SystemState::new())),
            ledger.clone(),
            settings(),
        );
        again.load().await.unwrap();
        assert_eq!(again.budget("a").unwrap().deficit_mm, before);
        assert!(ledger.read().await.day(TODAY).is_some());
    }

    // -- Manual commands ----------------------------------------------------

    #[tokio::test]
    async fn run_zone_unknown_and_disabled() {
        let mut off = zone("off");
        off.enabled = false;
        let mut h = harness(vec![off], &[], vec![], vec![]).await;
        let err = h.engine.run_zone("nope", None, now_on(TODAY)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownZone(_)));
        let err = h.engine.run_zone("off", Some(5), now_on(TODAY)).await.unwrap_err();
        assert!(matches!(err, EngineError::ZoneDisabled(_)));
    }

    #[tokio::test]
    async fn run_zone_explicit_duration_bypasses_threshold() {
        let mut h = harness(vec![zone("a")], &[("a", 3.0)], vec![], vec![]).await;
        let res = h.engine.run_zone("a", Some(1), now_on(TODAY)).await.unwrap();
        assert_eq!(res.trigger, Trigger::Manual);
        assert_eq!(res.water_applied_mm, 2.0);
        assert_eq!(deficit(&h, "a"), 1.0);
        assert_eq!(h.ledger.read().await.day(TODAY).unwrap().manual_runs, 1);
    }

    #[tokio::test]
    async fn run_zone_explicit_duration_is_used_verbatim() {
        let mut h = harness(vec![zone("a")], &[("a", 20.0)], vec![], vec![]).await;
        // longer than max_run_min
        let res = h.engine.run_zone("a", Some(90), now_on(TODAY)).await.unwrap();
        assert_eq!(h.valve.calls(), vec![("a".to_string(), 90)]);
        assert_eq!(res.duration_min, 90);
        assert_eq!(res.water_applied_mm, 180.0);
        assert_eq!(deficit(&h, "a"), 0.0);

        let runs = h.db.load_runs().await.unwrap();
        assert_eq!(runs[0].duration_min, 90);
        assert_eq!(runs[0].water_applied_mm, 180.0);
    }

    #[tokio::test]
    async fn stop_reaches_run_in_flight() {
        let h = harness(vec![zone("a")], &[("a", 20.0)], vec![], vec![]).await;
        *h.valve.hold.lock().unwrap() = true;
        let stops = h.engine.stops();
        let (handle, _commands) = command_channel(BusyPolicy::Queue, stops.clone());
        assert!(matches!(handle.stop_zone("a"), Err(EngineError::NotRunning(_))));

        let mut engine = h.engine;
        let run = tokio::spawn(async move { engine.run_zone("a", Some(30), now_on(TODAY)).await });

        let mut stopped = false;
        for _ in 0..200 {
            if handle.stop_zone("a").is_ok() {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stopped);

        let res = run.await.unwrap().unwrap();
        assert_eq!(res.outcome, Outcome::Completed);
        assert_eq!(res.duration_min, 30);
        assert_eq!(res.water_applied_mm, 1.0);
        let stored = h.db.load_budgets().await.unwrap();
        assert!((stored[0].deficit_mm - 19.0).abs() < 1e-9);
        assert!(!stops.stop("a"));
    }

    #[tokio::test]
    async fn run_zone_without_deficit_is_skipped() {
        let mut h = harness(vec![zone("a")], &[], vec![], vec![]).await;
        let res = h.engine.run_zone("a", None, now_on(TODAY)).await.unwrap();
        assert_eq!(res.outcome, Outcome::Skipped);
        assert!(h.valve.calls().is_empty());
        assert_eq!(h.ledger.read().await.runs_for("a").len(), 1);
    }

    #[tokio::test]
    async fn run_all_test_mode() {
        let mut off = zone("off");
        off.enabled = false;
        let mut h = harness(vec![zone("a"), zone("b"), off], &[("a", 10.0)], vec![], vec![]).await;
        let results = h.engine.run_all_zones(true, now_on(TODAY)).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.trigger == Trigger::Test && r.duration_min == 1));
        // test runs still credit the budget
        assert_eq!(deficit(&h, "a"), 8.0);

        let ledger = h.ledger.read().await;
        let day = ledger.day(TODAY).unwrap();
        assert_eq!(day.test_runs, 2);
        assert_eq!(day.scheduled_runs, 0);
        assert_eq!(day.scheduled_water_l, 0.0);
    }

    #[tokio::test]
    async fn run_all_manual_uses_deficits() {
        let mut h = harness(vec![zone("a"), zone("b")], &[("a", 10.0)], vec![], vec![]).await;
        let results = h.engine.run_all_zones(false, now_on(TODAY)).await.unwrap();
        assert_eq!(results[0].duration_min, 5);
        assert_eq!(results[1].outcome, Outcome::Skipped);
    }

    // -- Loop helpers -------------------------------------------------------

    #[test]
    fn cycle_due_after_run_at_once_per_day() {
        let s = settings();
        let early = datetime!(2024-06-03 05:59 UTC);
        let late = datetime!(2024-06-03 06:00:30 UTC);
        assert!(!cycle_due(&s, early, None, None));
        assert!(cycle_due(&s, late, None, None));
        assert!(!cycle_due(&s, late, Some(TODAY), None));
        assert!(cycle_due(&s, late, Some(date!(2024 - 06 - 02)), None));
    }

    #[test]
    fn cycle_due_waits_for_retry() {
        let s = settings();
        let now = datetime!(2024-06-03 07:00 UTC);
        assert!(!cycle_due(&s, now, None, Some(datetime!(2024-06-03 07:10 UTC))));
        assert!(cycle_due(&s, now, None, Some(datetime!(2024-06-03 06:50 UTC))));
    }

    #[test]
    fn cycle_due_uses_local_offset() {
        let mut s = settings();
        s.offset = offset!(+10);
        // 20:30 UTC is 06:30 the next morning at +10
        let now = datetime!(2024-06-02 20:30 UTC);
        assert!(cycle_due(&s, now, Some(date!(2024 - 06 - 02)), None));
        assert!(!cycle_due(&s, now, Some(TODAY), None));
    }

    #[tokio::test]
    async fn reject_policy_refuses_while_busy() {
        let (handle, commands) = command_channel(BusyPolicy::Reject, RunStops::default());
        commands.busy.store(true, Ordering::SeqCst);
        let err = handle.cycle().await.unwrap_err();
        assert!(matches!(err, EngineError::Busy));
    }

    #[tokio::test]
    async fn queue_policy_waits_for_loop() {
        let (handle, mut commands) = command_channel(BusyPolicy::Queue, RunStops::default());
        commands.busy.store(true, Ordering::SeqCst);

        let responder = tokio::spawn(async move {
            if let Some(Command::RunZone { zone_id, reply, .. }) = commands.recv().await {
                let _ = reply.send(Err(EngineError::UnknownZone(zone_id)));
            }
        });
        let err = handle.run_zone("zz", None).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownZone(ref z) if z == "zz"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn stopped_loop_is_reported() {
        let (handle, commands) = command_channel(BusyPolicy::Queue, RunStops::default());
        drop(commands);
        assert!(matches!(handle.run_all(false).await, Err(EngineError::Stopped)));
    }
}

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::str::FromStr;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::budget::{parse_weekday, weekday_code, Zone, ZoneBudget};
use crate::et::EtRecord;
use crate::history::{DailyHistory, Outcome, RunRecord, Trigger};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Everything a daily cycle writes, committed together.
pub struct CycleCommit<'a> {
    pub record: &'a EtRecord,
    pub precip_mm: f64,
    pub advances: &'a [ZoneAdvance],
    /// `None` when the day falls before the sealed history.
    pub history: Option<&'a DailyHistory>,
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ZoneAdvance {
    pub budget: ZoneBudget,
    pub etc_mm: f64,
    pub effective_rain_mm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleRow {
    pub day: Date,
    pub et0_mm: f64,
    pub precip_mm: f64,
    pub method: String,
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_day(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("bad date '{s}' in database"))
}

fn to_unix(t: Option<OffsetDateTime>) -> Option<i64> {
    t.map(|t| t.unix_timestamp())
}

fn from_unix(secs: Option<i64>) -> Result<Option<OffsetDateTime>> {
    secs.map(|s| OffsetDateTime::from_unix_timestamp(s).context("bad timestamp in database"))
        .transpose()
}

fn zone_from_row(r: &SqliteRow) -> Result<Zone> {
    let days: String = r.try_get("watering_days")?;
    let watering_days = days
        .split(',')
        .filter(|d| !d.is_empty())
        .map(|d| parse_weekday(d).ok_or_else(|| anyhow!("bad weekday '{d}' in database")))
        .collect::<Result<Vec<_>>>()?;
    let pin: Option<i64> = r.try_get("valve_gpio_pin")?;

    Ok(Zone {
        zone_id: r.try_get("zone_id")?,
        name: r.try_get("name")?,
        crop_coefficient: r.try_get("crop_coefficient")?,
        available_water_capacity_mm: r.try_get("available_water_capacity_mm")?,
        allowable_depletion: r.try_get("allowable_depletion")?,
        precipitation_rate_mm_per_min: r.try_get("precipitation_rate_mm_per_min")?,
        area_m2: r.try_get("area_m2")?,
        enabled: r.try_get("enabled")?,
        watering_days,
        valve_gpio_pin: pin.map(u8::try_from).transpose().context("gpio pin out of range")?,
    })
}

fn budget_from_row(r: &SqliteRow) -> Result<ZoneBudget> {
    let advanced: Option<String> = r.try_get("last_advanced_on")?;
    Ok(ZoneBudget {
        zone_id: r.try_get("zone_id")?,
        deficit_mm: r.try_get("deficit_mm")?,
        last_run_at: from_unix(r.try_get("last_run_at")?)?,
        next_eligible_at: from_unix(r.try_get("next_eligible_at")?)?,
        last_advanced_on: advanced.as_deref().map(parse_day).transpose()?,
    })
}

fn history_from_row(r: &SqliteRow) -> Result<DailyHistory> {
    let day: String = r.try_get("day")?;
    let count = |col: &str| -> Result<u32> {
        let v: i64 = r.try_get(col)?;
        Ok(u32::try_from(v).unwrap_or(0))
    };
    Ok(DailyHistory {
        date: parse_day(&day)?,
        total_et_mm: r.try_get("total_et_mm")?,
        total_rainfall_mm: r.try_get("total_rainfall_mm")?,
        total_water_used_mm: r.try_get("total_water_used_mm")?,
        total_water_used_l: r.try_get("total_water_used_l")?,
        scheduled_water_l: r.try_get("scheduled_water_l")?,
        scheduled_runs: count("scheduled_runs")?,
        manual_runs: count("manual_runs")?,
        test_runs: count("test_runs")?,
        failed_runs: count("failed_runs")?,
    })
}

fn run_from_row(r: &SqliteRow) -> Result<RunRecord> {
    let secs: i64 = r.try_get("requested_at")?;
    let offset_s: i64 = r.try_get("utc_offset_s")?;
    let offset = UtcOffset::from_whole_seconds(i32::try_from(offset_s).unwrap_or(0))
        .unwrap_or(UtcOffset::UTC);
    let trigger: String = r.try_get("run_trigger")?;
    let outcome: String = r.try_get("outcome")?;
    let duration: i64 = r.try_get("duration_min")?;

    Ok(RunRecord {
        zone_id: r.try_get("zone_id")?,
        requested_at: OffsetDateTime::from_unix_timestamp(secs)
            .context("bad requested_at in database")?
            .to_offset(offset),
        duration_min: u32::try_from(duration).unwrap_or(0),
        water_applied_mm: r.try_get("water_applied_mm")?,
        water_applied_l: r.try_get("water_applied_l")?,
        trigger: Trigger::from_str(&trigger).map_err(|e| anyhow!(e))?,
        outcome: Outcome::from_str(&outcome).map_err(|e| anyhow!(e))?,
        detail: r.try_get("detail")?,
    })
}

// ---------------------------------------------------------------------------
// Statements shared by transactions
// ---------------------------------------------------------------------------

async fn save_budget_on(conn: &mut SqliteConnection, b: &ZoneBudget) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO zone_budgets (zone_id, deficit_mm, last_run_at, next_eligible_at, last_advanced_on)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(zone_id) DO UPDATE SET
          deficit_mm=excluded.deficit_mm,
          last_run_at=excluded.last_run_at,
          next_eligible_at=excluded.next_eligible_at,
          last_advanced_on=excluded.last_advanced_on
        "#,
    )
    .bind(&b.zone_id)
    .bind(b.deficit_mm)
    .bind(to_unix(b.last_run_at))
    .bind(to_unix(b.next_eligible_at))
    .bind(b.last_advanced_on.map(|d| d.to_string()))
    .execute(conn)
    .await
    .with_context(|| format!("save budget for zone '{}' failed", b.zone_id))?;
    Ok(())
}

/// Adds `delta` onto the day's history row.
async fn add_history_on(conn: &mut SqliteConnection, delta: &DailyHistory) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_history (
          day, total_et_mm, total_rainfall_mm, total_water_used_mm, total_water_used_l,
          scheduled_water_l, scheduled_runs, manual_runs, test_runs, failed_runs
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(day) DO UPDATE SET
          total_et_mm = total_et_mm + excluded.total_et_mm,
          total_rainfall_mm = total_rainfall_mm + excluded.total_rainfall_mm,
          total_water_used_mm = total_water_used_mm + excluded.total_water_used_mm,
          total_water_used_l = total_water_used_l + excluded.total_water_used_l,
          scheduled_water_l = scheduled_water_l + excluded.scheduled_water_l,
          scheduled_runs = scheduled_runs + excluded.scheduled_runs,
          manual_runs = manual_runs + excluded.manual_runs,
          test_runs = test_runs + excluded.test_runs,
          failed_runs = failed_runs + excluded.failed_runs
        "#,
    )
    .bind(delta.date.to_string())
    .bind(delta.total_et_mm)
    .bind(delta.total_rainfall_mm)
    .bind(delta.total_water_used_mm)
    .bind(delta.total_water_used_l)
    .bind(delta.scheduled_water_l)
    .bind(i64::from(delta.scheduled_runs))
    .bind(i64::from(delta.manual_runs))
    .bind(i64::from(delta.test_runs))
    .bind(i64::from(delta.failed_runs))
    .execute(conn)
    .await
    .context("add_history failed")?;
    Ok(())
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/envirodrip/envirodrip.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        // Every connection to ":memory:" is its own database; keep exactly one.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zone config
    // ----------------------------

    pub async fn upsert_zone(&self, z: &Zone) -> Result<()> {
        let days = z
            .watering_days
            .iter()
            .map(|d| weekday_code(*d))
            .collect::<Vec<_>>()
            .join(",");
        sqlx::query(
            r#"
            INSERT INTO zones (
              zone_id, name, crop_coefficient,
              available_water_capacity_mm, allowable_depletion,
              precipitation_rate_mm_per_min, area_m2,
              enabled, watering_days, valve_gpio_pin
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              name=excluded.name,
              crop_coefficient=excluded.crop_coefficient,
              available_water_capacity_mm=excluded.available_water_capacity_mm,
              allowable_depletion=excluded.allowable_depletion,
              precipitation_rate_mm_per_min=excluded.precipitation_rate_mm_per_min,
              area_m2=excluded.area_m2,
              enabled=excluded.enabled,
              watering_days=excluded.watering_days,
              valve_gpio_pin=excluded.valve_gpio_pin
            "#,
        )
        .bind(&z.zone_id)
        .bind(&z.name)
        .bind(z.crop_coefficient)
        .bind(z.available_water_capacity_mm)
        .bind(z.allowable_depletion)
        .bind(z.precipitation_rate_mm_per_min)
        .bind(z.area_m2)
        .bind(z.enabled)
        .bind(days)
        .bind(z.valve_gpio_pin.map(i64::from))
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_zone '{}' failed", z.zone_id))?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query("SELECT * FROM zones ORDER BY zone_id")
            .fetch_all(&self.pool)
            .await
            .context("load_zones failed")?;
        rows.iter().map(zone_from_row).collect()
    }

    /// Removes zones (and, via cascade, their budgets) not in `keep`.
    /// Returns the removed ids.
    pub async fn delete_zones_not_in(&self, keep: &[String]) -> Result<Vec<String>> {
        let existing: Vec<String> = sqlx::query("SELECT zone_id FROM zones")
            .fetch_all(&self.pool)
            .await
            .context("list zones failed")?
            .iter()
            .map(|r| r.try_get("zone_id"))
            .collect::<Result<_, _>>()?;

        let mut removed = Vec::new();
        for zone_id in existing.into_iter().filter(|z| !keep.contains(z)) {
            sqlx::query("DELETE FROM zones WHERE zone_id = ?")
                .bind(&zone_id)
                .execute(&self.pool)
                .await
                .with_context(|| format!("delete zone '{zone_id}' failed"))?;
            removed.push(zone_id);
        }
        Ok(removed)
    }

    // ----------------------------
    // Budgets
    // ----------------------------

    pub async fn load_budgets(&self) -> Result<Vec<ZoneBudget>> {
        let rows = sqlx::query("SELECT * FROM zone_budgets ORDER BY zone_id")
            .fetch_all(&self.pool)
            .await
            .context("load_budgets failed")?;
        rows.iter().map(budget_from_row).collect()
    }

    pub async fn save_budget(&self, b: &ZoneBudget) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("acquire failed")?;
        save_budget_on(&mut conn, b).await
    }

    // ----------------------------
    // Cycles
    // ----------------------------

    pub async fn load_cycle(&self, day: Date) -> Result<Option<CycleRow>> {
        let row = sqlx::query("SELECT day, et0_mm, precip_mm, method FROM cycles WHERE day = ?")
            .bind(day.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("load_cycle failed")?;
        row.map(|r| -> Result<CycleRow> {
            let d: String = r.try_get("day")?;
            Ok(CycleRow {
                day: parse_day(&d)?,
                et0_mm: r.try_get("et0_mm")?,
                precip_mm: r.try_get("precip_mm")?,
                method: r.try_get("method")?,
            })
        })
        .transpose()
    }

    pub async fn latest_cycle_day(&self) -> Result<Option<Date>> {
        let row = sqlx::query("SELECT MAX(day) AS day FROM cycles")
            .fetch_one(&self.pool)
            .await
            .context("latest_cycle_day failed")?;
        let day: Option<String> = row.try_get("day")?;
        day.as_deref().map(parse_day).transpose()
    }

    /// Budgets, per-zone ET, the cycle marker and the history row for one
    /// day, in one transaction.
    pub async fn commit_cycle(&self, c: &CycleCommit<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        let day = c.record.date.to_string();

        for adv in c.advances {
            save_budget_on(&mut tx, &adv.budget).await?;
            sqlx::query(
                r#"
                INSERT INTO zone_et (day, zone_id, etc_mm, effective_rain_mm, deficit_after_mm)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&day)
            .bind(&adv.budget.zone_id)
            .bind(adv.etc_mm)
            .bind(adv.effective_rain_mm)
            .bind(adv.budget.deficit_mm)
            .execute(&mut *tx)
            .await
            .context("insert zone_et failed")?;
        }

        sqlx::query(
            r#"
            INSERT INTO cycles (day, et0_mm, precip_mm, method, completed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&day)
        .bind(c.record.et0_mm)
        .bind(c.precip_mm)
        .bind(c.record.formula.as_str())
        .bind(c.completed_at.unix_timestamp())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("cycle for {day} already committed or insert failed"))?;

        if let Some(history) = c.history {
            add_history_on(&mut tx, history).await?;
        }
        tx.commit().await.context("commit_cycle failed")?;
        Ok(())
    }

    // ----------------------------
    // Runs + history
    // ----------------------------

    /// Budget, run record and history usage for one run, in one transaction.
    pub async fn commit_run(
        &self,
        budget: Option<&ZoneBudget>,
        run: &RunRecord,
        history: &DailyHistory,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        if let Some(b) = budget {
            save_budget_on(&mut tx, b).await?;
        }
        sqlx::query(
            r#"
            INSERT INTO run_records (
              zone_id, requested_at, utc_offset_s, duration_min,
              water_applied_mm, water_applied_l, run_trigger, outcome, detail
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.zone_id)
        .bind(run.requested_at.unix_timestamp())
        .bind(i64::from(run.requested_at.offset().whole_seconds()))
        .bind(i64::from(run.duration_min))
        .bind(run.water_applied_mm)
        .bind(run.water_applied_l)
        .bind(run.trigger.as_str())
        .bind(run.outcome.as_str())
        .bind(run.detail.as_deref())
        .execute(&mut *tx)
        .await
        .context("insert run_record failed")?;

        add_history_on(&mut tx, history).await?;
        tx.commit().await.context("commit_run failed")?;
        Ok(())
    }

    pub async fn load_history(&self) -> Result<Vec<DailyHistory>> {
        let rows = sqlx::query("SELECT * FROM daily_history ORDER BY day")
            .fetch_all(&self.pool)
            .await
            .context("load_history failed")?;
        rows.iter().map(history_from_row).collect()
    }

    pub async fn load_runs(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM run_records ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_runs failed")?;
        rows.iter().map(run_from_row).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

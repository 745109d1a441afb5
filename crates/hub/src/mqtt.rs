//! MQTT plumbing: the remote valve driver and the station weather feed.
//!
//! Topics:
//!   valve/<zone_id>/run      hub -> node   {"run_id": n, "duration_min": n}
//!   valve/<zone_id>/stop     hub -> node   {"run_id": n}
//!   valve/<zone_id>/result   node -> hub   {"run_id": n, "ok": bool, "applied_min"?, "water_applied_mm"?, "error"?}
//!   tele/<station_id>/weather  station -> hub  (station report, see weather.rs)

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::{Date, OffsetDateTime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::history::Outcome;
use crate::provider::StationFeed;
use crate::valve::{RunOutcome, StopSignal, Valve};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct RunCommand {
    pub(crate) run_id: u64,
    pub(crate) duration_min: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct StopCommand {
    pub(crate) run_id: u64,
}

#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct RunResultMsg {
    /// Echo of the `run_id` the node was started with.
    pub(crate) run_id: u64,
    pub(crate) ok: bool,
    /// Minutes the node actually kept the valve open.
    #[serde(default)]
    pub(crate) applied_min: Option<f64>,
    /// Metered water, when the node has a flow sensor.
    #[serde(default)]
    pub(crate) water_applied_mm: Option<f64>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn run_topic(zone_id: &str) -> String {
    format!("valve/{zone_id}/run")
}

pub(crate) fn stop_topic(zone_id: &str) -> String {
    format!("valve/{zone_id}/stop")
}

/// Extract zone_id from "valve/<zone_id>/result".
pub(crate) fn extract_result_zone_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "valve" && parts[2] == "result" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract station_id from "tele/<station_id>/weather".
pub(crate) fn extract_station_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "weather" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Remote valve driver
// ---------------------------------------------------------------------------

struct Waiter {
    zone_id: String,
    tx: oneshot::Sender<RunResultMsg>,
}

type Pending = Arc<Mutex<HashMap<u64, Waiter>>>; // run_id -> waiter

/// Forgets a run's waiter when its future ends or is dropped, so a late
/// result finds nothing to complete.
struct PendingGuard<'a> {
    pending: &'a Pending,
    run_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.run_id);
    }
}

/// Publishes run commands and waits for the node's result message. The
/// scheduler's per-run timeout bounds the wait.
#[derive(Clone)]
pub(crate) struct MqttValve {
    client: AsyncClient,
    pending: Pending,
    next_run_id: Arc<AtomicU64>,
    rates: Arc<HashMap<String, f64>>, // zone_id -> mm/min
}

impl MqttValve {
    pub(crate) fn new(client: AsyncClient, rates: HashMap<String, f64>) -> Self {
        // Seeded from the clock so ids are not reused across restarts.
        let seed = u64::try_from(OffsetDateTime::now_utc().unix_timestamp() * 1000).unwrap_or(1);
        Self {
            client,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_run_id: Arc::new(AtomicU64::new(seed)),
            rates: Arc::new(rates),
        }
    }

    /// Route a result message to the run it belongs to. Returns false when
    /// no run with that id is waiting on that zone (late, duplicate or
    /// foreign result).
    pub(crate) fn complete(&self, zone_id: &str, msg: RunResultMsg) -> bool {
        let waiter = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            let ours = pending.get(&msg.run_id).is_some_and(|w| w.zone_id == zone_id);
            if ours {
                pending.remove(&msg.run_id)
            } else {
                None
            }
        };
        match waiter {
            Some(w) => w.tx.send(msg).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    fn pending_runs(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    async fn publish<T: Serialize>(&self, topic: String, msg: &T) -> EngineResult<()> {
        let payload = serde_json::to_vec(msg).map_err(|e| EngineError::Actuation(e.to_string()))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| EngineError::TransientNetwork(format!("publish failed: {e}")))
    }
}

fn outcome_from_result(msg: RunResultMsg, duration_min: u32, rate: f64) -> RunOutcome {
    let water_applied_mm = match (msg.water_applied_mm, msg.applied_min) {
        (Some(mm), _) => mm.max(0.0),
        (None, Some(min)) => (min.max(0.0) * rate).max(0.0),
        (None, None) if msg.ok => f64::from(duration_min) * rate,
        (None, None) => 0.0,
    };
    RunOutcome {
        water_applied_mm,
        outcome: if msg.ok {
            Outcome::Completed
        } else {
            Outcome::Failed
        },
        detail: msg.error,
    }
}

#[async_trait]
impl Valve for MqttValve {
    async fn start_zone(&self, zone_id: &str, duration_min: u32, mut stop: StopSignal) -> EngineResult<RunOutcome> {
        let rate = *self
            .rates
            .get(zone_id)
            .ok_or_else(|| EngineError::UnknownZone(zone_id.to_string()))?;

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        let waiter = Waiter {
            zone_id: zone_id.to_string(),
            tx,
        };
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id, waiter);
        let _guard = PendingGuard {
            pending: &self.pending,
            run_id,
        };

        self.publish(run_topic(zone_id), &RunCommand { run_id, duration_min })
            .await?;
        debug!(zone = %zone_id, run_id, duration_min, "run command published");

        let went_away = || EngineError::TransientNetwork(format!("valve node for '{zone_id}' went away"));
        let msg = tokio::select! {
            res = &mut rx => res.map_err(|_| went_away())?,
            _ = stop.requested() => {
                info!(zone = %zone_id, run_id, "stop requested, waiting for node result");
                self.publish(stop_topic(zone_id), &StopCommand { run_id }).await?;
                rx.await.map_err(|_| went_away())?
            }
        };
        Ok(outcome_from_result(msg, duration_min, rate))
    }
}

// ---------------------------------------------------------------------------
// Incoming publishes
// ---------------------------------------------------------------------------

/// Dispatch one incoming publish. `today` dates station reports that do not
/// carry their own date.
pub(crate) fn handle_publish(
    topic: &str,
    payload: &[u8],
    valve: Option<&MqttValve>,
    feed: Option<&StationFeed>,
    today: Date,
) {
    if let Some(zone_id) = extract_result_zone_id(topic) {
        let Some(valve) = valve else { return };
        match serde_json::from_slice::<RunResultMsg>(payload) {
            Ok(msg) => {
                if !valve.complete(zone_id, msg) {
                    warn!(zone = %zone_id, "result with no run waiting");
                }
            }
            Err(e) => warn!(zone = %zone_id, error = %e, "bad result payload"),
        }
    } else if let Some(station_id) = extract_station_id(topic) {
        let Some(feed) = feed else { return };
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(report) => feed.ingest(station_id, report, today),
            Err(e) => warn!(station = %station_id, error = %e, "bad weather payload"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

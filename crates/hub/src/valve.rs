//! Valve control. The engine talks to a `Valve`; the hub ships a relay board
//! driver (`RelayValve`) here and an MQTT remote driver in `mqtt.rs`.
//!
//! The `gpio` feature gates the real rppal driver; without it, a mock board
//! tracks on/off state and logs changes.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::error::{EngineError, EngineResult};
use crate::history::Outcome;

/// What a valve reports back after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub water_applied_mm: f64,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

#[async_trait]
pub trait Valve: Send + Sync {
    /// Open the zone's valve for `duration_min` minutes and report what was
    /// applied. A run cut short by `stop` reports only the water applied
    /// until then. `Err` means nothing is known to have been applied.
    async fn start_zone(&self, zone_id: &str, duration_min: u32, stop: StopSignal) -> EngineResult<RunOutcome>;
}

// ---------------------------------------------------------------------------
// Stop requests
// ---------------------------------------------------------------------------

type StopSlots = Arc<Mutex<HashMap<String, (u64, watch::Sender<bool>)>>>;

/// Stop requests for runs in flight, keyed by zone. Shared between the
/// scheduler, which registers runs, and the API, which stops them without
/// going through the command queue.
#[derive(Clone, Default)]
pub struct RunStops {
    slots: StopSlots,
    next_id: Arc<AtomicU64>,
}

impl RunStops {
    /// Register a run on `zone_id`. The registration lives as long as the
    /// returned signal.
    pub(crate) fn register(&self, zone_id: &str) -> StopSignal {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(zone_id.to_string(), (id, tx));
        StopSignal {
            rx: Some(rx),
            slot: Some((self.clone(), zone_id.to_string(), id)),
        }
    }

    /// Ask the run in flight on `zone_id` to stop. False when there is none.
    pub fn stop(&self, zone_id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        match slots.get(zone_id) {
            Some((_, tx)) => tx.send(true).is_ok(),
            None => false,
        }
    }

    fn release(&self, zone_id: &str, id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(zone_id).is_some_and(|(current, _)| *current == id) {
            slots.remove(zone_id);
        }
    }
}

/// A run's view of its stop request.
pub struct StopSignal {
    rx: Option<watch::Receiver<bool>>,
    slot: Option<(RunStops, String, u64)>,
}

impl StopSignal {
    /// A signal nobody can trigger.
    #[cfg(test)]
    pub(crate) fn never() -> Self {
        Self { rx: None, slot: None }
    }

    /// Resolves once a stop is requested; pending forever otherwise.
    pub async fn requested(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|stop| *stop).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

impl Drop for StopSignal {
    fn drop(&mut self) {
        if let Some((stops, zone_id, id)) = self.slot.take() {
            stops.release(&zone_id, id);
        }
    }
}

// ---------------------------------------------------------------------------

pub(crate) type SharedBoard = Arc<Mutex<ValveBoard>>;

fn lock(board: &SharedBoard) -> MutexGuard<'_, ValveBoard> {
    board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs zones on the local relay board. Water applied is the zone's nominal
/// precipitation rate times the minutes the relay was held open.
pub(crate) struct RelayValve {
    board: SharedBoard,
    rates: HashMap<String, f64>, // zone_id -> mm/min
}

/// Closes the relay if the run future is dropped (timeout, shutdown).
struct CloseOnDrop<'a> {
    board: &'a SharedBoard,
    zone_id: &'a str,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(zone = %self.zone_id, "run interrupted, closing valve");
            let _ = lock(self.board).set(self.zone_id, false);
        }
    }
}

impl RelayValve {
    pub(crate) fn new(board: SharedBoard, rates: HashMap<String, f64>) -> Self {
        Self { board, rates }
    }

    #[cfg(test)]
    pub(crate) fn board(&self) -> SharedBoard {
        self.board.clone()
    }
}

#[async_trait]
impl Valve for RelayValve {
    async fn start_zone(&self, zone_id: &str, duration_min: u32, mut stop: StopSignal) -> EngineResult<RunOutcome> {
        let rate = *self
            .rates
            .get(zone_id)
            .ok_or_else(|| EngineError::UnknownZone(zone_id.to_string()))?;

        if duration_min == 0 {
            return Ok(RunOutcome {
                water_applied_mm: 0.0,
                outcome: Outcome::Skipped,
                detail: None,
            });
        }

        lock(&self.board).set(zone_id, true)?;
        let mut guard = CloseOnDrop {
            board: &self.board,
            zone_id,
            armed: true,
        };

        let started = tokio::time::Instant::now();
        let stopped = tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(u64::from(duration_min) * 60)) => false,
            _ = stop.requested() => true,
        };

        guard.armed = false;
        lock(&self.board).set(zone_id, false)?;

        let minutes = if stopped {
            (started.elapsed().as_secs_f64() / 60.0).min(f64::from(duration_min))
        } else {
            f64::from(duration_min)
        };
        if stopped {
            info!(zone = %zone_id, minutes, "run stopped early");
        }

        Ok(RunOutcome {
            water_applied_mm: rate * minutes,
            outcome: Outcome::Completed,
            detail: stopped.then(|| format!("stopped after {minutes:.1} min")),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

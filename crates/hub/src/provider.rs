//! Weather sources: where raw daily payloads come from. Normalization lives
//! in `weather.rs`; sources only fetch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::macros::format_description;
use time::Date;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::weather::ProviderKind;

const OWM_BASE_URL: &str = "https://api.openweathermap.org/data/3.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Station reports kept in memory.
const STATION_DAYS_KEPT: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Raw payload covering `date` at `location`.
    async fn fetch_daily(&self, location: &Location, date: Date) -> EngineResult<Value>;
}

// ---------------------------------------------------------------------------
// OpenWeatherMap One Call 3.0
// ---------------------------------------------------------------------------

pub struct OwmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OwmClient {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: OWM_BASE_URL.to_string(),
        })
    }

    fn url(&self, location: &Location) -> String {
        format!(
            "{}/onecall?lat={}&lon={}&appid={}&units=metric&exclude=minutely,hourly,alerts",
            self.base_url, location.latitude, location.longitude, self.api_key
        )
    }
}

#[async_trait]
impl WeatherSource for OwmClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenWeatherMap
    }

    async fn fetch_daily(&self, location: &Location, date: Date) -> EngineResult<Value> {
        debug!(%date, lat = location.latitude, lon = location.longitude, "fetching OpenWeatherMap");

        let response = self
            .client
            .get(self.url(location))
            .send()
            .await
            .map_err(|e| EngineError::TransientNetwork(format!("OpenWeatherMap: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(EngineError::TransientNetwork(format!(
                "OpenWeatherMap returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Provider(format!(
                "OpenWeatherMap returned {status}: {body}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::Provider(format!("OpenWeatherMap body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Station feed (pushed over MQTT)
// ---------------------------------------------------------------------------

/// Latest reports from one weather station, keyed by the day they cover.
#[derive(Clone)]
pub struct StationFeed {
    station_id: String,
    reports: Arc<RwLock<BTreeMap<Date, Value>>>,
}

impl StationFeed {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            reports: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Store a report. Reports without a `date` field are taken to cover
    /// `today`; a newer report for the same day replaces the older one.
    pub fn ingest(&self, station_id: &str, report: Value, today: Date) {
        if station_id != self.station_id {
            debug!(station = %station_id, "ignoring report from unconfigured station");
            return;
        }
        let date = report
            .get("date")
            .and_then(Value::as_str)
            .and_then(|s| Date::parse(s, format_description!("[year]-[month]-[day]")).ok())
            .unwrap_or(today);

        let mut reports = self.reports.write().unwrap_or_else(|p| p.into_inner());
        reports.insert(date, report);
        while reports.len() > STATION_DAYS_KEPT {
            reports.pop_first();
        }
    }

    pub fn report_for(&self, date: Date) -> Option<Value> {
        self.reports
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&date)
            .cloned()
    }
}

#[async_trait]
impl WeatherSource for StationFeed {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Station
    }

    async fn fetch_daily(&self, _location: &Location, date: Date) -> EngineResult<Value> {
        self.report_for(date).ok_or_else(|| {
            EngineError::TransientNetwork(format!(
                "no report from station '{}' for {date}",
                self.station_id
            ))
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

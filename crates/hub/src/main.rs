mod budget;
mod config;
mod db;
mod error;
mod et;
mod history;
mod mqtt;
mod provider;
mod scheduler;
mod state;
mod valve;
mod weather;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::ValveDriver;
use db::Db;
use history::HistoryLedger;
use mqtt::MqttValve;
use provider::{OwmClient, StationFeed, WeatherSource};
use scheduler::Engine;
use state::SystemState;
use valve::{RelayValve, SharedBoard, Valve, ValveBoard};
use weather::ProviderKind;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:envirodrip.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed zones) ─────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let settings = cfg.settings()?;

    // Zones in the database are the source of truth from here on.
    let zones = db.load_zones().await?;
    if zones.is_empty() {
        warn!("no zones configured");
    }
    let rates: HashMap<String, f64> = zones
        .iter()
        .map(|z| (z.zone_id.clone(), z.precipitation_rate_mm_per_min))
        .collect();
    info!(property = %cfg.property.name, zones = zones.len(), "db ready");

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("envirodrip-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Weather source ──────────────────────────────────────────────
    let mut station: Option<StationFeed> = None;
    let weather: Arc<dyn WeatherSource> = match cfg.weather.provider {
        ProviderKind::OpenWeatherMap => {
            let key = cfg
                .weather
                .api_key
                .clone()
                .context("openweathermap provider needs an api_key")?;
            Arc::new(OwmClient::new(key)?)
        }
        ProviderKind::Station => {
            let station_id = cfg
                .weather
                .station_id
                .clone()
                .context("station provider needs a station_id")?;
            client
                .subscribe(format!("tele/{station_id}/weather"), QoS::AtLeastOnce)
                .await?;
            info!(station = %station_id, "subscribed to station weather");
            let feed = StationFeed::new(station_id);
            station = Some(feed.clone());
            Arc::new(feed)
        }
    };

    // ── Valves ──────────────────────────────────────────────────────
    let mut board: Option<SharedBoard> = None;
    let mut mqtt_valve: Option<MqttValve> = None;
    let valve: Arc<dyn Valve> = match cfg.valves.driver {
        ValveDriver::Gpio => {
            // Many common relay boards are active-low. If yours is active-high, set false.
            let active_low = env::var("RELAY_ACTIVE_LOW")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true);
            let zone_to_gpio: Vec<(String, u8)> = zones
                .iter()
                .filter_map(|z| z.valve_gpio_pin.map(|pin| (z.zone_id.clone(), pin)))
                .collect();
            let mut relays = ValveBoard::new(&zone_to_gpio, active_low)?;
            relays.all_off();
            let relays: SharedBoard = Arc::new(Mutex::new(relays));
            board = Some(relays.clone());
            Arc::new(RelayValve::new(relays, rates))
        }
        ValveDriver::Mqtt => {
            client.subscribe("valve/+/result", QoS::AtLeastOnce).await?;
            info!("subscribed to valve/+/result");
            let v = MqttValve::new(client.clone(), rates);
            mqtt_valve = Some(v.clone());
            Arc::new(v)
        }
    };

    // ── Shared state ────────────────────────────────────────────────
    let shared = Arc::new(RwLock::new(SystemState::new()));
    let ledger = Arc::new(RwLock::new(HistoryLedger::new()));
    shared.write().await.record_system("hub started".to_string());

    // ── Scheduler ───────────────────────────────────────────────────
    let offset = settings.offset;
    let busy_policy = settings.busy_policy;
    let mut engine = Engine::new(
        db.clone(),
        weather,
        valve,
        Arc::clone(&shared),
        Arc::clone(&ledger),
        settings,
    );
    engine.load().await?;
    let (handle, commands) = scheduler::command_channel(busy_policy, engine.stops());
    tokio::spawn(engine.run(commands));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: Arc::clone(&shared),
        ledger,
        scheduler: handle,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── MQTT loop ───────────────────────────────────────────────────
    loop {
        let event = tokio::select! {
            ev = eventloop.poll() => ev,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                if let Some(b) = &board {
                    b.lock().unwrap_or_else(|p| p.into_inner()).all_off();
                }
                return Ok(());
            }
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let today = OffsetDateTime::now_utc().to_offset(offset).date();
                mqtt::handle_publish(&p.topic, &p.payload, mqtt_valve.as_ref(), station.as_ref(), today);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

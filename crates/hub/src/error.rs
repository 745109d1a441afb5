//! Engine error taxonomy. Plumbing (config loading, db setup) stays on
//! `anyhow`; anything the scheduler has to make a per-zone decision about is
//! one of these.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A required weather field is missing and cannot be approximated.
    #[error("weather data incomplete: {0}")]
    DataIncomplete(String),

    /// Provider payload is malformed. Recovers on the next cycle.
    #[error("weather provider error: {0}")]
    Provider(String),

    /// Invalid zone parameters. Fatal to that zone's cycle only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Weather source or valve unreachable.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The valve reported a failure.
    #[error("actuation failure: {0}")]
    Actuation(String),

    #[error("unknown zone '{0}'")]
    UnknownZone(String),

    #[error("zone '{0}' is disabled")]
    ZoneDisabled(String),

    /// A stop was requested for a zone with no run in flight.
    #[error("zone '{0}' is not running")]
    NotRunning(String),

    /// A trigger arrived while a cycle was running and the busy policy is
    /// `reject`.
    #[error("scheduler busy: a cycle is already in progress")]
    Busy,

    /// The scheduler loop has exited.
    #[error("scheduler stopped")]
    Stopped,

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Short machine-readable kind, used in status snapshots and the API.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataIncomplete(_) => "data_incomplete",
            Self::Provider(_) => "provider",
            Self::Configuration(_) => "configuration",
            Self::TransientNetwork(_) => "transient_network",
            Self::Actuation(_) => "actuation",
            Self::UnknownZone(_) => "unknown_zone",
            Self::ZoneDisabled(_) => "zone_disabled",
            Self::NotRunning(_) => "not_running",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Storage(_) => "storage",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

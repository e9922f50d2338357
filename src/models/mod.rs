use serde::{Deserialize, Serialize};

// ── Station ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Station {
    pub station_id: String,
    pub name: String,
    pub altitude: Option<f64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub county: Option<String>,
    pub address: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub remark: Option<String>,
    /// 1 = active, 0 = retired. Only active stations get realtime fetches.
    pub state: i32,
}

impl Station {
    pub fn is_active(&self) -> bool {
        self.state == STATION_ACTIVE
    }
}

pub const STATION_ACTIVE: i32 = 1;
pub const STATION_RETIRED: i32 = 0;

// ── Realtime observation ──────────────────────────────────────────────────────

/// Latest reading per station; overwritten on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeObservation {
    pub station_id: String,
    pub station_name: String,
    /// Epoch seconds.
    pub obs_time: i64,
    pub precipitation: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub uv_index: Option<f64>,
}

// ── Historical observation ────────────────────────────────────────────────────

/// Daily aggregate, keyed by (station_id, obs_date).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoricalObservation {
    pub station_id: String,
    pub station_name: String,
    /// Epoch seconds of the upstream-local midnight.
    pub obs_date: i64,
    pub station_pressure: Option<f64>,
    pub sea_pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub t_max: Option<f64>,
    pub t_min: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub gust_max: Option<f64>,
    pub gust_direction: Option<f64>,
    pub precipitation: Option<f64>,
    pub precipitation_hours: Option<f64>,
    pub sunshine_hours: Option<f64>,
    pub sunshine_rate: Option<f64>,
    pub global_radiation: Option<f64>,
    pub visibility_mean: Option<f64>,
    pub uv_max: Option<f64>,
    pub cloud_amount: Option<f64>,
}

// ── Query views ───────────────────────────────────────────────────────────────

/// Realtime row joined with its station's location.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RealtimeView {
    pub station_id: String,
    pub station_name: String,
    pub altitude: Option<f64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub obs_time: i64,
    pub precipitation: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub uv_index: Option<f64>,
}

/// `{"data": [...]}` envelope used by every read command.
#[derive(Debug, Serialize)]
pub struct DataEnvelope<T> {
    pub data: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
}

impl<T> DataEnvelope<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data, stale: None }
    }

    pub fn with_staleness(data: Vec<T>, stale: bool) -> Self {
        Self { data, stale: Some(stale) }
    }
}

// ── Raw roster rows ───────────────────────────────────────────────────────────

/// One `<tr>` of the station roster, cells still as text.
#[derive(Debug, Clone, Default)]
pub struct RawStationRow {
    pub station_id: Option<String>,
    pub name: Option<String>,
    pub station_type: Option<String>,
    pub altitude: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
    pub county: Option<String>,
    pub address: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub remark: Option<String>,
}

/// Station code and display name, shared with fan-out workers.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRef {
    pub station_id: String,
    pub name: String,
}

pub mod upsert;

use crate::models::{
    HistoricalObservation, RealtimeObservation, RealtimeView, Station, StationRef,
    STATION_ACTIVE,
};
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::types::Value;
use duckdb::{params, params_from_iter, Connection, Row};
use std::path::Path;
use tracing::info;

use self::upsert::{opt_f64, opt_text, text, TableSpec, UpsertRecord};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS stations (
    station_id  VARCHAR PRIMARY KEY,
    name        VARCHAR NOT NULL,
    altitude    DOUBLE,
    longitude   DOUBLE,
    latitude    DOUBLE,
    county      VARCHAR,
    address     VARCHAR,
    start_date  VARCHAR,
    end_date    VARCHAR,
    remark      VARCHAR,
    -- 1 = active, 0 = retired
    state       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS realtime_observations (
    station_id          VARCHAR PRIMARY KEY,
    station_name        VARCHAR,
    obs_time            BIGINT NOT NULL,
    precipitation       DOUBLE,
    wind_direction      DOUBLE,
    wind_speed          DOUBLE,
    temperature         DOUBLE,
    relative_humidity   DOUBLE,
    uv_index            DOUBLE
);

CREATE TABLE IF NOT EXISTS historical_observations (
    station_id          VARCHAR NOT NULL,
    station_name        VARCHAR,
    obs_date            BIGINT  NOT NULL,
    station_pressure    DOUBLE,
    sea_pressure        DOUBLE,
    temperature         DOUBLE,
    t_max               DOUBLE,
    t_min               DOUBLE,
    relative_humidity   DOUBLE,
    wind_speed          DOUBLE,
    wind_direction      DOUBLE,
    gust_max            DOUBLE,
    gust_direction      DOUBLE,
    precipitation       DOUBLE,
    precipitation_hours DOUBLE,
    sunshine_hours      DOUBLE,
    sunshine_rate       DOUBLE,
    global_radiation    DOUBLE,
    visibility_mean     DOUBLE,
    uv_max              DOUBLE,
    cloud_amount        DOUBLE,
    PRIMARY KEY (station_id, obs_date)
);

CREATE SEQUENCE IF NOT EXISTS refresh_run_seq START 1;

CREATE TABLE IF NOT EXISTS refresh_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('refresh_run_seq'),
    mode                VARCHAR NOT NULL,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    stations_written    BIGINT DEFAULT 0,
    realtime_written    BIGINT DEFAULT 0,
    history_written     BIGINT DEFAULT 0,
    failed_batches      BIGINT DEFAULT 0,
    -- NULL when the run did not attempt a realtime refresh
    realtime_stale      BOOLEAN,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS pipeline_state (
    id              INTEGER PRIMARY KEY,
    initialized_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_history_date    ON historical_observations (obs_date);
CREATE INDEX IF NOT EXISTS idx_history_station ON historical_observations (station_id);
"#;

// ── Record ↔ table mapping ────────────────────────────────────────────────────

impl UpsertRecord for Station {
    const SPEC: TableSpec = TableSpec {
        table: "stations",
        columns: &[
            "station_id", "name", "altitude", "longitude", "latitude", "county", "address",
            "start_date", "end_date", "remark", "state",
        ],
        key_columns: &["station_id"],
    };

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.station_id),
            text(&self.name),
            opt_f64(self.altitude),
            opt_f64(self.longitude),
            opt_f64(self.latitude),
            opt_text(self.county.as_deref()),
            opt_text(self.address.as_deref()),
            opt_text(self.start_date.as_deref()),
            opt_text(self.end_date.as_deref()),
            opt_text(self.remark.as_deref()),
            Value::Int(self.state),
        ]
    }
}

impl UpsertRecord for RealtimeObservation {
    const SPEC: TableSpec = TableSpec {
        table: "realtime_observations",
        columns: &[
            "station_id", "station_name", "obs_time", "precipitation", "wind_direction",
            "wind_speed", "temperature", "relative_humidity", "uv_index",
        ],
        key_columns: &["station_id"],
    };

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.station_id),
            text(&self.station_name),
            Value::BigInt(self.obs_time),
            opt_f64(self.precipitation),
            opt_f64(self.wind_direction),
            opt_f64(self.wind_speed),
            opt_f64(self.temperature),
            opt_f64(self.relative_humidity),
            opt_f64(self.uv_index),
        ]
    }
}

impl UpsertRecord for HistoricalObservation {
    const SPEC: TableSpec = TableSpec {
        table: "historical_observations",
        columns: HISTORY_COLUMNS,
        key_columns: &["station_id", "obs_date"],
    };

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.station_id),
            text(&self.station_name),
            Value::BigInt(self.obs_date),
            opt_f64(self.station_pressure),
            opt_f64(self.sea_pressure),
            opt_f64(self.temperature),
            opt_f64(self.t_max),
            opt_f64(self.t_min),
            opt_f64(self.relative_humidity),
            opt_f64(self.wind_speed),
            opt_f64(self.wind_direction),
            opt_f64(self.gust_max),
            opt_f64(self.gust_direction),
            opt_f64(self.precipitation),
            opt_f64(self.precipitation_hours),
            opt_f64(self.sunshine_hours),
            opt_f64(self.sunshine_rate),
            opt_f64(self.global_radiation),
            opt_f64(self.visibility_mean),
            opt_f64(self.uv_max),
            opt_f64(self.cloud_amount),
        ]
    }
}

const HISTORY_COLUMNS: &[&str] = &[
    "station_id", "station_name", "obs_date", "station_pressure", "sea_pressure",
    "temperature", "t_max", "t_min", "relative_humidity", "wind_speed", "wind_direction",
    "gust_max", "gust_direction", "precipitation", "precipitation_hours", "sunshine_hours",
    "sunshine_rate", "global_radiation", "visibility_mean", "uv_max", "cloud_amount",
];

fn history_from_row(r: &Row<'_>) -> duckdb::Result<HistoricalObservation> {
    Ok(HistoricalObservation {
        station_id: r.get(0)?,
        station_name: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
        obs_date: r.get(2)?,
        station_pressure: r.get(3)?,
        sea_pressure: r.get(4)?,
        temperature: r.get(5)?,
        t_max: r.get(6)?,
        t_min: r.get(7)?,
        relative_humidity: r.get(8)?,
        wind_speed: r.get(9)?,
        wind_direction: r.get(10)?,
        gust_max: r.get(11)?,
        gust_direction: r.get(12)?,
        precipitation: r.get(13)?,
        precipitation_hours: r.get(14)?,
        sunshine_hours: r.get(15)?,
        sunshine_rate: r.get(16)?,
        global_radiation: r.get(17)?,
        visibility_mean: r.get(18)?,
        uv_max: r.get(19)?,
        cloud_amount: r.get(20)?,
    })
}

fn station_from_row(r: &Row<'_>) -> duckdb::Result<Station> {
    Ok(Station {
        station_id: r.get(0)?,
        name: r.get(1)?,
        altitude: r.get(2)?,
        longitude: r.get(3)?,
        latitude: r.get(4)?,
        county: r.get(5)?,
        address: r.get(6)?,
        start_date: r.get(7)?,
        end_date: r.get(8)?,
        remark: r.get(9)?,
        state: r.get(10)?,
    })
}

// ── Run log ───────────────────────────────────────────────────────────────────

/// Outcome counters written to `refresh_runs` when a run finishes.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stations_written: usize,
    pub realtime_written: usize,
    pub history_written: usize,
    pub failed_batches: usize,
    pub realtime_stale: Option<bool>,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn status(&self) -> &'static str {
        if self.error.is_some() {
            "error"
        } else if self.failed_batches > 0 || self.realtime_stale == Some(true) {
            "partial"
        } else {
            "success"
        }
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Initialization marker ─────────────────────────────────────────────────

    /// When the first full initialization completed, if it ever did.
    pub fn initialized_at(&self) -> Result<Option<NaiveDateTime>> {
        let mut stmt = self
            .conn
            .prepare("SELECT initialized_at FROM pipeline_state WHERE id = 1")
            .context("Initialization marker unreadable")?;
        let mut rows = stmt.query_map([], |r| r.get::<_, NaiveDateTime>(0))?;
        Ok(rows.next().transpose()?)
    }

    /// Record a completed initialization. The first timestamp is kept.
    pub fn mark_initialized(&self) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pipeline_state (id, initialized_at) VALUES (1, ?) ON CONFLICT (id) DO NOTHING",
            params![Utc::now().naive_utc()],
        )?;
        Ok(())
    }

    // ── Stations ──────────────────────────────────────────────────────────────

    pub fn list_stations(&self) -> Result<Vec<Station>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT station_id, name, altitude, longitude, latitude, county, address,
                      start_date, end_date, remark, state
               FROM stations ORDER BY station_id"#,
        )?;
        let stations = stmt
            .query_map([], station_from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(stations)
    }

    /// Code → name pairs, optionally limited to active stations.
    pub fn station_refs(&self, active_only: bool) -> Result<Vec<StationRef>> {
        let filter = if active_only {
            format!("WHERE state = {}", STATION_ACTIVE)
        } else {
            String::new()
        };
        let sql = format!("SELECT station_id, name FROM stations {} ORDER BY station_id", filter);
        let mut stmt = self.conn.prepare(&sql)?;
        let refs = stmt
            .query_map([], |r| {
                Ok(StationRef {
                    station_id: r.get(0)?,
                    name: r.get(1)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(refs)
    }

    // ── Realtime ──────────────────────────────────────────────────────────────

    /// Latest readings of active stations, joined with station location.
    pub fn latest_realtime(&self) -> Result<Vec<RealtimeView>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT s.station_id, s.name, s.altitude, s.longitude, s.latitude,
                      r.obs_time, r.precipitation, r.wind_direction, r.wind_speed,
                      r.temperature, r.relative_humidity, r.uv_index
               FROM stations s
               JOIN realtime_observations r ON s.station_id = r.station_id
               WHERE s.state = ?
               ORDER BY s.station_id"#,
        )?;
        let rows = stmt
            .query_map(params![STATION_ACTIVE], |r| {
                Ok(RealtimeView {
                    station_id: r.get(0)?,
                    station_name: r.get(1)?,
                    altitude: r.get(2)?,
                    longitude: r.get(3)?,
                    latitude: r.get(4)?,
                    obs_time: r.get(5)?,
                    precipitation: r.get(6)?,
                    wind_direction: r.get(7)?,
                    wind_speed: r.get(8)?,
                    temperature: r.get(9)?,
                    relative_humidity: r.get(10)?,
                    uv_index: r.get(11)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── History ───────────────────────────────────────────────────────────────

    /// Daily rows for the given stations with `start <= obs_date <= end`.
    pub fn history(&self, station_ids: &[String], start: i64, end: i64) -> Result<Vec<HistoricalObservation>> {
        if station_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; station_ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM historical_observations \
             WHERE station_id IN ({}) AND obs_date BETWEEN ? AND ? \
             ORDER BY station_id, obs_date",
            HISTORY_COLUMNS.join(", "),
            placeholders
        );

        let mut args: Vec<Value> = station_ids.iter().map(|s| text(s)).collect();
        args.push(Value::BigInt(start));
        args.push(Value::BigInt(end));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), history_from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent stored observation date (epoch seconds).
    pub fn latest_obs_date(&self) -> Result<Option<i64>> {
        let mut s = self.conn.prepare("SELECT MAX(obs_date) FROM historical_observations")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn history_date_range(&self) -> Result<(Option<i64>, Option<i64>)> {
        let mut s = self
            .conn
            .prepare("SELECT MIN(obs_date), MAX(obs_date) FROM historical_observations")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Counts ────────────────────────────────────────────────────────────────

    pub fn station_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM stations")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn realtime_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM realtime_observations")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn history_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM historical_observations")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Refresh run log ───────────────────────────────────────────────────────

    pub fn begin_refresh_run(&self, mode: &str) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO refresh_runs (mode, started_at, status) VALUES (?, ?, 'running') RETURNING id",
            params![mode, Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_refresh_run(&self, run_id: i64, summary: &RunSummary) -> Result<()> {
        self.conn.execute(
            r#"UPDATE refresh_runs SET
               finished_at = ?, status = ?,
               stations_written = ?, realtime_written = ?, history_written = ?,
               failed_batches = ?, realtime_stale = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                summary.status(),
                summary.stations_written as i64,
                summary.realtime_written as i64,
                summary.history_written as i64,
                summary.failed_batches as i64,
                summary.realtime_stale,
                summary.error,
                run_id,
            ],
        )?;
        Ok(())
    }

    /// Whether the most recent realtime refresh attempt failed.
    pub fn realtime_is_stale(&self) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT realtime_stale FROM refresh_runs \
             WHERE realtime_stale IS NOT NULL ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], |r| r.get::<_, bool>(0))?;
        Ok(rows.next().transpose()?.unwrap_or(false))
    }

    /// Status of the latest finished run: (mode, status).
    pub fn last_run(&self) -> Result<Option<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT mode, status FROM refresh_runs ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.next().transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::STATION_RETIRED;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn station(id: &str, name: &str, state: i32) -> Station {
        Station {
            station_id: id.into(),
            name: name.into(),
            altitude: Some(6.3),
            longitude: Some(121.5),
            latitude: Some(25.0),
            county: Some("臺北市".into()),
            address: None,
            start_date: None,
            end_date: if state == STATION_RETIRED { Some("2020/01/01".into()) } else { None },
            remark: None,
            state,
        }
    }

    fn day(id: &str, obs_date: i64, temperature: f64) -> HistoricalObservation {
        HistoricalObservation {
            station_id: id.into(),
            station_name: "臺北".into(),
            obs_date,
            temperature: Some(temperature),
            ..Default::default()
        }
    }

    fn reading(id: &str, obs_time: i64, temperature: f64) -> RealtimeObservation {
        RealtimeObservation {
            station_id: id.into(),
            station_name: id.into(),
            obs_time,
            precipitation: Some(0.0),
            wind_direction: Some(90.0),
            wind_speed: Some(1.0),
            temperature: Some(temperature),
            relative_humidity: Some(70.0),
            uv_index: None,
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.station_count().unwrap(), 0);
    }

    #[test]
    fn test_history_upsert_last_write_wins() {
        let repo = repo();
        repo.upsert(&[day("A", 100, 20.0)], 1000).unwrap();
        repo.upsert(&[day("A", 100, 21.0)], 1000).unwrap();

        let rows = repo.history(&["A".to_string()], 0, 200).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, Some(21.0));
    }

    #[test]
    fn test_upsert_is_idempotent_for_all_tables() {
        let repo = repo();
        let stations = vec![station("A", "Alpha", STATION_ACTIVE), station("B", "Beta", STATION_RETIRED)];
        let realtime = vec![reading("A", 1_700_000_000, 18.0)];
        let history = vec![day("A", 100, 20.0), day("A", 200, 22.0), day("B", 100, 19.0)];

        for _ in 0..2 {
            assert!(repo.upsert(&stations, 1000).unwrap().is_complete());
            assert!(repo.upsert(&realtime, 1000).unwrap().is_complete());
            assert!(repo.upsert(&history, 2).unwrap().is_complete());
        }

        assert_eq!(repo.list_stations().unwrap(), stations);
        assert_eq!(repo.realtime_count().unwrap(), 1);
        assert_eq!(repo.history_count().unwrap(), 3);
        let both = repo.history(&["A".to_string(), "B".to_string()], 0, 1000).unwrap();
        assert_eq!(both, {
            let mut h = history.clone();
            h.sort_by(|a, b| (&a.station_id, a.obs_date).cmp(&(&b.station_id, b.obs_date)));
            h
        });
    }

    #[test]
    fn test_station_state_transition_on_recrawl() {
        let repo = repo();
        repo.upsert(&[station("A", "Alpha", STATION_ACTIVE)], 1000).unwrap();
        repo.upsert(&[station("A", "Alpha", STATION_RETIRED)], 1000).unwrap();

        let all = repo.list_stations().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, STATION_RETIRED);
        assert!(repo.station_refs(true).unwrap().is_empty());
        assert_eq!(repo.station_refs(false).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_realtime_only_active_stations() {
        let repo = repo();
        repo.upsert(
            &[station("A", "Alpha", STATION_ACTIVE), station("B", "Beta", STATION_RETIRED)],
            1000,
        )
        .unwrap();
        repo.upsert(&[reading("A", 10, 18.0), reading("B", 10, 17.0)], 1000).unwrap();
        repo.upsert(&[reading("A", 20, 19.5)], 1000).unwrap();

        let rows = repo.latest_realtime().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].station_name, "Alpha");
        assert_eq!(rows[0].obs_time, 20);
        assert_eq!(rows[0].temperature, Some(19.5));
    }

    #[test]
    fn test_history_range_is_inclusive_and_empty_when_no_match() {
        let repo = repo();
        repo.upsert(&[day("A", 100, 1.0), day("A", 200, 2.0), day("A", 300, 3.0)], 1000)
            .unwrap();

        let rows = repo.history(&["A".to_string()], 100, 200).unwrap();
        assert_eq!(rows.iter().map(|r| r.obs_date).collect::<Vec<_>>(), vec![100, 200]);
        assert!(repo.history(&["A".to_string()], 400, 500).unwrap().is_empty());
        assert!(repo.history(&["Z".to_string()], 0, 500).unwrap().is_empty());
        assert!(repo.history(&[], 0, 500).unwrap().is_empty());
        assert_eq!(repo.latest_obs_date().unwrap(), Some(300));
        assert_eq!(repo.history_date_range().unwrap(), (Some(100), Some(300)));
    }

    #[test]
    fn test_initialization_marker() {
        let repo = repo();
        assert!(repo.initialized_at().unwrap().is_none());
        repo.mark_initialized().unwrap();
        let first = repo.initialized_at().unwrap();
        assert!(first.is_some());
        repo.mark_initialized().unwrap();
        assert_eq!(repo.initialized_at().unwrap(), first);
    }

    #[test]
    fn test_marker_read_fails_without_schema() {
        let repo = Repository::open_in_memory().unwrap();
        assert!(repo.initialized_at().is_err());
    }

    #[test]
    fn test_refresh_run_log_tracks_staleness() {
        let repo = repo();
        assert!(!repo.realtime_is_stale().unwrap());

        let id = repo.begin_refresh_run("refresh").unwrap();
        let summary = RunSummary {
            realtime_stale: Some(true),
            ..Default::default()
        };
        repo.finish_refresh_run(id, &summary).unwrap();
        assert!(repo.realtime_is_stale().unwrap());
        assert_eq!(
            repo.last_run().unwrap(),
            Some(("refresh".to_string(), "partial".to_string()))
        );

        // A history-only run leaves the staleness flag untouched
        let id = repo.begin_refresh_run("history").unwrap();
        repo.finish_refresh_run(id, &RunSummary::default()).unwrap();
        assert!(repo.realtime_is_stale().unwrap());

        let id = repo.begin_refresh_run("realtime").unwrap();
        repo.finish_refresh_run(id, &RunSummary { realtime_stale: Some(false), ..Default::default() })
            .unwrap();
        assert!(!repo.realtime_is_stale().unwrap());
    }
}

use crate::models::{
    HistoricalObservation, RawStationRow, RealtimeObservation, Station, StationRef,
    STATION_ACTIVE, STATION_RETIRED,
};
use crate::scraper::parsers::{
    stat, value_as_f64, RawDailyRecord, RawHistoryStation, RawRealtimeStation,
};
use crate::utils::local_midnight_epoch;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde_json::Value;
use tracing::warn;

// ── Sentinels ─────────────────────────────────────────────────────────────────

/// Instrument fault marker used by the temperature fields.
pub const TEMPERATURE_FAULT: f64 = -99.5;
/// Historical rainfall marker for "trace amount".
pub const TRACE_RAIN_SENTINEL: f64 = -9.8;
/// Stored value for trace rain, distinct from both 0 and null.
pub const TRACE_RAIN: f64 = 0.05;
/// Cloud amount when fog makes the sky unobservable.
pub const CLOUD_OBSCURED: f64 = 11.0;

const SENTINEL_EPSILON: f64 = 1e-9;

fn is_sentinel(v: f64, sentinel: f64) -> bool {
    (v - sentinel).abs() < SENTINEL_EPSILON
}

// ── Field policies ────────────────────────────────────────────────────────────

/// Pressure, humidity, wind speed, durations, radiation, UV: negative is a fault.
pub fn non_negative(v: Option<f64>) -> Option<f64> {
    v.filter(|x| *x >= 0.0)
}

/// Only the documented fault value is dropped; sub-zero readings are real.
pub fn temperature(v: Option<f64>) -> Option<f64> {
    v.filter(|x| !is_sentinel(*x, TEMPERATURE_FAULT))
}

/// Negative is a fault, above 360° resets to 0.
pub fn wind_direction(v: Option<f64>) -> Option<f64> {
    match v {
        Some(x) if x < 0.0 => None,
        Some(x) if x > 360.0 => Some(0.0),
        other => other,
    }
}

/// Trace sentinel becomes [`TRACE_RAIN`]; any other negative is a fault.
pub fn historical_rainfall(v: Option<f64>) -> Option<f64> {
    match v {
        Some(x) if is_sentinel(x, TRACE_RAIN_SENTINEL) => Some(TRACE_RAIN),
        Some(x) if x < 0.0 => None,
        other => other,
    }
}

/// Negative means "obscured", not missing.
pub fn cloud_amount(v: Option<f64>) -> Option<f64> {
    v.map(|x| if x < 0.0 { CLOUD_OBSCURED } else { x })
}

/// Non-numeric raw values are the trace marker; negative numbers mean none.
pub fn realtime_precipitation(raw: &Value) -> Option<f64> {
    match raw {
        Value::Null => None,
        other => match value_as_f64(other) {
            Some(x) if x < 0.0 => Some(0.0),
            Some(x) => Some(x),
            None => Some(TRACE_RAIN),
        },
    }
}

// ── Generic text cleanup ──────────────────────────────────────────────────────

/// Parse a roster number: keep digits, dot and minus.
/// "6.3" → 6.3 | "121.5149°" → 121.5149 | "" → None
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" || s == "-" || s == "—" {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}

/// Empty or whitespace-only text is stored as null.
pub fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn is_radar(name: &str) -> bool {
    name.contains("雷達") || name.to_lowercase().contains("radar")
}

// ── Roster rows → Station ─────────────────────────────────────────────────────

/// Keep staffed official stations that are not radar sites.
pub fn clean_station_rows(rows: Vec<RawStationRow>, staffed_type: &str) -> Vec<Station> {
    rows.into_iter()
        .filter_map(|row| station_from_row(&row, staffed_type))
        .collect()
}

fn station_from_row(row: &RawStationRow, staffed_type: &str) -> Option<Station> {
    let station_type = row.station_type.as_deref()?.trim();
    if station_type != staffed_type.trim() {
        return None;
    }

    let station_id = non_empty(row.station_id.as_deref())?;
    let name = non_empty(row.name.as_deref())?;
    if is_radar(&name) {
        return None;
    }

    let end_date = non_empty(row.end_date.as_deref());
    let state = if end_date.is_some() { STATION_RETIRED } else { STATION_ACTIVE };

    Some(Station {
        station_id,
        name,
        altitude: row.altitude.as_deref().and_then(parse_number),
        longitude: row.longitude.as_deref().and_then(parse_number),
        latitude: row.latitude.as_deref().and_then(parse_number),
        county: non_empty(row.county.as_deref()),
        address: non_empty(row.address.as_deref()),
        start_date: non_empty(row.start_date.as_deref()),
        end_date,
        remark: non_empty(row.remark.as_deref()),
        state,
    })
}

// ── Time ──────────────────────────────────────────────────────────────────────

/// ISO-8601 timestamp with offset → epoch seconds.
pub fn offset_time_to_epoch(s: &str) -> Option<i64> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.timestamp())
}

/// Upstream-local date or datetime without offset → epoch seconds.
pub fn local_time_to_epoch(s: &str, offset: &FixedOffset) -> Option<i64> {
    let s = s.trim();
    match NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        Ok(naive) => naive
            .and_local_timezone(*offset)
            .single()
            .map(|dt| dt.timestamp()),
        Err(_) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| local_midnight_epoch(d, offset)),
    }
}

// ── Realtime record → RealtimeObservation ─────────────────────────────────────

pub fn realtime_record(raw: &Value) -> Result<RealtimeObservation> {
    let rec: RawRealtimeStation =
        serde_json::from_value(raw.clone()).context("Malformed realtime station record")?;

    let obs_time = offset_time_to_epoch(&rec.obs_time.date_time).with_context(|| {
        format!(
            "{}: bad observation time {:?}",
            rec.station_id, rec.obs_time.date_time
        )
    })?;

    let el = rec.weather_element;
    Ok(RealtimeObservation {
        station_id: rec.station_id,
        station_name: rec.station_name,
        obs_time,
        precipitation: realtime_precipitation(&el.now.precipitation),
        wind_direction: el.wind_direction,
        wind_speed: el.wind_speed,
        temperature: el.air_temperature,
        relative_humidity: el.relative_humidity,
        uv_index: el.uv_index,
    })
}

// ── Historical payload → HistoricalObservation ────────────────────────────────

/// Normalize one station's daily records. Days with an unreadable date are
/// skipped; a payload that does not decode at all is an error.
pub fn history_records(
    station: &StationRef,
    raw: &Value,
    offset: &FixedOffset,
) -> Result<Vec<HistoricalObservation>> {
    let payload: RawHistoryStation = serde_json::from_value(raw.clone())
        .with_context(|| format!("{}: malformed history payload", station.station_id))?;

    let station_id = if payload.station_id.trim().is_empty() {
        station.station_id.clone()
    } else {
        payload.station_id.trim().to_string()
    };

    let mut out = Vec::with_capacity(payload.dts.len());
    for day in &payload.dts {
        match daily_observation(&station_id, &station.name, day, offset) {
            Some(obs) => out.push(obs),
            None => warn!("{}: skipping day with bad date {:?}", station_id, day.data_date),
        }
    }
    Ok(out)
}

fn daily_observation(
    station_id: &str,
    station_name: &str,
    day: &RawDailyRecord,
    offset: &FixedOffset,
) -> Option<HistoricalObservation> {
    let obs_date = local_time_to_epoch(&day.data_date, offset)?;

    Some(HistoricalObservation {
        station_id: station_id.to_string(),
        station_name: station_name.to_string(),
        obs_date,
        station_pressure: non_negative(stat(&day.station_pressure, |s| s.mean)),
        sea_pressure: non_negative(stat(&day.sea_level_pressure, |s| s.mean)),
        temperature: temperature(stat(&day.air_temperature, |s| s.mean)),
        t_max: temperature(stat(&day.air_temperature, |s| s.maximum)),
        t_min: temperature(stat(&day.air_temperature, |s| s.minimum)),
        relative_humidity: non_negative(stat(&day.relative_humidity, |s| s.mean)),
        wind_speed: non_negative(stat(&day.wind_speed, |s| s.mean)),
        wind_direction: wind_direction(stat(&day.wind_direction, |s| s.prevailing)),
        gust_max: non_negative(stat(&day.peak_gust, |s| s.maximum)),
        gust_direction: wind_direction(stat(&day.peak_gust, |s| s.direction)),
        precipitation: historical_rainfall(stat(&day.precipitation, |s| s.accumulation)),
        precipitation_hours: non_negative(stat(&day.precipitation_duration, |s| s.total)),
        sunshine_hours: non_negative(stat(&day.sunshine_duration, |s| s.total)),
        sunshine_rate: non_negative(stat(&day.sunshine_duration, |s| s.rate)),
        global_radiation: non_negative(stat(&day.global_solar_radiation, |s| s.accumulation)),
        visibility_mean: stat(&day.visibility, |s| s.mean),
        uv_max: non_negative(stat(&day.uv_index, |s| s.maximum)),
        cloud_amount: cloud_amount(stat(&day.total_cloud_amount, |s| s.mean)),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

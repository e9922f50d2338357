use crate::models::RawStationRow;
use anyhow::Result;
use scraper::{Html, Selector};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

// ── Station roster page ───────────────────────────────────────────────────────

/// Minimum cells for a roster row: code … address.
const ROSTER_MIN_CELLS: usize = 8;

/// Extract raw station rows from the roster HTML.
///
/// Cells are positional: code, name, type, altitude, longitude, latitude,
/// county, address, then (newer layout only) start date, end date, remark.
pub fn parse_station_roster(html: &str) -> Result<Vec<RawStationRow>> {
    let doc = Html::parse_document(html);
    let td_sel = Selector::parse("td").map_err(|e| anyhow::anyhow!("td selector: {:?}", e))?;

    // The roster lives under #existing_station; fall back to any table.
    for candidate in ["#existing_station table tr", "table tr"] {
        let row_sel = Selector::parse(candidate)
            .map_err(|e| anyhow::anyhow!("row selector {}: {:?}", candidate, e))?;

        let mut rows = Vec::new();
        for tr in doc.select(&row_sel) {
            let cells: Vec<String> = tr
                .select(&td_sel)
                .map(|td| td.text().collect::<String>().trim().to_string())
                .collect();

            if cells.len() < ROSTER_MIN_CELLS {
                continue;
            }

            rows.push(RawStationRow {
                station_id: cells.first().cloned(),
                name: cells.get(1).cloned(),
                station_type: cells.get(2).cloned(),
                altitude: cells.get(3).cloned(),
                longitude: cells.get(4).cloned(),
                latitude: cells.get(5).cloned(),
                county: cells.get(6).cloned(),
                address: cells.get(7).cloned(),
                start_date: cells.get(8).cloned(),
                end_date: cells.get(9).cloned(),
                remark: cells.get(10).cloned(),
            });
        }

        if !rows.is_empty() {
            debug!("Roster: {} rows via '{}'", rows.len(), candidate);
            return Ok(rows);
        }
    }

    warn!("No station rows found in roster page");
    Ok(vec![])
}

// ── Realtime payload ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RealtimeResponse {
    pub records: RealtimeRecords,
}

#[derive(Debug, Deserialize)]
pub struct RealtimeRecords {
    /// Kept untyped so one malformed station cannot sink the whole payload.
    #[serde(rename = "Station", default)]
    pub station: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawRealtimeStation {
    pub station_name: String,
    pub station_id: String,
    pub obs_time: RawObsTime,
    pub weather_element: RawRealtimeElements,
}

#[derive(Debug, Deserialize)]
pub struct RawObsTime {
    #[serde(rename = "DateTime")]
    pub date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawRealtimeElements {
    pub now: RawNow,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub air_temperature: Option<f64>,
    #[serde(default)]
    pub relative_humidity: Option<f64>,
    #[serde(rename = "UVIndex", default)]
    pub uv_index: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RawNow {
    /// Number, or a non-numeric trace marker such as `"T"`.
    #[serde(rename = "Precipitation", default)]
    pub precipitation: Value,
}

// ── Historical payload ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    /// Upstream status echoed in the body; must match the HTTP status.
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub data: Vec<Value>,
}

/// `data[0]` of a historical response: one station, one record per day.
#[derive(Debug, Deserialize)]
pub struct RawHistoryStation {
    #[serde(rename = "StationID")]
    pub station_id: String,
    #[serde(default)]
    pub dts: Vec<RawDailyRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawDailyRecord {
    pub data_date: String,
    #[serde(default)]
    pub station_pressure: Option<Stat>,
    #[serde(default)]
    pub sea_level_pressure: Option<Stat>,
    #[serde(default)]
    pub air_temperature: Option<Stat>,
    #[serde(default)]
    pub relative_humidity: Option<Stat>,
    #[serde(default)]
    pub wind_speed: Option<Stat>,
    #[serde(default)]
    pub wind_direction: Option<Stat>,
    #[serde(default)]
    pub peak_gust: Option<Stat>,
    #[serde(default)]
    pub precipitation: Option<Stat>,
    #[serde(default)]
    pub precipitation_duration: Option<Stat>,
    #[serde(default)]
    pub sunshine_duration: Option<Stat>,
    #[serde(default)]
    pub global_solar_radiation: Option<Stat>,
    #[serde(default)]
    pub visibility: Option<Stat>,
    #[serde(rename = "UVIndex", default)]
    pub uv_index: Option<Stat>,
    #[serde(default)]
    pub total_cloud_amount: Option<Stat>,
}

/// A measurement group. Each group only fills the statistics it reports.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stat {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub mean: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub maximum: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub minimum: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub prevailing: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub direction: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub accumulation: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rate: Option<f64>,
}

/// Read one statistic out of an optional group.
pub fn stat(group: &Option<Stat>, field: fn(&Stat) -> Option<f64>) -> Option<f64> {
    group.as_ref().and_then(field)
}

/// Numbers and numeric strings become `f64`; anything else is `None`.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|x| x.is_finite())
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(value_as_f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROSTER: &str = r#"
        <html><body>
        <div id="existing_station">
          <table>
            <tr><th>站號</th><th>站名</th><th>型式</th></tr>
            <tr><td>466920</td><td>Taipei</td><td>署屬有人站</td><td>6.3</td>
                <td>121.5149</td><td>25.0377</td><td>臺北市</td><td>中正區公園路64號</td>
                <td>1896/03/01</td><td></td><td></td></tr>
            <tr><td>C0A9C0</td><td>天母</td><td>自動站</td><td>98</td>
                <td>121.53</td><td>25.11</td><td>臺北市</td><td>士林區</td></tr>
            <tr><td>short</td><td>row</td></tr>
          </table>
        </div>
        </body></html>
    "#;

    #[test]
    fn test_parse_roster_positional_cells() {
        let rows = parse_station_roster(ROSTER).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].station_id.as_deref(), Some("466920"));
        assert_eq!(rows[0].station_type.as_deref(), Some("署屬有人站"));
        assert_eq!(rows[0].address.as_deref(), Some("中正區公園路64號"));
        assert_eq!(rows[0].start_date.as_deref(), Some("1896/03/01"));
        assert_eq!(rows[0].end_date.as_deref(), Some(""));
        // Old layout: eight cells, no lifecycle columns
        assert_eq!(rows[1].end_date, None);
    }

    #[test]
    fn test_parse_roster_falls_back_to_any_table() {
        let html = "<table><tr><td>1</td><td>2</td><td>3</td><td>4</td>\
                    <td>5</td><td>6</td><td>7</td><td>8</td></tr></table>";
        let rows = parse_station_roster(html).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(parse_station_roster("<p>maintenance</p>").unwrap().is_empty());
    }

    #[test]
    fn test_daily_record_tolerates_missing_and_null_groups() {
        let rec: RawDailyRecord = serde_json::from_value(json!({
            "DataDate": "2024-03-01T00:00:00",
            "AirTemperature": {"Mean": 18.2, "Maximum": "22.5", "Minimum": null},
            "Precipitation": null,
            "UVIndex": {"Maximum": 7}
        }))
        .unwrap();
        assert_eq!(stat(&rec.air_temperature, |s| s.mean), Some(18.2));
        assert_eq!(stat(&rec.air_temperature, |s| s.maximum), Some(22.5));
        assert_eq!(stat(&rec.air_temperature, |s| s.minimum), None);
        assert_eq!(stat(&rec.precipitation, |s| s.accumulation), None);
        assert_eq!(stat(&rec.uv_index, |s| s.maximum), Some(7.0));
        assert_eq!(stat(&rec.visibility, |s| s.mean), None);
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(value_as_f64(&json!(1.5)), Some(1.5));
        assert_eq!(value_as_f64(&json!("-9.8")), Some(-9.8));
        assert_eq!(value_as_f64(&json!("T")), None);
        assert_eq!(value_as_f64(&json!(null)), None);
    }
}

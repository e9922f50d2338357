pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::UpstreamConfig;
use crate::models::Station;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use self::cleaner::clean_station_rows;
use self::http_client::{decode_json, with_query, FetchError, HttpClient};
use self::parsers::{parse_station_roster, HistoryResponse, RealtimeResponse};

/// Elements requested from the realtime endpoint.
const REALTIME_ELEMENTS: &str =
    "Now,WindDirection,WindSpeed,AirTemperature,RelativeHumidity,UVIndex";

const HISTORY_REFERER: &str = "https://codis.cwa.gov.tw/StationData";

/// Body status the historical endpoint reports on success.
const HISTORY_OK_CODE: i64 = 200;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable upstream abstraction.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Staffed, non-radar stations from the roster page.
    async fn fetch_station_roster(&self) -> Result<Vec<Station>>;

    /// Raw realtime records (`records.Station[]`) for the given station codes.
    async fn fetch_realtime(&self, station_ids: &[String]) -> Result<Vec<Value>>;

    /// Daily records for one station (`data[0]` of the response).
    async fn fetch_history(&self, station_id: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Value>;
}

// ── CWA open-data scraper ─────────────────────────────────────────────────────

pub struct CwaScraper {
    client: HttpClient,
    config: UpstreamConfig,
}

impl CwaScraper {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
            config: config.clone(),
        })
    }

    fn roster_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-TW,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers
    }

    fn history_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(REFERER, HeaderValue::from_static(HISTORY_REFERER));
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers
    }
}

#[async_trait]
impl WeatherSource for CwaScraper {
    async fn fetch_station_roster(&self) -> Result<Vec<Station>> {
        let url = Url::parse(&self.config.roster_url)
            .with_context(|| format!("Bad roster URL {}", self.config.roster_url))?;
        info!("Fetching station roster ({})", url);

        let html = self
            .client
            .get_text(&url, &Self::roster_headers())
            .await
            .context("Failed to fetch station roster")?;

        let rows = parse_station_roster(&html)?;
        let total = rows.len();
        let stations = clean_station_rows(rows, &self.config.staffed_station_type);
        info!("Roster: {} rows, {} staffed stations kept", total, stations.len());
        Ok(stations)
    }

    async fn fetch_realtime(&self, station_ids: &[String]) -> Result<Vec<Value>> {
        if self.config.api_key.is_empty() {
            anyhow::bail!("upstream.api_key is not configured");
        }

        let ids = station_ids.join(",");
        let url = with_query(
            &self.config.realtime_url,
            &[
                ("Authorization", self.config.api_key.as_str()),
                ("StationId", ids.as_str()),
                ("WeatherElement", REALTIME_ELEMENTS),
                ("GeoInfo", "Coordinates"),
            ],
        )?;
        debug!("Fetching realtime for {} stations", station_ids.len());

        let resp: RealtimeResponse = self
            .client
            .get_json(&url, &HeaderMap::new())
            .await
            .context("Realtime fetch failed")?;

        Ok(resp.records.station)
    }

    async fn fetch_history(
        &self,
        station_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Value> {
        let url = Url::parse(&self.config.history_url)
            .with_context(|| format!("Bad history URL {}", self.config.history_url))?;
        let form = history_form(station_id, start, end);
        let pairs: Vec<(&str, &str)> = form.iter().map(|(k, v)| (*k, v.as_str())).collect();

        self.client
            .fetch(
                Method::POST,
                &url,
                &Self::history_headers(),
                Some(&pairs),
                |body| decode_history(&url, body),
            )
            .await
            .with_context(|| format!("History fetch failed for {}", station_id))
    }
}

/// Form fields for one station's date range. `date` is the first day of the
/// start month.
pub fn history_form(station_id: &str, start: NaiveDate, end: NaiveDate) -> Vec<(&'static str, String)> {
    let month_start = start.with_day(1).unwrap_or(start);
    vec![
        ("date", day_stamp(month_start)),
        ("type", "report_month".to_string()),
        ("stn_ID", station_id.to_string()),
        ("stn_type", "cwb".to_string()),
        ("start", day_stamp(start)),
        ("end", day_stamp(end)),
    ]
}

fn day_stamp(d: NaiveDate) -> String {
    format!("{}T00:00:00", d.format("%Y-%m-%d"))
}

/// Accept a historical response only when its body code says OK, and return
/// the station block.
fn decode_history(url: &Url, body: &str) -> Result<Value, FetchError> {
    let resp: HistoryResponse = decode_json(url, body)?;

    if let Some(code) = resp.code {
        if code != HISTORY_OK_CODE {
            return Err(FetchError::Rejected {
                url: url.to_string(),
                reason: format!("body code {}", code),
            });
        }
    }

    resp.data.into_iter().next().ok_or_else(|| FetchError::Decode {
        url: url.to_string(),
        reason: "empty data array".to_string(),
    })
}

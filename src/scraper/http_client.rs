use crate::config::UpstreamConfig;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client")]
    Build(#[source] reqwest::Error),

    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: StatusCode },

    /// HTTP 200, but the body reports a different upstream status.
    #[error("{url} rejected the request: {reason}")]
    Rejected { url: String, reason: String },

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("gave up on {url} after {attempts} attempts")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport { .. } | FetchError::Status { .. } | FetchError::Rejected { .. }
        )
    }
}

/// Shared HTTP context for one pipeline run.
///
/// Every attempt is preceded by a random pause; failed attempts back off
/// exponentially up to `max_retries`. Idle connections are not pooled, so each
/// attempt opens a fresh connection.
pub struct HttpClient {
    inner: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, FetchError> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .cookie_store(true)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(FetchError::Build)?;

        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    /// GET a URL as text.
    pub async fn get_text(&self, url: &Url, headers: &HeaderMap) -> Result<String, FetchError> {
        self.fetch(Method::GET, url, headers, None, |body| Ok(body.to_string()))
            .await
    }

    /// GET a URL and deserialize the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        headers: &HeaderMap,
    ) -> Result<T, FetchError> {
        self.fetch(Method::GET, url, headers, None, |body| decode_json(url, body))
            .await
    }

    /// Issue one logical request, retrying until `decode` accepts the body or
    /// the retry budget runs out.
    ///
    /// `decode` may return [`FetchError::Rejected`] to have a successful HTTP
    /// response retried like a failed one.
    pub async fn fetch<T, D>(
        &self,
        method: Method,
        url: &Url,
        headers: &HeaderMap,
        form: Option<&[(&str, &str)]>,
        decode: D,
    ) -> Result<T, FetchError>
    where
        D: Fn(&str) -> Result<T, FetchError>,
    {
        let body = form.map(encode_form);
        let counter = AtomicUsize::new(0);

        let attempts = &counter;
        let method = &method;
        let body = body.as_deref();
        let decode = &decode;

        let result = RetryIf::start(
            self.backoff(),
            move || async move {
                let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                self.pause().await;
                debug!("{} {} (attempt {})", method, url, n);
                let text = self.send_once(method, url, headers, body).await?;
                decode(&text)
            },
            |e: &FetchError| {
                let retry = e.is_retryable();
                if retry {
                    warn!(
                        "attempt {} failed: {}",
                        attempts.load(Ordering::Relaxed),
                        error_chain(e)
                    );
                }
                retry
            },
        )
        .await;

        result.map_err(|e| {
            if e.is_retryable() {
                FetchError::Exhausted {
                    url: url.to_string(),
                    attempts: counter.load(Ordering::Relaxed),
                    last: Box::new(e),
                }
            } else {
                e
            }
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        form: Option<&str>,
    ) -> Result<String, FetchError> {
        let mut req = self
            .inner
            .request(method.clone(), url.clone())
            .headers(headers.clone());

        if let Some(agent) = self.pick_user_agent() {
            req = req.header(USER_AGENT, agent);
        }
        if let Some(form) = form {
            req = req
                .header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
                )
                .body(form.to_string());
        }

        let resp = req.send().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        resp.text().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })
    }

    /// Delays between attempts: base, 2×base, 4×base … capped, jittered.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        backoff_schedule(
            self.config.retry_base_ms,
            self.config.retry_max_delay_secs,
            self.config.max_retries,
        )
    }

    async fn pause(&self) {
        let secs = pause_secs(self.config.pause_min_secs, self.config.pause_max_secs);
        sleep(Duration::from_secs_f64(secs)).await;
    }

    fn pick_user_agent(&self) -> Option<&str> {
        pick(&self.config.user_agents).map(String::as_str)
    }
}

pub(crate) fn backoff_schedule(
    base_ms: u64,
    max_delay_secs: u64,
    max_retries: usize,
) -> impl Iterator<Item = Duration> {
    // from_millis(2) yields 2, 4, 8 …; the factor scales that to base, 2×base …
    ExponentialBackoff::from_millis(2)
        .factor((base_ms / 2).max(1))
        .max_delay(Duration::from_secs(max_delay_secs))
        .map(jitter)
        .take(max_retries)
}

/// Uniform pause length in `[min, max]` seconds.
pub(crate) fn pause_secs(min: f64, max: f64) -> f64 {
    if max <= min {
        return min.max(0.0);
    }
    rand::random_range(min..=max)
}

fn pick(items: &[String]) -> Option<&String> {
    if items.is_empty() {
        return None;
    }
    items.get(rand::random_range(0..items.len()))
}

/// `application/x-www-form-urlencoded` body.
pub fn encode_form(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Base URL with query parameters appended.
pub fn with_query(base: &str, params: &[(&str, &str)]) -> anyhow::Result<Url> {
    Ok(Url::parse_with_params(base, params)?)
}

pub fn decode_json<T: DeserializeOwned>(url: &Url, body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|e| FetchError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn error_chain(e: &FetchError) -> String {
    let mut msg = e.to_string();
    let mut source = StdError::source(e);
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn fast_config(max_retries: usize) -> UpstreamConfig {
        UpstreamConfig {
            pause_min_secs: 0.0,
            pause_max_secs: 0.0,
            retry_base_ms: 4,
            retry_max_delay_secs: 1,
            max_retries,
            ..UpstreamConfig::default()
        }
    }

    /// Local server answering connection `n` with `script[n]`; the last entry
    /// repeats. Returns the base URL and the number of requests served.
    async fn scripted_server(script: Vec<(u16, &'static str)>) -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let served = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                read_request(&mut sock).await;
                let n = served.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script[n.min(script.len() - 1)];
                let resp = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });

        (Url::parse(&format!("http://{}/", addr)).unwrap(), hits)
    }

    /// Consume headers and a `Content-Length` body.
    async fn read_request(sock: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_recovers_after_transient_errors() {
        let (url, hits) = scripted_server(vec![(503, "busy"), (503, "busy"), (200, "ok")]).await;
        let client = HttpClient::new(&fast_config(5)).unwrap();

        let body = client.get_text(&url, &HeaderMap::new()).await.unwrap();

        assert_eq!(body, "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_retry_budget() {
        let (url, hits) = scripted_server(vec![(503, "busy")]).await;
        let client = HttpClient::new(&fast_config(3)).unwrap();

        let err = client.get_text(&url, &HeaderMap::new()).await.unwrap_err();

        match err {
            FetchError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 4);
                assert!(matches!(
                    *last,
                    FetchError::Status { status: StatusCode::SERVICE_UNAVAILABLE, .. }
                ));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fetch_retries_body_code_mismatch() {
        let (url, hits) = scripted_server(vec![
            (200, r#"{"code":500,"data":[]}"#),
            (200, r#"{"code":200,"data":[{"StationID":"466920","dts":[]}]}"#),
        ])
        .await;
        let client = HttpClient::new(&fast_config(3)).unwrap();

        let station = client
            .fetch(
                Method::POST,
                &url,
                &HeaderMap::new(),
                Some(&[("stn_ID", "466920")][..]),
                |body| crate::scraper::decode_history(&url, body),
            )
            .await
            .unwrap();

        assert_eq!(station["StationID"], "466920");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_decode_errors() {
        let (url, hits) = scripted_server(vec![(200, "not json")]).await;
        let client = HttpClient::new(&fast_config(3)).unwrap();

        let err = client
            .get_json::<serde_json::Value>(&url, &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Decode { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pause_stays_in_range() {
        for _ in 0..200 {
            let p = pause_secs(0.05, 0.2);
            assert!((0.05..=0.2).contains(&p), "{p}");
        }
        assert_eq!(pause_secs(1.0, 1.0), 1.0);
        assert_eq!(pause_secs(-1.0, -2.0), 0.0);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let delays: Vec<Duration> = backoff_schedule(1000, 3, 5).collect();
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(3)));
        assert_eq!(backoff_schedule(1000, 3, 0).count(), 0);
    }

    #[test]
    fn test_encode_form() {
        let body = encode_form(&[("stn_ID", "466920"), ("start", "2024-03-01T00:00:00")]);
        assert_eq!(body, "stn_ID=466920&start=2024-03-01T00%3A00%3A00");
    }

    #[test]
    fn test_with_query_joins_station_list() {
        let url = with_query(
            "https://example.org/api/O-A0003-001",
            &[("StationId", "466920,467410"), ("GeoInfo", "Coordinates")],
        )
        .unwrap();
        assert_eq!(
            url.query(),
            Some("StationId=466920%2C467410&GeoInfo=Coordinates")
        );
    }

    #[test]
    fn test_retryable_classification() {
        let url = "https://example.org".to_string();
        assert!(FetchError::Status { url: url.clone(), status: StatusCode::SERVICE_UNAVAILABLE }
            .is_retryable());
        assert!(FetchError::Rejected { url: url.clone(), reason: "code 500".into() }.is_retryable());
        assert!(!FetchError::Decode { url, reason: "eof".into() }.is_retryable());
    }

    #[test]
    fn test_pick_handles_empty_list() {
        assert!(pick(&[]).is_none());
        let agents = vec!["a".to_string(), "b".to_string()];
        assert!(agents.contains(pick(&agents).unwrap()));
    }
}

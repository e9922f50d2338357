//! Pipeline orchestrator: ties scraper → storage together.
//!
//! ## Run modes
//!
//! `run()`: default / cron use. Reads the persisted initialization marker:
//!   * absent: roster → realtime → one year of daily history → write marker
//!   * present: fill the daily-history gap up to yesterday, then realtime
//!
//! Standalone stages: `refresh_stations()`, `refresh_realtime()`,
//! `refresh_history()` and `fill_history_gap()`.
//!
//! Every invocation is logged to `refresh_runs`. Workers only fetch and
//! normalize; all writes happen here, after fan-out.

pub mod executor;

use crate::config::AppConfig;
use crate::models::{HistoricalObservation, StationRef};
use crate::scraper::cleaner::{history_records, realtime_record};
use crate::scraper::{CwaScraper, WeatherSource};
use crate::storage::upsert::{UpsertRecord, UpsertReport};
use crate::storage::{Repository, RunSummary};
use crate::utils::{day_before, epoch_to_date, local_today};
use anyhow::{Context, Result};
use chrono::{Duration, FixedOffset, NaiveDate};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use self::executor::run_ordered;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Initialize,
    Refresh,
    Stations,
    Realtime,
    History,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Initialize => "initialize",
            RunMode::Refresh => "refresh",
            RunMode::Stations => "stations",
            RunMode::Realtime => "realtime",
            RunMode::History => "history",
        }
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub mode: RunMode,
    pub run: RunSummary,
    /// Date range crawled for daily history, if any.
    pub history_range: Option<(NaiveDate, NaiveDate)>,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {} stations | {} realtime | {} history | {} failed batches",
            self.mode.as_str(),
            self.run.status(),
            self.run.stations_written,
            self.run.realtime_written,
            self.run.history_written,
            self.run.failed_batches,
        )?;
        if let Some((start, end)) = self.history_range {
            write!(f, " | history {} → {}", start, end)?;
        }
        if self.run.realtime_stale == Some(true) {
            write!(f, " | realtime STALE")?;
        }
        Ok(())
    }
}

pub struct Pipeline<S: WeatherSource> {
    source: Arc<S>,
    repo: Repository,
    config: AppConfig,
    offset: FixedOffset,
    /// Pins "today" for deterministic runs; wall clock otherwise.
    as_of: Option<NaiveDate>,
}

impl Pipeline<CwaScraper> {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let repo = Repository::open(&config.storage.db_path).context("Failed to open DuckDB")?;
        let scraper = CwaScraper::new(&config.upstream).context("Failed to build scraper")?;
        Self::new(scraper, repo, config)
    }
}

impl<S: WeatherSource + 'static> Pipeline<S> {
    pub fn new(source: S, repo: Repository, config: AppConfig) -> Result<Self> {
        let offset = config.pipeline.utc_offset()?;
        Ok(Self {
            source: Arc::new(source),
            repo,
            config,
            offset,
            as_of: None,
        })
    }

    #[cfg(test)]
    pub fn with_as_of(mut self, today: NaiveDate) -> Self {
        self.as_of = Some(today);
        self
    }

    #[cfg(test)]
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    fn yesterday(&self) -> NaiveDate {
        day_before(self.as_of.unwrap_or_else(|| local_today(&self.offset)))
    }

    fn prepare(&self) -> Result<()> {
        if self.config.storage.run_migrations {
            self.repo.run_migrations()?;
        }
        Ok(())
    }

    // ── Public operations ─────────────────────────────────────────────────────

    /// Initialize on first run, incremental refresh afterwards.
    pub async fn run(&self) -> Result<PipelineStats> {
        self.repo.run_migrations()?;

        let mode = match self
            .repo
            .initialized_at()
            .context("Could not read initialization marker")?
        {
            None => RunMode::Initialize,
            Some(at) => {
                info!("Store initialized at {}", at);
                RunMode::Refresh
            }
        };

        let run_id = self.repo.begin_refresh_run(mode.as_str())?;
        let mut stats = self.stats(mode);
        let outcome = match mode {
            RunMode::Initialize => self.initialize(&mut stats).await,
            _ => self.incremental(&mut stats).await,
        };
        self.close_run(run_id, stats, outcome)
    }

    pub async fn refresh_stations(&self) -> Result<PipelineStats> {
        self.prepare()?;
        let run_id = self.repo.begin_refresh_run(RunMode::Stations.as_str())?;
        let mut stats = self.stats(RunMode::Stations);
        let outcome = self.stage_stations(&mut stats.run).await;
        self.close_run(run_id, stats, outcome)
    }

    pub async fn refresh_realtime(&self) -> Result<PipelineStats> {
        self.prepare()?;
        let run_id = self.repo.begin_refresh_run(RunMode::Realtime.as_str())?;
        let mut stats = self.stats(RunMode::Realtime);
        let outcome = self.stage_realtime(&mut stats.run).await;
        self.close_run(run_id, stats, outcome)
    }

    /// Crawl daily history for every known station over `[start, end]`.
    pub async fn refresh_history(&self, start: NaiveDate, end: NaiveDate) -> Result<PipelineStats> {
        if start > end {
            anyhow::bail!("history range {} → {} is inverted", start, end);
        }
        self.prepare()?;
        let run_id = self.repo.begin_refresh_run(RunMode::History.as_str())?;
        let mut stats = self.stats(RunMode::History);
        stats.history_range = Some((start, end));
        let outcome = self.stage_history(start, end, &mut stats.run).await;
        self.close_run(run_id, stats, outcome)
    }

    /// Crawl from the latest stored day up to yesterday, if behind.
    pub async fn fill_history_gap(&self) -> Result<PipelineStats> {
        self.prepare()?;
        let run_id = self.repo.begin_refresh_run(RunMode::History.as_str())?;
        let mut stats = self.stats(RunMode::History);
        let outcome = self.stage_history_gap(&mut stats).await;
        self.close_run(run_id, stats, outcome)
    }

    // ── Run modes ─────────────────────────────────────────────────────────────

    async fn initialize(&self, stats: &mut PipelineStats) -> Result<()> {
        info!("=== Initializing store ===");

        info!("=== Step 1: Station roster ===");
        self.stage_stations(&mut stats.run).await?;
        if self.repo.station_count()? == 0 {
            anyhow::bail!("No stations after roster crawl; store left uninitialized");
        }

        info!("=== Step 2: Realtime observations ===");
        self.stage_realtime(&mut stats.run).await?;

        let (start, end) = history_window(self.yesterday(), self.config.pipeline.history_days);
        info!("=== Step 3: Daily history {} → {} ===", start, end);
        stats.history_range = Some((start, end));
        self.stage_history(start, end, &mut stats.run).await?;

        self.repo.mark_initialized()?;
        info!("Initialization marker written");
        Ok(())
    }

    /// Realtime is refreshed even when the history stage fails; the history
    /// error is still returned.
    async fn incremental(&self, stats: &mut PipelineStats) -> Result<()> {
        info!("=== Step 1: Daily history gap ===");
        let history = self.stage_history_gap(stats).await;
        if let Err(e) = &history {
            warn!("History gap fill failed: {:#}", e);
        }

        info!("=== Step 2: Realtime observations ===");
        self.stage_realtime(&mut stats.run).await?;
        history
    }

    // ── Stages ────────────────────────────────────────────────────────────────

    async fn stage_stations(&self, run: &mut RunSummary) -> Result<()> {
        let stations = self
            .source
            .fetch_station_roster()
            .await
            .context("Station roster fetch failed")?;

        if stations.is_empty() {
            warn!("Roster returned no stations; keeping stored list");
            return Ok(());
        }

        let active = stations.iter().filter(|s| s.is_active()).count();
        info!("{} stations ({} active)", stations.len(), active);

        let report = self.persist(&stations)?;
        run.stations_written += report.written;
        run.failed_batches += report.failures.len();
        Ok(())
    }

    /// A failed fetch marks realtime stale instead of failing the run.
    async fn stage_realtime(&self, run: &mut RunSummary) -> Result<()> {
        let stations = self.repo.station_refs(true)?;
        if stations.is_empty() {
            warn!("No active stations; skipping realtime refresh");
            return Ok(());
        }

        let ids: Vec<String> = stations.into_iter().map(|s| s.station_id).collect();
        let raw = match self.source.fetch_realtime(&ids).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Realtime refresh failed, keeping previous rows: {:#}", e);
                run.realtime_stale = Some(true);
                return Ok(());
            }
        };
        info!("Realtime: {} records for {} active stations", raw.len(), ids.len());

        let rows: Vec<_> = run_ordered(raw, self.config.pipeline.concurrency, |record| async move {
            realtime_record(&record)
                .map_err(|e| warn!("Dropping realtime record: {:#}", e))
                .ok()
        })
        .await
        .into_iter()
        .flatten()
        .collect();

        let report = self.persist(&rows)?;
        run.realtime_written += report.written;
        run.failed_batches += report.failures.len();
        run.realtime_stale = Some(false);
        Ok(())
    }

    async fn stage_history_gap(&self, stats: &mut PipelineStats) -> Result<()> {
        let yesterday = self.yesterday();
        let latest = self.repo.latest_obs_date()?;

        match gap_range(latest, yesterday, &self.offset, self.config.pipeline.history_days) {
            Some((start, end)) => {
                info!("History behind: crawling {} → {}", start, end);
                stats.history_range = Some((start, end));
                self.stage_history(start, end, &mut stats.run).await
            }
            None => {
                info!("History up to date through {}", yesterday);
                Ok(())
            }
        }
    }

    async fn stage_history(&self, start: NaiveDate, end: NaiveDate, run: &mut RunSummary) -> Result<()> {
        let stations = self.repo.station_refs(false)?;
        if stations.is_empty() {
            warn!("No stations stored; skipping history crawl");
            return Ok(());
        }

        let names: Arc<HashMap<String, String>> = Arc::new(
            stations
                .iter()
                .map(|s| (s.station_id.clone(), s.name.clone()))
                .collect(),
        );
        let ids: Vec<String> = stations.into_iter().map(|s| s.station_id).collect();
        let requested = ids.len();
        info!("Fetching daily history for {} stations", requested);

        let source = Arc::clone(&self.source);
        let offset = self.offset;
        let results = run_ordered(ids, self.config.pipeline.concurrency, move |station_id: String| {
            let source = Arc::clone(&source);
            let names = Arc::clone(&names);
            async move {
                let raw = source
                    .fetch_history(&station_id, start, end)
                    .await
                    .map_err(|e| warn!("{}: {:#}", station_id, e))
                    .ok()?;

                let station = StationRef {
                    name: names.get(&station_id).cloned().unwrap_or_default(),
                    station_id,
                };
                history_records(&station, &raw, &offset)
                    .map_err(|e| warn!("{:#}", e))
                    .ok()
            }
        })
        .await;

        let succeeded = results.iter().filter(|r| r.is_some()).count();
        if succeeded < requested {
            warn!("History: {}/{} stations failed", requested - succeeded, requested);
        }

        let mut rows: Vec<HistoricalObservation> = results.into_iter().flatten().flatten().collect();
        sort_history(&mut rows);

        let report = self.persist(&rows)?;
        run.history_written += report.written;
        run.failed_batches += report.failures.len();
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn persist<R: UpsertRecord>(&self, rows: &[R]) -> Result<UpsertReport> {
        self.repo.upsert(rows, self.config.storage.batch_size)
    }

    fn stats(&self, mode: RunMode) -> PipelineStats {
        PipelineStats {
            mode,
            run: RunSummary::default(),
            history_range: None,
        }
    }

    fn close_run(&self, run_id: i64, mut stats: PipelineStats, outcome: Result<()>) -> Result<PipelineStats> {
        if let Err(e) = &outcome {
            stats.run.error = Some(format!("{:#}", e));
        }
        if let Err(e) = self.repo.finish_refresh_run(run_id, &stats.run) {
            warn!("Could not record run {}: {:#}", run_id, e);
        }

        outcome?;
        info!("=== Done: {} ===", stats);
        Ok(stats)
    }
}

// ── Date ranges ───────────────────────────────────────────────────────────────

/// `[yesterday - days, yesterday]`.
pub fn history_window(yesterday: NaiveDate, days: i64) -> (NaiveDate, NaiveDate) {
    (yesterday - Duration::days(days), yesterday)
}

/// Range still to crawl given the latest stored day. An empty table gets the
/// full window; a table already at yesterday needs nothing.
pub fn gap_range(
    latest: Option<i64>,
    yesterday: NaiveDate,
    offset: &FixedOffset,
    days: i64,
) -> Option<(NaiveDate, NaiveDate)> {
    match latest.and_then(|epoch| epoch_to_date(epoch, offset)) {
        None => Some(history_window(yesterday, days)),
        Some(latest) if latest < yesterday => Some((latest, yesterday)),
        Some(_) => None,
    }
}

/// Upsert order: by date, then station.
pub fn sort_history(rows: &mut [HistoricalObservation]) {
    rows.sort_by(|a, b| {
        a.obs_date
            .cmp(&b.obs_date)
            .then_with(|| a.station_id.cmp(&b.station_id))
    });
}

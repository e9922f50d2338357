use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta, Utc};
use std::time::Instant;
use tracing::info;

/// Wall-clock timer for a pipeline stage; logs on drop.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("⏱  Finished: {} (took {:.2?})", self.label, self.start.elapsed());
    }
}

/// Thousands separators for row counts in status output.
pub fn fmt_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

// ── Upstream-local calendar ───────────────────────────────────────────────────

/// Today's date at the given offset.
pub fn local_today(offset: &FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(offset).date_naive()
}

pub fn day_before(date: NaiveDate) -> NaiveDate {
    date - TimeDelta::days(1)
}

/// Calendar date (at `offset`) of an epoch-seconds timestamp.
pub fn epoch_to_date(epoch: i64, offset: &FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp(epoch, 0).map(|dt| dt.with_timezone(offset).date_naive())
}

/// Epoch seconds of local midnight.
pub fn local_midnight_epoch(date: NaiveDate, offset: &FixedOffset) -> Option<i64> {
    date.and_hms_opt(0, 0, 0)?
        .and_local_timezone(*offset)
        .single()
        .map(|dt| dt.timestamp())
}

/// `YYYY-MM-DD` for an optional epoch, `—` when absent.
pub fn fmt_epoch_date(epoch: Option<i64>, offset: &FixedOffset) -> String {
    epoch
        .and_then(|e| epoch_to_date(e, offset))
        .map(|d| d.to_string())
        .unwrap_or_else(|| "—".into())
}

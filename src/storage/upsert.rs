//! Batched insert-or-update with last-write-wins per primary key.
//!
//! Each batch runs in its own transaction. A failing batch is rolled back,
//! logged and recorded in the [`UpsertReport`]; later batches still run, so a
//! multi-batch call can end with some batches committed and others not.

use super::Repository;
use anyhow::Result;
use duckdb::params_from_iter;
use duckdb::types::Value;
use std::fmt;
use tracing::{debug, info, warn};

// ── Table description ─────────────────────────────────────────────────────────

/// Target table, its columns in value order, and its primary key.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub key_columns: &'static [&'static str],
}

impl TableSpec {
    pub fn validate(&self) -> Result<()> {
        if self.key_columns.is_empty() {
            anyhow::bail!("{}: no primary key columns", self.table);
        }
        if let Some(missing) = self.key_columns.iter().find(|k| !self.columns.contains(*k)) {
            anyhow::bail!("{}: key column {} is not a table column", self.table, missing);
        }
        Ok(())
    }

    /// Columns overwritten on conflict: everything except the key.
    pub fn update_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|c| !self.key_columns.contains(*c))
            .copied()
            .collect()
    }

    pub fn upsert_sql(&self) -> Result<String> {
        self.validate()?;

        let columns = self.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        let keys = self.key_columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");

        let updates = self.update_columns();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let set = updates
                .iter()
                .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {}", set)
        };

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            quote(self.table),
            columns,
            placeholders,
            keys,
            action
        ))
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A typed row that knows its table and how to become store values.
pub trait UpsertRecord {
    const SPEC: TableSpec;

    /// Values in `SPEC.columns` order.
    fn values(&self) -> Vec<Value>;
}

// ── Value helpers ─────────────────────────────────────────────────────────────

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn opt_text(s: Option<&str>) -> Value {
    s.map(text).unwrap_or(Value::Null)
}

pub fn opt_f64(v: Option<f64>) -> Value {
    v.map(Value::Double).unwrap_or(Value::Null)
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// Zero-based batch number.
    pub index: usize,
    pub rows: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub table: String,
    pub rows: usize,
    pub written: usize,
    pub batches: usize,
    pub failures: Vec<BatchFailure>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for UpsertReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} rows written in {} batches",
            self.table, self.written, self.rows, self.batches
        )?;
        if !self.failures.is_empty() {
            write!(f, ", {} failed", self.failures.len())?;
        }
        Ok(())
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

impl Repository {
    /// Upsert typed records. See [`Repository::upsert_rows`].
    pub fn upsert<R: UpsertRecord>(&self, rows: &[R], batch_size: usize) -> Result<UpsertReport> {
        let values: Vec<Vec<Value>> = rows.iter().map(UpsertRecord::values).collect();
        self.upsert_rows(&R::SPEC, &values, batch_size)
    }

    /// Insert-or-update `rows` into `spec.table` in batches of `batch_size`.
    ///
    /// Only an invalid `spec` is an error; batch failures are reported.
    pub fn upsert_rows(
        &self,
        spec: &TableSpec,
        rows: &[Vec<Value>],
        batch_size: usize,
    ) -> Result<UpsertReport> {
        let sql = spec.upsert_sql()?;
        let mut report = UpsertReport {
            table: spec.table.to_string(),
            rows: rows.len(),
            ..Default::default()
        };

        if rows.is_empty() {
            debug!("{}: nothing to upsert", spec.table);
            return Ok(report);
        }

        let batch_size = batch_size.max(1);
        let total = rows.len().div_ceil(batch_size);

        for (index, batch) in rows.chunks(batch_size).enumerate() {
            report.batches += 1;
            match self.apply_batch(&sql, spec.columns.len(), batch) {
                Ok(()) => {
                    report.written += batch.len();
                    debug!("{}: batch {}/{} committed", spec.table, index + 1, total);
                }
                Err(e) => {
                    warn!(
                        "{}: batch {}/{} rolled back ({} rows): {:#}",
                        spec.table,
                        index + 1,
                        total,
                        batch.len(),
                        e
                    );
                    report.failures.push(BatchFailure {
                        index,
                        rows: batch.len(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        if report.is_complete() {
            info!("{}", report);
        } else {
            warn!("{}", report);
        }
        Ok(report)
    }

    /// One transaction; dropping it uncommitted rolls back.
    fn apply_batch(&self, sql: &str, width: usize, batch: &[Vec<Value>]) -> Result<()> {
        if let Some(bad) = batch.iter().find(|row| row.len() != width) {
            anyhow::bail!("row has {} values, table has {} columns", bad.len(), width);
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(sql)?;
            for row in batch {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoricalObservation;

    const PROBE: TableSpec = TableSpec {
        table: "probe",
        columns: &["id", "reading"],
        key_columns: &["id"],
    };

    fn probe_repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.conn
            .execute_batch(
                "CREATE TABLE probe (id INTEGER PRIMARY KEY, reading DOUBLE CHECK (reading >= 0));",
            )
            .unwrap();
        repo
    }

    fn probe_row(id: i64, reading: f64) -> Vec<Value> {
        vec![Value::BigInt(id), Value::Double(reading)]
    }

    fn probe_ids(repo: &Repository) -> Vec<i64> {
        let mut stmt = repo.conn.prepare("SELECT id FROM probe ORDER BY id").unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_upsert_sql_excludes_key_columns_from_update() {
        let sql = HistoricalObservation::SPEC.upsert_sql().unwrap();
        assert!(sql.contains(r#"ON CONFLICT ("station_id", "obs_date") DO UPDATE SET"#));
        assert!(!sql.contains(r#""station_id" = excluded"#));
        assert!(!sql.contains(r#""obs_date" = excluded"#));
        assert!(sql.contains(r#""temperature" = excluded."temperature""#));
    }

    #[test]
    fn test_key_only_table_does_nothing_on_conflict() {
        let spec = TableSpec {
            table: "tags",
            columns: &["tag"],
            key_columns: &["tag"],
        };
        assert!(spec.upsert_sql().unwrap().ends_with("DO NOTHING"));
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let no_key = TableSpec {
            table: "t",
            columns: &["a"],
            key_columns: &[],
        };
        assert!(no_key.upsert_sql().is_err());

        let stray_key = TableSpec {
            table: "t",
            columns: &["a"],
            key_columns: &["b"],
        };
        assert!(stray_key.upsert_sql().is_err());
    }

    #[test]
    fn test_empty_rows_is_noop() {
        let repo = probe_repo();
        let report = repo.upsert_rows(&PROBE, &[], 10).unwrap();
        assert_eq!(report.batches, 0);
        assert!(report.is_complete());
        assert!(probe_ids(&repo).is_empty());
    }

    #[test]
    fn test_failed_middle_batch_is_isolated() {
        let repo = probe_repo();
        let rows = vec![
            probe_row(1, 1.0),
            probe_row(2, 2.0),
            probe_row(3, 3.0),
            probe_row(4, -4.0), // violates CHECK
            probe_row(5, 5.0),
            probe_row(6, 6.0),
        ];

        let report = repo.upsert_rows(&PROBE, &rows, 2).unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.written, 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].rows, 2);
        assert_eq!(probe_ids(&repo), vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_row_width_mismatch_fails_only_its_batch() {
        let repo = probe_repo();
        let rows = vec![probe_row(1, 1.0), vec![Value::BigInt(2)], probe_row(3, 3.0)];
        let report = repo.upsert_rows(&PROBE, &rows, 1).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(probe_ids(&repo), vec![1, 3]);
    }

    #[test]
    fn test_last_write_wins() {
        let repo = probe_repo();
        repo.upsert_rows(&PROBE, &[probe_row(1, 1.0)], 10).unwrap();
        repo.upsert_rows(&PROBE, &[probe_row(1, 9.0)], 10).unwrap();

        let reading: f64 = repo
            .conn
            .query_row("SELECT reading FROM probe WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(reading, 9.0);
        assert_eq!(probe_ids(&repo), vec![1]);
    }

    #[test]
    fn test_report_display() {
        let report = UpsertReport {
            table: "probe".into(),
            rows: 5,
            written: 3,
            batches: 3,
            failures: vec![BatchFailure { index: 1, rows: 2, error: "boom".into() }],
        };
        assert!(!report.is_complete());
        assert_eq!(report.to_string(), "probe: 3/5 rows written in 3 batches, 1 failed");
    }
}

//! CSV bar files, one per symbol and timeframe: `<base>/<SYMBOL>_<timeframe>.csv`.
//!
//! Columns are `timestamp,open,high,low,close,volume`. Timestamps may be
//! RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare `YYYY-MM-DD` (midnight UTC).

use crate::domain::bar::Bar;
use crate::domain::error::LifecycleError;
use crate::ports::data_port::BarSource;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

pub struct CsvAdapter {
    base_path: PathBuf,
}

fn data_err(reason: String) -> LifecycleError {
    LifecycleError::DataSource { reason }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LifecycleError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
        .ok_or_else(|| data_err(format!("invalid timestamp '{value}'")))
}

fn column(record: &csv::StringRecord, index: usize, name: &str, line: usize) -> Result<f64, LifecycleError> {
    record
        .get(index)
        .ok_or_else(|| data_err(format!("line {line}: missing {name} column")))?
        .trim()
        .parse()
        .map_err(|e| data_err(format!("line {line}: invalid {name} value: {e}")))
}

/// Read every bar in `path`, sorted oldest first.
pub fn read_bars(path: &Path, symbol: &str) -> Result<Vec<Bar>, LifecycleError> {
    let content = fs::read_to_string(path)
        .map_err(|e| data_err(format!("failed to read {}: {e}", path.display())))?;

    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let mut bars = Vec::new();
    for (index, result) in rdr.records().enumerate() {
        let line = index + 2;
        let record = result.map_err(|e| data_err(format!("CSV parse error: {e}")))?;
        let timestamp = record
            .get(0)
            .ok_or_else(|| data_err(format!("line {line}: missing timestamp column")))
            .and_then(parse_timestamp)?;
        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp,
            open: column(&record, 1, "open", line)?,
            high: column(&record, 2, "high", line)?,
            low: column(&record, 3, "low", line)?,
            close: column(&record, 4, "close", line)?,
            volume: column(&record, 5, "volume", line)?,
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str, timeframe: &str) -> PathBuf {
        self.base_path.join(format!("{symbol}_{timeframe}.csv"))
    }
}

impl BarSource for CsvAdapter {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError> {
        let mut bars = read_bars(&self.csv_path(symbol, timeframe), symbol)?;
        if let Some(since) = since {
            bars.retain(|b| b.timestamp > since);
        }
        Ok(bars)
    }
}

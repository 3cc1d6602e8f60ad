use super::{SqliteAdapter, from_ms, query_err, to_ms};
use crate::domain::bar::Bar;
use crate::domain::error::LifecycleError;
use crate::ports::data_port::BarSource;
use chrono::{DateTime, Utc};
use rusqlite::params;

impl SqliteAdapter {
    /// Upsert bars; a later write for the same timestamp replaces a still-forming bar.
    pub fn insert_bars(&self, timeframe: &str, bars: &[Bar]) -> Result<(), LifecycleError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO bars (symbol, timeframe, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    bar.symbol,
                    timeframe,
                    to_ms(bar.timestamp),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ],
            )
            .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)
    }
}

impl BarSource for SqliteAdapter {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, ts, open, high, low, close, volume FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2 AND ts > ?3
                 ORDER BY ts ASC",
            )
            .map_err(query_err)?;
        let after = since.map(to_ms).unwrap_or(i64::MIN);
        let rows = stmt
            .query_map(params![symbol, timeframe, after], |row| {
                Ok(Bar {
                    symbol: row.get(0)?,
                    timestamp: from_ms(1, row.get(1)?)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(query_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(minute: i64, close: f64) -> Bar {
        Bar {
            symbol: "SPY".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000 + minute * 60, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn fetch_after_cursor() {
        let store = SqliteAdapter::in_memory().unwrap();
        store.initialize_schema().unwrap();
        store
            .insert_bars("1m", &[bar(0, 99.0), bar(1, 100.0), bar(2, 101.0)])
            .unwrap();
        assert_eq!(store.fetch_bars("SPY", "1m", None).unwrap().len(), 3);
        let later = store
            .fetch_bars("SPY", "1m", Some(bar(1, 0.0).timestamp))
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].close, 101.0);
        assert!(store.fetch_bars("SPY", "5m", None).unwrap().is_empty());
    }

    #[test]
    fn rewrite_replaces_forming_bar() {
        let store = SqliteAdapter::in_memory().unwrap();
        store.initialize_schema().unwrap();
        store.insert_bars("1m", &[bar(0, 99.0)]).unwrap();
        store.insert_bars("1m", &[bar(0, 99.5)]).unwrap();
        let bars = store.fetch_bars("SPY", "1m", None).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 99.5);
    }
}

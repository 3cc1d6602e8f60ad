//! TTL cache over a position source.
//!
//! Cached reads serve routine checks. A `fresh` read always goes to the
//! underlying source and refreshes the cache; flattening depends on it.

use crate::domain::error::LifecycleError;
use crate::ports::clock_port::Clock;
use crate::ports::portfolio_port::PositionSource;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_CACHE_TTL_SECS: i64 = 5;

#[derive(Default)]
struct Entries {
    quantities: HashMap<String, (f64, DateTime<Utc>)>,
    pnl: Option<(f64, DateTime<Utc>)>,
}

pub struct CachedPositionSource {
    inner: Arc<dyn PositionSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl CachedPositionSource {
    pub fn new(inner: Arc<dyn PositionSource>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        CachedPositionSource {
            inner,
            clock,
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - cached_at < self.ttl
    }

    pub fn invalidate(&self) {
        let mut entries = self.entries();
        entries.quantities.clear();
        entries.pnl = None;
    }
}

impl PositionSource for CachedPositionSource {
    fn net_quantity(&self, symbol: &str, fresh: bool) -> Result<f64, LifecycleError> {
        let now = self.clock.now();
        if !fresh {
            if let Some((quantity, at)) = self.entries().quantities.get(symbol).copied() {
                if self.is_live(at, now) {
                    return Ok(quantity);
                }
            }
        }
        let quantity = self.inner.net_quantity(symbol, true)?;
        debug!("position cache refreshed for {symbol}: {quantity}");
        self.entries()
            .quantities
            .insert(symbol.to_string(), (quantity, now));
        Ok(quantity)
    }

    fn daily_pnl(&self) -> Result<f64, LifecycleError> {
        let now = self.clock.now();
        if let Some((pnl, at)) = self.entries().pnl {
            if self.is_live(at, now) {
                return Ok(pnl);
            }
        }
        let pnl = self.inner.daily_pnl()?;
        self.entries().pnl = Some((pnl, now));
        Ok(pnl)
    }
}

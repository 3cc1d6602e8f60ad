//! Bar source port.

use crate::domain::bar::Bar;
use crate::domain::error::LifecycleError;
use chrono::{DateTime, Utc};

pub trait BarSource {
    /// Bars for `symbol` at `timeframe` strictly after `since`, oldest first.
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError>;
}

impl<B: BarSource + ?Sized> BarSource for Box<B> {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError> {
        (**self).fetch_bars(symbol, timeframe, since)
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::candle_series::{Candle, CandleSeries};
use crate::types::{SeriesKey, Timeframe};

/// One series behind its own lock. Readers copy out, the feed worker writes.
pub type SharedSeries = Arc<RwLock<CandleSeries>>;

/// `(symbol, timeframe) -> CandleSeries` for every seeded pair.
#[derive(Debug, Default)]
pub struct HistoricalCache {
    series: RwLock<HashMap<SeriesKey, SharedSeries>>,
}

impl HistoricalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SeriesKey) -> Option<SharedSeries> {
        self.series.read().get(key).cloned()
    }

    /// Store a freshly built series, replacing whatever was cached. The
    /// existing handle is updated in place so holders keep seeing it.
    pub fn insert(&self, series: CandleSeries) -> SharedSeries {
        let key = series.key().clone();
        let mut map = self.series.write();
        match map.get(&key) {
            Some(existing) => {
                *existing.write() = series;
                existing.clone()
            }
            None => {
                let shared = Arc::new(RwLock::new(series));
                map.insert(key, shared.clone());
                shared
            }
        }
    }

    pub fn get_or_insert_with(
        &self,
        key: &SeriesKey,
        build: impl FnOnce() -> CandleSeries,
    ) -> SharedSeries {
        if let Some(found) = self.get(key) {
            return found;
        }
        self.series
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(build())))
            .clone()
    }

    /// Copy of one series, oldest first.
    pub fn snapshot(&self, key: &SeriesKey) -> Option<Vec<Candle>> {
        self.get(key).map(|s| s.read().snapshot())
    }

    pub fn latest(&self, key: &SeriesKey) -> Option<Candle> {
        self.get(key).and_then(|s| s.read().latest())
    }

    /// Cached timeframes of `symbol`, finest first.
    pub fn timeframes_of(&self, symbol: &str) -> Vec<Timeframe> {
        let mut tfs: Vec<Timeframe> = self
            .series
            .read()
            .keys()
            .filter(|k| k.symbol == symbol)
            .map(|k| k.timeframe)
            .collect();
        tfs.sort();
        tfs
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        self.series.read().keys().cloned().collect()
    }

    /// Drop every series of `symbol`. Returns how many were removed.
    pub fn remove_symbol(&self, symbol: &str) -> usize {
        let mut map = self.series.write();
        let before = map.len();
        map.retain(|k, _| k.symbol != symbol);
        before - map.len()
    }

    pub fn clear(&self) {
        self.series.write().clear();
    }

    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }
}

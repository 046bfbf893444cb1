use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::FeedError;
use crate::types::{SeriesKey, Timeframe};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLC bucket.
///
/// Invariant: `low <= min(open, close)` and `high >= max(open, close)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Fabricated by the engine rather than observed on the market.
    #[serde(default)]
    pub synthetic: bool,
}

impl Candle {
    /// Build a market candle, widening high/low if the inputs disagree.
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            synthetic: false,
        }
        .normalized()
    }

    /// Flat continuity candle: `open = high = low = close = price`.
    pub fn flat(open_time: i64, price: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            synthetic: true,
        }
    }

    /// Restore the OHLC invariant by widening high and low.
    pub fn normalized(mut self) -> Self {
        self.high = self.high.max(self.open).max(self.close);
        self.low = self.low.min(self.open).min(self.close);
        self
    }

    pub fn is_consistent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }

    /// Merge a later observation of the same bucket: high/low only widen,
    /// close is last-write-wins, open is kept.
    fn absorb(&mut self, later: &Candle) {
        self.high = self.high.max(later.high);
        self.low = self.low.min(later.low);
        self.close = later.close;
        self.synthetic = later.synthetic;
    }
}

/// What an accepted upsert did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The still-forming last bucket was updated in place.
    Updated,
    /// A new bucket was appended after `filled` flat continuity candles.
    Appended { filled: usize },
}

// ---------------------------------------------------------------------------
// CandleSeries -- bounded buffer for one (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Ordered, capacity-bounded candle buffer for one `(symbol, timeframe)`.
///
/// Open times are strictly increasing and contiguous: a jump of more than one
/// bucket is bridged with flat candles at the previous close. When the length
/// exceeds the capacity the oldest bucket is evicted.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    key: SeriesKey,
    candles: VecDeque<Candle>,
    capacity: usize,
    synthetic: bool,
}

impl CandleSeries {
    pub const DEFAULT_CAPACITY: usize = 120;

    pub fn new(key: SeriesKey, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            key,
            candles: VecDeque::with_capacity(capacity + 1),
            capacity,
            synthetic: false,
        }
    }

    /// Build a series by upserting `candles` in order. Late or duplicate
    /// entries in the input are merged or dropped exactly as live ticks are.
    pub fn from_candles(
        key: SeriesKey,
        capacity: usize,
        candles: impl IntoIterator<Item = Candle>,
        synthetic: bool,
    ) -> Self {
        let mut series = Self::new(key, capacity);
        for candle in candles {
            if let Err(e) = series.upsert(candle) {
                debug!(error = %e, "dropping unordered history entry");
            }
        }
        series.synthetic = synthetic;
        series
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn timeframe(&self) -> Timeframe {
        self.key.timeframe
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// True when any part of the series was built from non-market data.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn mark_synthetic(&mut self) {
        self.synthetic = true;
    }

    pub fn latest(&self) -> Option<Candle> {
        self.candles.back().copied()
    }

    /// Owned copy of the series, oldest first.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    /// True when the newest bucket is more than one bucket behind `now_ms`.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        let tf = self.key.timeframe;
        match self.candles.back() {
            Some(last) => last.open_time.saturating_add(tf.width_ms()) < tf.bucket_start(now_ms),
            None => true,
        }
    }

    /// Insert or merge `candle`.
    ///
    /// * Same bucket as the latest: merged in place.
    /// * Later bucket: appended, after flat candles for any skipped buckets.
    /// * Earlier bucket: rejected with [`FeedError::OutOfOrderTick`]; the
    ///   series is left untouched.
    pub fn upsert(&mut self, candle: Candle) -> Result<Upsert, FeedError> {
        let tf = self.key.timeframe;
        let mut candle = candle.normalized();
        candle.open_time = tf.bucket_start(candle.open_time);

        let Some(last) = self.candles.back_mut() else {
            self.candles.push_back(candle);
            return Ok(Upsert::Appended { filled: 0 });
        };

        if candle.open_time == last.open_time {
            last.absorb(&candle);
            trace!(key = %self.key, close = candle.close, "bucket updated in place");
            return Ok(Upsert::Updated);
        }

        if candle.open_time < last.open_time {
            return Err(FeedError::OutOfOrderTick {
                key: self.key.to_string(),
                open_time: candle.open_time,
                latest: last.open_time,
            });
        }

        let width = tf.width_ms();
        let prev_close = last.close;
        let prev_open_time = last.open_time;
        // A span too wide for i64 is treated like any gap wider than the series.
        let missing = candle
            .open_time
            .checked_sub(prev_open_time)
            .and_then(|span| usize::try_from(span / width - 1).ok())
            .unwrap_or(usize::MAX);
        // Buckets older than `capacity - 1` gaps would be evicted immediately.
        let filled = missing.min(self.capacity - 1);
        if filled < missing {
            self.candles.clear();
        }
        for back in (1..=filled).rev() {
            let open_time = candle.open_time - width * back as i64;
            self.push_bounded(Candle::flat(open_time, prev_close));
        }
        if filled > 0 {
            self.synthetic = true;
            debug!(key = %self.key, filled, "bridged gap with flat candles");
        }

        self.push_bounded(candle);
        Ok(Upsert::Appended { filled })
    }

    fn push_bounded(&mut self, candle: Candle) {
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn key(tf: Timeframe) -> SeriesKey {
        SeriesKey::new("BTCUSDT", tf)
    }

    fn series(capacity: usize) -> CandleSeries {
        CandleSeries::new(key(Timeframe::Minute1), capacity)
    }

    fn c(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(open_time, open, high, low, close)
    }

    #[test]
    fn same_bucket_updates_in_place() {
        let mut s = series(120);
        assert_eq!(
            s.upsert(c(60_000, 100.0, 105.0, 99.0, 103.0)).unwrap(),
            Upsert::Appended { filled: 0 }
        );
        assert_eq!(
            s.upsert(c(60_000, 100.0, 105.0, 99.0, 110.0)).unwrap(),
            Upsert::Updated
        );

        assert_eq!(s.len(), 1);
        let last = s.latest().unwrap();
        assert_eq!(last.high, 110.0);
        assert_eq!(last.close, 110.0);
        assert_eq!(last.low, 99.0);
        assert_eq!(last.open, 100.0);
    }

    #[test]
    fn in_place_update_never_narrows_range() {
        let mut s = series(120);
        s.upsert(c(0, 100.0, 108.0, 92.0, 101.0)).unwrap();
        s.upsert(c(0, 100.0, 102.0, 98.0, 99.0)).unwrap();
        let last = s.latest().unwrap();
        assert_eq!(last.high, 108.0);
        assert_eq!(last.low, 92.0);
        assert_eq!(last.close, 99.0);
    }

    #[test]
    fn later_bucket_appends() {
        let mut s = series(120);
        s.upsert(c(0, 100.0, 101.0, 99.0, 100.5)).unwrap();
        s.upsert(c(60_000, 100.5, 102.0, 100.0, 101.0)).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.latest().unwrap().open_time, 60_000);
    }

    #[test]
    fn late_tick_is_rejected_without_side_effects() {
        let mut s = series(120);
        s.upsert(c(0, 100.0, 101.0, 99.0, 100.0)).unwrap();
        s.upsert(c(60_000, 100.0, 101.0, 99.0, 100.5)).unwrap();
        let before = s.snapshot();

        let err = s.upsert(c(0, 50.0, 500.0, 1.0, 300.0)).unwrap_err();
        assert!(matches!(err, FeedError::OutOfOrderTick { .. }));
        assert_eq!(s.snapshot(), before);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn two_bucket_gap_inserts_two_flat_candles() {
        let mut s = series(120);
        s.upsert(c(0, 100.0, 101.0, 99.0, 100.7)).unwrap();
        let outcome = s.upsert(c(180_000, 101.0, 102.0, 100.0, 101.5)).unwrap();
        assert_eq!(outcome, Upsert::Appended { filled: 2 });

        let snap = s.snapshot();
        assert_eq!(snap.len(), 4);
        for (i, candle) in snap.iter().enumerate() {
            assert_eq!(candle.open_time, i as i64 * 60_000);
        }
        for flat in &snap[1..3] {
            assert!(flat.synthetic);
            assert_eq!(flat.open, 100.7);
            assert_eq!(flat.high, 100.7);
            assert_eq!(flat.low, 100.7);
            assert_eq!(flat.close, 100.7);
        }
        assert!(!snap[3].synthetic);
        assert!(s.is_synthetic());
    }

    #[test]
    fn contiguous_buckets_stay_market_data() {
        let mut s = series(120);
        s.upsert(c(0, 1.0, 1.0, 1.0, 1.0)).unwrap();
        s.upsert(c(60_000, 1.0, 1.0, 1.0, 1.0)).unwrap();
        assert!(!s.is_synthetic());
    }

    #[test]
    fn span_beyond_i64_is_treated_as_wide_gap() {
        let mut s = series(4);
        let first = Timeframe::Minute1.bucket_start(-9_000_000_000_000_000_000);
        let far = Timeframe::Minute1.bucket_start(9_000_000_000_000_000_000);
        s.upsert(c(first, 5.0, 5.0, 5.0, 5.0)).unwrap();
        let outcome = s.upsert(c(far, 6.0, 6.0, 6.0, 6.0)).unwrap();
        assert_eq!(outcome, Upsert::Appended { filled: 3 });

        let snap = s.snapshot();
        assert_eq!(snap.len(), 4);
        assert_eq!(snap[3].open_time, far);
        assert_eq!(snap[0].open_time, far - 3 * 60_000);
        assert!(snap[..3].iter().all(|flat| flat.close == 5.0));
        assert!(s.is_synthetic());
    }

    #[test]
    fn gap_wider_than_capacity_keeps_window_contiguous() {
        let mut s = series(5);
        s.upsert(c(0, 100.0, 100.0, 100.0, 100.0)).unwrap();
        s.upsert(c(60_000 * 50, 101.0, 101.0, 101.0, 101.0)).unwrap();

        let snap = s.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap.last().unwrap().open_time, 60_000 * 50);
        for pair in snap.windows(2) {
            assert_eq!(pair[1].open_time - pair[0].open_time, 60_000);
        }
        assert!(snap[..4].iter().all(|c| c.synthetic && c.close == 100.0));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut s = series(3);
        for i in 0..5 {
            let p = 100.0 + i as f64;
            s.upsert(c(i * 60_000, p, p, p, p)).unwrap();
        }
        let closes: Vec<f64> = s.snapshot().iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn unaligned_open_time_snaps_to_bucket() {
        let mut s = series(10);
        s.upsert(c(61_234, 1.0, 1.0, 1.0, 1.0)).unwrap();
        s.upsert(c(119_999, 1.0, 2.0, 1.0, 2.0)).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s.latest().unwrap().open_time, 60_000);
    }

    #[test]
    fn inconsistent_input_is_normalized() {
        let candle = c(0, 100.0, 90.0, 110.0, 95.0);
        assert!(candle.is_consistent());
        assert_eq!(candle.high, 100.0);
        assert_eq!(candle.low, 90.0);
    }

    #[test]
    fn random_tick_sequences_hold_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut s = CandleSeries::new(key(Timeframe::Second1), 120);
            let mut t: i64 = 1_700_000_000_000;
            for _ in 0..400 {
                // Mostly forward, sometimes same bucket, sometimes late.
                t += rng.random_range(-2_500..4_000);
                let open: f64 = rng.random_range(90.0..110.0);
                let close: f64 = rng.random_range(90.0..110.0);
                let high = open.max(close) + rng.random_range(0.0..2.0);
                let low = open.min(close) - rng.random_range(0.0..2.0);
                let before = s.snapshot();
                match s.upsert(c(t, open, high, low, close)) {
                    Ok(_) => {}
                    Err(_) => assert_eq!(s.snapshot(), before),
                }

                let snap = s.snapshot();
                assert!(snap.len() <= 120);
                assert!(snap.iter().all(Candle::is_consistent));
                for pair in snap.windows(2) {
                    assert_eq!(pair[1].open_time - pair[0].open_time, 1_000);
                }
            }
        }
    }

    #[test]
    fn staleness_tracks_clock() {
        let mut s = series(10);
        assert!(s.is_stale(0));
        s.upsert(c(600_000, 1.0, 1.0, 1.0, 1.0)).unwrap();
        assert!(!s.is_stale(600_500));
        assert!(!s.is_stale(660_500));
        assert!(s.is_stale(720_500));
    }

    #[test]
    fn from_candles_keeps_order_and_flag() {
        let input = vec![
            c(0, 1.0, 1.0, 1.0, 1.0),
            c(60_000, 2.0, 2.0, 2.0, 2.0),
            c(30_000, 9.0, 9.0, 9.0, 9.0),
            c(120_000, 3.0, 3.0, 3.0, 3.0),
        ];
        let s = CandleSeries::from_candles(key(Timeframe::Minute1), 120, input, true);
        assert_eq!(s.len(), 3);
        assert!(s.is_synthetic());
        assert_eq!(s.latest().unwrap().close, 3.0);
    }
}

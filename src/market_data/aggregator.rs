// =============================================================================
// Timeframe aggregation — coarser candles derived from the base feed
// =============================================================================
//
// Only tick closes are observed, so an intra-bucket extreme that never shows
// up as a close is not reflected in the derived high/low.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::candle_series::Candle;
use crate::types::Timeframe;

/// Builds candles for every target timeframe out of base-timeframe ticks.
#[derive(Debug, Clone)]
pub struct TimeframeAggregator {
    open: BTreeMap<Timeframe, Option<Candle>>,
}

impl TimeframeAggregator {
    /// `targets` that are not strictly coarser multiples of `base` are ignored.
    pub fn new(base: Timeframe, targets: impl IntoIterator<Item = Timeframe>) -> Self {
        let open = targets
            .into_iter()
            .filter(|tf| tf.is_coarser_than(base))
            .map(|tf| (tf, None))
            .collect();
        Self { open }
    }

    pub fn targets(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.open.keys().copied()
    }

    /// Continue from an existing bucket, typically the latest seeded candle,
    /// so the first live tick extends it instead of restarting it.
    pub fn prime(&mut self, timeframe: Timeframe, candle: Candle) {
        if let Some(slot) = self.open.get_mut(&timeframe) {
            let mut primed = candle;
            primed.open_time = timeframe.bucket_start(candle.open_time);
            *slot = Some(primed);
        }
    }

    /// Fold one base tick into every target. Returns the current bucket of
    /// each target that accepted the tick.
    pub fn push(&mut self, tick: &Candle) -> Vec<(Timeframe, Candle)> {
        let price = tick.close;
        let mut updated = Vec::with_capacity(self.open.len());

        for (&tf, slot) in self.open.iter_mut() {
            let bucket = tf.bucket_start(tick.open_time);
            let candle = match slot {
                Some(current) if current.open_time == bucket => {
                    current.high = current.high.max(price);
                    current.low = current.low.min(price);
                    current.close = price;
                    current.synthetic = tick.synthetic;
                    *current
                }
                Some(current) if bucket < current.open_time => {
                    debug!(
                        timeframe = %tf,
                        bucket,
                        open_bucket = current.open_time,
                        "late tick skipped by aggregator"
                    );
                    continue;
                }
                _ => {
                    let fresh = Candle {
                        open_time: bucket,
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        synthetic: tick.synthetic,
                    };
                    trace!(timeframe = %tf, bucket, "aggregator opened bucket");
                    *slot = Some(fresh);
                    fresh
                }
            };
            updated.push((tf, candle));
        }

        updated
    }
}

// =============================================================================
// Synthetic candles — deterministic random walk used when market data is
// unavailable
// =============================================================================

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::candle_series::Candle;
use crate::types::Timeframe;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit seed for a `(symbol, timeframe)` pair (FNV-1a).
pub fn walk_seed(symbol: &str, timeframe: Timeframe) -> u64 {
    symbol
        .bytes()
        .chain(std::iter::once(b'@'))
        .chain(timeframe.as_str().bytes())
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
}

/// `count` contiguous synthetic candles ending with the bucket that contains
/// `end_ms`. The same inputs always produce the same series.
pub fn random_walk(
    symbol: &str,
    timeframe: Timeframe,
    count: usize,
    end_ms: i64,
    base_price: f64,
) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(walk_seed(symbol, timeframe));
    let vol = timeframe.synthetic_volatility();
    let width = timeframe.width_ms();
    let last_open = timeframe.bucket_start(end_ms);
    let first_open = last_open - width * count.saturating_sub(1) as i64;

    let mut price = base_price.max(f64::MIN_POSITIVE);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let open = price;
        let close = (open * (1.0 + rng.random_range(-vol..vol))).max(f64::MIN_POSITIVE);
        let wick_up = rng.random_range(0.0..vol / 2.0);
        let wick_down = rng.random_range(0.0..vol / 2.0);
        out.push(Candle {
            open_time: first_open + width * i as i64,
            open,
            high: open.max(close) * (1.0 + wick_up),
            low: open.min(close) * (1.0 - wick_down),
            close,
            synthetic: true,
        });
        price = close;
    }
    out
}

/// Endless price source for a degraded feed, continuing from the last close.
#[derive(Debug, Clone)]
pub struct SyntheticTicker {
    rng: StdRng,
    price: f64,
    volatility: f64,
}

impl SyntheticTicker {
    pub fn new(symbol: &str, timeframe: Timeframe, start_price: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(walk_seed(symbol, timeframe).rotate_left(17)),
            price: start_price.max(f64::MIN_POSITIVE),
            volatility: timeframe.synthetic_volatility(),
        }
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn next_price(&mut self) -> f64 {
        let step = self.rng.random_range(-self.volatility..self.volatility);
        self.price = (self.price * (1.0 + step)).max(f64::MIN_POSITIVE);
        self.price
    }
}

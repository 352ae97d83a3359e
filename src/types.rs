//! Core type definitions for the up/down arbitrage engine.
//!
//! All price arithmetic is integer-only. Prices are stored in milli-units
//! (1.0 == 1000) so that every supported venue tick size (0.01, 0.001) is an
//! integer number of millis and the arbitrage comparison
//! `ask_up + ask_down < 1.0` stays exact near the boundary.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::error::EngineError;

// =============================================================================
// PRICE AND SIZE TYPES
// =============================================================================

/// Price in milli-units (1-999 for $0.001-$0.999)
pub type PriceMillis = u32;

/// Share quantity in hundredths of a share (size * 100)
pub type SizeHundredths = u64;

/// Money amount in cents
pub type Cents = i64;

/// Full notional of one resolved share pair, in millis
pub const UNIT_MILLIS: PriceMillis = 1000;

static MONO_START: OnceLock<Instant> = OnceLock::new();

// =============================================================================
// MARKET
// =============================================================================

/// Which outcome token of a binary market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketSide {
    Up,
    Down,
}

impl MarketSide {
    pub fn other(self) -> Self {
        match self {
            MarketSide::Up => MarketSide::Down,
            MarketSide::Down => MarketSide::Up,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarketSide::Up => "up",
            MarketSide::Down => "down",
        }
    }
}

impl std::fmt::Display for MarketSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered binary up/down market. Immutable after registration.
#[derive(Debug, Clone)]
pub struct Market {
    /// Venue market identifier
    pub market_id: Arc<str>,
    /// Token paying 1.0 when the market resolves up
    pub up_token: Arc<str>,
    /// Token paying 1.0 when the market resolves down
    pub down_token: Arc<str>,
    /// Resolution time, unix seconds
    pub expiry_ts: i64,
    /// Price tick in millis (10 for $0.01 markets, 1 for $0.001)
    pub tick_millis: PriceMillis,
    /// Taker fee in basis points
    pub taker_fee_bps: u32,
    /// Maker fee in basis points
    pub maker_fee_bps: u32,
    /// Venue-enforced minimum order size, share hundredths (0 = none)
    pub min_order_size: SizeHundredths,
}

impl Market {
    pub fn token(&self, side: MarketSide) -> &Arc<str> {
        match side {
            MarketSide::Up => &self.up_token,
            MarketSide::Down => &self.down_token,
        }
    }

    /// Seconds until resolution; negative once expired
    pub fn ttr_secs(&self, now_unix: i64) -> i64 {
        self.expiry_ts - now_unix
    }
}

// =============================================================================
// OPPORTUNITY
// =============================================================================

/// A detected arbitrage opportunity. Derived from book snapshots, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opportunity {
    pub market_id: Arc<str>,
    pub ask_up: PriceMillis,
    pub ask_down: PriceMillis,
    pub size_up: SizeHundredths,
    pub size_down: SizeHundredths,
    /// 1000 - ask_up - ask_down - fee_reserve
    pub margin_millis: i64,
    pub detected_ns: u64,
    pub seq_up: u64,
    pub seq_down: u64,
}

impl Opportunity {
    /// Pair size limited by the thinner side
    pub fn size(&self) -> SizeHundredths {
        self.size_up.min(self.size_down)
    }

    pub fn combined_ask(&self) -> PriceMillis {
        self.ask_up + self.ask_down
    }
}

// =============================================================================
// CLOCKS
// =============================================================================

/// Monotonic timestamp in nanoseconds since process start.
/// Used for every freshness and latency decision; never the wall clock.
#[inline(always)]
pub fn monotonic_now_ns() -> u64 {
    MONO_START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

static LAST_WALL_SECS: AtomicI64 = AtomicI64::new(0);

/// Tolerated backwards wall-clock movement before reporting skew
const CLOCK_SKEW_TOLERANCE_SECS: i64 = 2;

/// Unix seconds, guarded against the wall clock moving backwards.
/// Time-to-resolution math depends on this; a rewinding clock would make
/// the execution engine pick the wrong leg policy.
pub fn unix_now() -> Result<i64, EngineError> {
    let now = chrono::Utc::now().timestamp();
    let prev = LAST_WALL_SECS.fetch_max(now, Ordering::AcqRel);
    if prev - now > CLOCK_SKEW_TOLERANCE_SECS {
        return Err(EngineError::ClockSkew(prev - now));
    }
    Ok(now)
}

// =============================================================================
// PARSING AND CONVERSION
// =============================================================================

/// Fast string hashing for token-id keys
#[inline(always)]
pub fn fxhash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Parse a wire decimal price ("0.475") into millis.
/// Fast path for the 0.X / 0.XX / 0.XXX shapes the venue sends.
pub fn parse_price_millis(s: &str) -> Option<PriceMillis> {
    let bytes = s.as_bytes();
    if bytes.len() >= 3 && bytes.len() <= 5 && bytes[0] == b'0' && bytes[1] == b'.' {
        let mut millis: u32 = 0;
        for (i, &b) in bytes[2..].iter().enumerate() {
            let d = b.wrapping_sub(b'0');
            if d >= 10 {
                return parse_price_slow(s);
            }
            millis += d as u32 * 10u32.pow(2 - i as u32);
        }
        return Some(millis);
    }
    parse_price_slow(s)
}

fn parse_price_slow(s: &str) -> Option<PriceMillis> {
    let v: f64 = s.parse().ok()?;
    if !(0.0..=1.0).contains(&v) {
        return None;
    }
    Some((v * 1000.0).round() as PriceMillis)
}

/// Parse a wire share size ("125.5") into hundredths
pub fn parse_size_hundredths(s: &str) -> SizeHundredths {
    s.parse::<f64>()
        .map(|v| (v * 100.0).round().max(0.0) as SizeHundredths)
        .unwrap_or(0)
}

/// Cost in cents of `size` shares at `price`, rounded up.
/// shares_h / 100 shares * millis / 1000 dollars = shares_h * millis / 1000 cents
pub fn cost_cents_ceil(size: SizeHundredths, price: PriceMillis) -> Cents {
    ((size as u128 * price as u128 + 999) / 1000) as Cents
}

/// Cost in cents rounded down; used when settling realized fills
pub fn cost_cents_floor(size: SizeHundredths, price: PriceMillis) -> Cents {
    (size as u128 * price as u128 / 1000) as Cents
}

/// Payout in cents for `pairs` matched share pairs (each pays $1.00)
pub fn payout_cents(pairs: SizeHundredths) -> Cents {
    pairs as Cents
}

pub fn millis_to_f64(price: PriceMillis) -> f64 {
    price as f64 / 1000.0
}

// =============================================================================
// TESTS
// =============================================================================

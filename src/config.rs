//! Engine configuration.
//!
//! Runtime-tunable values come from the environment with conservative
//! defaults; hard protocol constants (heartbeat cadence, call timeouts)
//! live here as consts so every module reads the same numbers.

use std::time::Duration;

use crate::error::EngineError;
use crate::types::{Cents, PriceMillis, SizeHundredths};

// =============================================================================
// VENUE ENDPOINTS
// =============================================================================

/// Market-data WebSocket endpoint
pub const DEFAULT_WS_URL: &str = "wss://ws.venue.example/ws/market";

/// REST base for books, markets, and order submission
pub const DEFAULT_REST_URL: &str = "https://clob.venue.example";

/// Per-user fill stream endpoint
pub const DEFAULT_USER_WS_URL: &str = "wss://ws.venue.example/ws/user";

// =============================================================================
// TIMING CONSTANTS
// =============================================================================

/// WebSocket ping cadence
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Reconnect if no traffic for this long
pub const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

/// Reconnect backoff: base delay, doubling to the cap, full jitter
pub const WS_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const WS_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Consecutive unparseable frames before the connection is torn down
pub const WS_MAX_PARSE_ERRORS: u32 = 3;

/// REST poll request timeout
pub const POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// Bounded concurrency for poll-mode book fetches
pub const POLL_CONCURRENCY: usize = 8;

/// Order submit / ack-wait timeout
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Hedge order timeout
pub const HEDGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Maker-leg escalation attempts before hedging
pub const MAX_ESCALATIONS: u32 = 2;

/// Circuit breaker: failures within the window that halt submissions
pub const BREAKER_THRESHOLD: usize = 5;
pub const BREAKER_WINDOW: Duration = Duration::from_secs(60);
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Execution strategy thresholds on time-to-resolution (seconds)
pub const MAKER_ONLY_TTR_SECS: i64 = 120;
pub const HYBRID_TTR_SECS: i64 = 60;
pub const TAKER_ONLY_TTR_SECS: i64 = 30;

/// Discovery only tracks markets resolving within this horizon; windows
/// further out have empty books
pub const MAX_CLOSE_HORIZON_SECS: i64 = 1800;

// =============================================================================
// CONFIG
// =============================================================================

/// Typed configuration snapshot consumed by the engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Starting bankroll in cents
    pub bankroll_cents: Cents,
    /// Hard cap on notional per arbitrage, cents
    pub max_bet_size_cents: Cents,
    /// Minimum accepted margin after fees, millis
    pub min_profit_margin_millis: i64,
    /// Fraction of total bankroll a single reservation may claim
    pub max_bankroll_fraction: f64,
    /// Minimum pair size worth executing, share hundredths
    pub min_size: SizeHundredths,
    /// Minimum accepted notional, cents
    pub min_notional_cents: Cents,
    /// Poll-mode scan cadence
    pub scan_interval: Duration,
    /// Enable the push feed (poll remains as fallback)
    pub ws_enabled: bool,
    /// Assets to discover markets for (e.g. btc, eth)
    pub assets: Vec<String>,
    /// Market durations to discover (e.g. 5m, 15m)
    pub durations: Vec<String>,
    /// Replace venue submission with the in-memory simulator
    pub dry_run: bool,
    /// Maximum book age still usable for decisions
    pub freshness_ttl: Duration,
    /// Hard TTL on bankroll reservations
    pub reservation_ttl: Duration,
    /// One-sided exposure must be hedged within this window
    pub max_imbalance: Duration,
    /// Default fee reserve when discovery provides no schedule, bps
    pub fee_reserve_bps: u32,
    /// Hedge price tolerance around the reference, ticks
    pub max_slippage_ticks: u32,
    /// Detector worker pool size
    pub detector_workers: usize,
    /// Concurrent execution attempts before new work is rejected
    pub max_submissions: usize,
    /// Synthetic fill latency for dry-run mode
    pub sim_fill_latency: Duration,
    /// Market-data WebSocket URL
    pub ws_url: String,
    /// REST base URL
    pub rest_url: String,
    /// User fill stream URL
    pub user_ws_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bankroll_cents: 100_000, // $1000
            max_bet_size_cents: 5_000,
            min_profit_margin_millis: 10, // $0.01
            max_bankroll_fraction: 0.05,
            min_size: 100, // 1 share
            min_notional_cents: 100,
            scan_interval: Duration::from_secs(2),
            ws_enabled: true,
            assets: vec!["btc".into(), "eth".into(), "sol".into(), "xrp".into()],
            durations: vec!["5m".into(), "15m".into()],
            dry_run: true,
            freshness_ttl: Duration::from_secs(2),
            reservation_ttl: Duration::from_secs(10),
            max_imbalance: Duration::from_millis(1500),
            fee_reserve_bps: 150,
            max_slippage_ticks: 5,
            detector_workers: 8,
            max_submissions: 16,
            sim_fill_latency: Duration::from_millis(50),
            ws_url: DEFAULT_WS_URL.into(),
            rest_url: DEFAULT_REST_URL.into(),
            user_ws_url: DEFAULT_USER_WS_URL.into(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bankroll_cents: env_dollars_cents("BANKROLL", d.bankroll_cents),
            max_bet_size_cents: env_dollars_cents("MAX_BET_SIZE", d.max_bet_size_cents),
            min_profit_margin_millis: env_parse::<f64>("MIN_PROFIT_MARGIN")
                .map(|m| (m * 1000.0).round() as i64)
                .unwrap_or(d.min_profit_margin_millis),
            max_bankroll_fraction: env_parse("MAX_BANKROLL_FRACTION")
                .unwrap_or(d.max_bankroll_fraction),
            min_size: env_parse::<f64>("MIN_SIZE")
                .map(|s| (s * 100.0).round() as SizeHundredths)
                .unwrap_or(d.min_size),
            min_notional_cents: env_dollars_cents("MIN_NOTIONAL", d.min_notional_cents),
            scan_interval: env_secs("SCAN_INTERVAL", d.scan_interval),
            ws_enabled: env_bool("WS_ENABLED", d.ws_enabled),
            assets: env_list("ASSETS").unwrap_or(d.assets),
            durations: env_list("DURATIONS").unwrap_or(d.durations),
            dry_run: env_bool("DRY_RUN", d.dry_run),
            freshness_ttl: env_millis("FRESHNESS_TTL_MS", d.freshness_ttl),
            reservation_ttl: env_millis("RESERVATION_TTL_MS", d.reservation_ttl),
            max_imbalance: env_millis("MAX_IMBALANCE_MS", d.max_imbalance),
            fee_reserve_bps: env_parse("FEE_RESERVE_BPS").unwrap_or(d.fee_reserve_bps),
            max_slippage_ticks: env_parse("MAX_SLIPPAGE_TICKS").unwrap_or(d.max_slippage_ticks),
            detector_workers: env_parse("DETECTOR_WORKERS").unwrap_or(d.detector_workers),
            max_submissions: env_parse("MAX_SUBMISSIONS").unwrap_or(d.max_submissions),
            sim_fill_latency: env_millis("SIM_FILL_LATENCY_MS", d.sim_fill_latency),
            ws_url: std::env::var("WS_URL").unwrap_or(d.ws_url),
            rest_url: std::env::var("REST_URL").unwrap_or(d.rest_url),
            user_ws_url: std::env::var("USER_WS_URL").unwrap_or(d.user_ws_url),
        }
    }

    /// Validate cross-field constraints before anything spins up
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.bankroll_cents <= 0 {
            return Err(EngineError::ConfigInvalid("bankroll must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.max_bankroll_fraction) || self.max_bankroll_fraction == 0.0 {
            return Err(EngineError::ConfigInvalid(
                "max_bankroll_fraction must be in (0, 1]".into(),
            ));
        }
        if self.min_profit_margin_millis < 0 {
            return Err(EngineError::ConfigInvalid(
                "min_profit_margin cannot be negative".into(),
            ));
        }
        if self.max_bet_size_cents < self.min_notional_cents {
            return Err(EngineError::ConfigInvalid(
                "max_bet_size below min_notional".into(),
            ));
        }
        if self.assets.is_empty() || self.durations.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "at least one asset and one duration required".into(),
            ));
        }
        if self.detector_workers == 0 || self.max_submissions == 0 {
            return Err(EngineError::ConfigInvalid(
                "worker pools must be non-empty".into(),
            ));
        }
        Ok(())
    }

}

/// Fee reserve in millis on a combined ask, rounded up to stay conservative
pub fn fee_reserve_millis(combined_ask: PriceMillis, fee_bps: u32) -> i64 {
    ((fee_bps as u64 * combined_ask as u64 + 9_999) / 10_000) as i64
}

// =============================================================================
// ENV HELPERS
// =============================================================================

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn env_dollars_cents(key: &str, default: Cents) -> Cents {
    env_parse::<f64>(key)
        .map(|d| (d * 100.0).round() as Cents)
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<f64>(key)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

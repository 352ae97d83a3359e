//! Market discovery over the venue REST API.
//!
//! Enumerates active up/down markets per (asset, duration) pair and feeds the
//! registry. Short-duration markets open and close on fixed time windows, so
//! only markets resolving inside the close horizon are worth tracking; the
//! window helpers compute the boundaries of the current window.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_CLOSE_HORIZON_SECS, POLL_TIMEOUT};
use crate::error::EngineError;
use crate::feed::Connector;
use crate::registry::MarketRegistry;
use crate::types::{parse_price_millis, parse_size_hundredths, unix_now, Market};

/// Market record as the venue returns it
#[derive(Debug, Deserialize)]
pub struct WireMarket {
    pub market_id: String,
    pub up_token: String,
    pub down_token: String,
    pub expiry_ts: i64,
    #[serde(default)]
    pub tick_size: Option<String>,
    #[serde(default)]
    pub taker_fee_bps: Option<u32>,
    #[serde(default)]
    pub maker_fee_bps: Option<u32>,
    #[serde(default)]
    pub min_order_size: Option<String>,
}

/// Seconds in a duration label ("5m", "15m", "1h")
pub fn duration_secs(label: &str) -> Option<i64> {
    let (value, unit) = label.split_at(label.len().checked_sub(1)?);
    let value: i64 = value.parse().ok()?;
    match unit {
        "s" => Some(value),
        "m" => Some(value * 60),
        "h" => Some(value * 3600),
        _ => None,
    }
}

/// End of the window containing `now` for a market duration
pub fn current_window_end(window_secs: i64, now_unix: i64) -> i64 {
    now_unix - now_unix.rem_euclid(window_secs) + window_secs
}

pub struct DiscoveryClient {
    http: reqwest::Client,
    base_url: String,
    assets: Vec<String>,
    durations: Vec<String>,
    default_fee_bps: u32,
    default_tick_millis: u32,
}

impl DiscoveryClient {
    pub fn new(cfg: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: cfg.rest_url.clone(),
            assets: cfg.assets.clone(),
            durations: cfg.durations.clone(),
            default_fee_bps: cfg.fee_reserve_bps,
            default_tick_millis: 10,
        }
    }

    pub async fn fetch(&self, asset: &str, duration: &str) -> Result<Vec<Market>, EngineError> {
        let url = format!(
            "{}/markets?asset={}&duration={}",
            self.base_url, asset, duration
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::DiscoveryUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::DiscoveryUnavailable(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        let wires: Vec<WireMarket> = resp
            .json()
            .await
            .map_err(|e| EngineError::DiscoveryUnavailable(e.to_string()))?;
        Ok(wires
            .into_iter()
            .filter_map(|w| self.to_market(w))
            .collect())
    }

    /// Convert a wire record, dropping malformed entries
    pub fn to_market(&self, wire: WireMarket) -> Option<Market> {
        if wire.market_id.is_empty() || wire.up_token.is_empty() || wire.down_token.is_empty() {
            return None;
        }
        let tick_millis = match wire.tick_size {
            Some(s) => {
                let millis = parse_price_millis(&s)?;
                if millis == 0 {
                    return None;
                }
                millis
            }
            None => self.default_tick_millis,
        };
        Some(Market {
            market_id: wire.market_id.into(),
            up_token: wire.up_token.into(),
            down_token: wire.down_token.into(),
            expiry_ts: wire.expiry_ts,
            tick_millis,
            taker_fee_bps: wire.taker_fee_bps.unwrap_or(self.default_fee_bps),
            maker_fee_bps: wire.maker_fee_bps.unwrap_or(0),
            min_order_size: wire
                .min_order_size
                .as_deref()
                .map(parse_size_hundredths)
                .unwrap_or(0),
        })
    }

    /// One sweep across every (asset, duration) pair; returns markets added
    pub async fn scan(&self, registry: &MarketRegistry) -> usize {
        let now = match unix_now() {
            Ok(now) => now,
            Err(e) => {
                warn!("[DISCOVERY] scan skipped: {}", e);
                return 0;
            }
        };
        let mut added = 0;
        for asset in &self.assets {
            for duration in &self.durations {
                let markets = match self.fetch(asset, duration).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("[DISCOVERY] {}/{}: {}", asset, duration, e);
                        continue;
                    }
                };
                for market in markets {
                    let ttr = market.ttr_secs(now);
                    // far-future windows have empty books; skip until close
                    if ttr <= 0 || ttr > MAX_CLOSE_HORIZON_SECS {
                        continue;
                    }
                    match registry.add(market) {
                        Ok(true) => added += 1,
                        Ok(false) => {}
                        Err(e) => debug!("[DISCOVERY] skipped market: {}", e),
                    }
                }
            }
        }
        added
    }
}

/// Periodic discovery loop; pushes the refreshed token set to the connectors
pub async fn run_discovery(
    client: DiscoveryClient,
    registry: Arc<MarketRegistry>,
    connectors: Vec<Arc<dyn Connector>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut known_tokens = 0usize;
    loop {
        ticker.tick().await;
        let added = client.scan(&registry).await;
        let tokens = registry.all_tokens();
        if added > 0 || tokens.len() != known_tokens {
            info!(
                "[DISCOVERY] {} markets tracked ({} new)",
                registry.len(),
                added
            );
            known_tokens = tokens.len();
            for connector in &connectors {
                connector.set_tokens(tokens.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> DiscoveryClient {
        DiscoveryClient::new(&Config::default())
    }

    #[test]
    fn test_duration_secs() {
        assert_eq!(duration_secs("5m"), Some(300));
        assert_eq!(duration_secs("15m"), Some(900));
        assert_eq!(duration_secs("1h"), Some(3600));
        assert_eq!(duration_secs("90s"), Some(90));
        assert_eq!(duration_secs("weird"), None);
        assert_eq!(duration_secs(""), None);
    }

    #[test]
    fn test_window_end() {
        // 12:07:30 in a 5-minute window ends at 12:10:00
        assert_eq!(current_window_end(300, 1_000_050), 1_000_200);
        // exactly on a boundary rolls to the next window
        assert_eq!(current_window_end(300, 1_000_200), 1_000_500);
    }

    #[test]
    fn test_wire_market_parsing() {
        let json = r#"{
            "market_id": "btc-updown-5m-1771264500",
            "up_token": "tok-up",
            "down_token": "tok-down",
            "expiry_ts": 1771264800,
            "tick_size": "0.001",
            "taker_fee_bps": 150,
            "min_order_size": "5"
        }"#;
        let wire: WireMarket = serde_json::from_str(json).unwrap();
        let market = client().to_market(wire).unwrap();
        assert_eq!(market.tick_millis, 1);
        assert_eq!(market.taker_fee_bps, 150);
        assert_eq!(market.maker_fee_bps, 0);
        assert_eq!(market.min_order_size, 500);
    }

    #[test]
    fn test_wire_market_defaults() {
        let json = r#"{
            "market_id": "eth-updown-15m-1771264500",
            "up_token": "a",
            "down_token": "b",
            "expiry_ts": 1771265400
        }"#;
        let wire: WireMarket = serde_json::from_str(json).unwrap();
        let market = client().to_market(wire).unwrap();
        assert_eq!(market.tick_millis, 10);
        assert_eq!(market.taker_fee_bps, Config::default().fee_reserve_bps);
        assert_eq!(market.min_order_size, 0);
    }

    #[test]
    fn test_malformed_market_dropped() {
        let wire = WireMarket {
            market_id: "m".into(),
            up_token: "".into(),
            down_token: "b".into(),
            expiry_ts: 0,
            tick_size: None,
            taker_fee_bps: None,
            maker_fee_bps: None,
            min_order_size: None,
        };
        assert!(client().to_market(wire).is_none());

        let wire = WireMarket {
            market_id: "m".into(),
            up_token: "a".into(),
            down_token: "b".into(),
            expiry_ts: 0,
            tick_size: Some("bogus".into()),
            taker_fee_bps: None,
            maker_fee_bps: None,
            min_order_size: None,
        };
        assert!(client().to_market(wire).is_none());
    }
}

//! Market registry: the authoritative set of live up/down markets.
//!
//! Discovery feeds add/remove events in; the registry deduplicates, validates,
//! and re-emits a canonical stream for the feed ingestor. Expired markets are
//! swept on an interval.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::book::BookStore;
use crate::error::EngineError;
use crate::types::{unix_now, Market};

/// Canonical registry change stream
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Arc<Market>),
    Removed(Arc<str>),
}

struct Inner {
    /// market_id -> market
    markets: FxHashMap<Arc<str>, Arc<Market>>,
    /// token -> owning market_id, for the duplicate-token guard
    tokens: FxHashMap<Arc<str>, Arc<str>>,
}

pub struct MarketRegistry {
    inner: RwLock<Inner>,
    tx: broadcast::Sender<RegistryEvent>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner {
                markets: FxHashMap::default(),
                tokens: FxHashMap::default(),
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    /// Register a market. Re-adding the same id is a deduplicated no-op
    /// (returns false); a token collision with a different live market fails.
    pub fn add(&self, market: Market) -> Result<bool, EngineError> {
        if market.up_token.is_empty() || market.down_token.is_empty() {
            return Err(EngineError::ConfigInvalid(format!(
                "market {} has an empty token id",
                market.market_id
            )));
        }
        if market.up_token == market.down_token {
            return Err(EngineError::ConfigInvalid(format!(
                "market {} lists the same token for both outcomes",
                market.market_id
            )));
        }
        let now = unix_now()?;
        if market.expiry_ts <= now {
            return Err(EngineError::ConfigInvalid(format!(
                "market {} already expired",
                market.market_id
            )));
        }

        let market = Arc::new(market);
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if inner.markets.contains_key(&market.market_id) {
            return Ok(false);
        }

        for token in [&market.up_token, &market.down_token] {
            if let Some(owner) = inner.tokens.get(token) {
                if *owner != market.market_id {
                    return Err(EngineError::DuplicateToken {
                        token: token.to_string(),
                        market_id: owner.to_string(),
                    });
                }
            }
        }

        inner
            .tokens
            .insert(market.up_token.clone(), market.market_id.clone());
        inner
            .tokens
            .insert(market.down_token.clone(), market.market_id.clone());
        inner
            .markets
            .insert(market.market_id.clone(), market.clone());
        drop(inner);

        info!(
            "[REGISTRY] added {} (expires in {}s)",
            market.market_id,
            market.ttr_secs(now)
        );
        let _ = self.tx.send(RegistryEvent::Added(market));
        Ok(true)
    }

    /// Remove a market. Idempotent.
    pub fn remove(&self, market_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            match inner.markets.remove(market_id) {
                Some(m) => {
                    inner.tokens.remove(&m.up_token);
                    inner.tokens.remove(&m.down_token);
                    Some(m)
                }
                None => None,
            }
        };

        match removed {
            Some(m) => {
                info!("[REGISTRY] removed {}", m.market_id);
                let _ = self.tx.send(RegistryEvent::Removed(m.market_id.clone()));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, market_id: &str) -> Option<Arc<Market>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .markets
            .get(market_id)
            .cloned()
    }

    pub fn market_for_token(&self, token: &str) -> Option<Arc<Market>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let market_id = inner.tokens.get(token)?;
        inner.markets.get(market_id).cloned()
    }

    /// Atomic enumeration of the current set
    pub fn snapshot(&self) -> Vec<Arc<Market>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .markets
            .values()
            .cloned()
            .collect()
    }

    /// All tokens across registered markets (for feed subscriptions)
    pub fn all_tokens(&self) -> Vec<Arc<str>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .tokens
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every market whose expiry has passed; returns the evicted set
    pub fn sweep_expired(&self, now_unix: i64) -> Vec<Arc<Market>> {
        let expired: Vec<Arc<Market>> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .markets
                .values()
                .filter(|m| m.expiry_ts <= now_unix)
                .cloned()
                .collect()
        };
        for m in &expired {
            self.remove(&m.market_id);
        }
        expired
    }
}

impl Default for MarketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic eviction of expired markets and their books
pub async fn run_expiry_sweep(
    registry: Arc<MarketRegistry>,
    store: Arc<BookStore>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = match unix_now() {
            Ok(now) => now,
            Err(e) => {
                warn!("[REGISTRY] sweep skipped: {}", e);
                continue;
            }
        };
        for market in registry.sweep_expired(now) {
            store.remove_token(&market.up_token);
            store.remove_token(&market.down_token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: &str, up: &str, down: &str, expiry: i64) -> Market {
        Market {
            market_id: id.into(),
            up_token: up.into(),
            down_token: down.into(),
            expiry_ts: expiry,
            tick_millis: 10,
            taker_fee_bps: 150,
            maker_fee_bps: 0,
            min_order_size: 0,
        }
    }

    fn far_future() -> i64 {
        unix_now().unwrap() + 3600
    }

    #[test]
    fn test_add_and_snapshot() {
        let reg = MarketRegistry::new();
        assert!(reg.add(market("m1", "a", "b", far_future())).unwrap());
        assert!(reg.add(market("m2", "c", "d", far_future())).unwrap());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.snapshot().len(), 2);
        assert_eq!(reg.market_for_token("c").unwrap().market_id.as_ref(), "m2");
    }

    #[test]
    fn test_duplicate_market_id_deduplicated() {
        let reg = MarketRegistry::new();
        assert!(reg.add(market("m1", "a", "b", far_future())).unwrap());
        assert!(!reg.add(market("m1", "a", "b", far_future())).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let reg = MarketRegistry::new();
        reg.add(market("m1", "a", "b", far_future())).unwrap();
        let err = reg.add(market("m2", "a", "c", far_future())).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateToken { .. }));
    }

    #[test]
    fn test_validation() {
        let reg = MarketRegistry::new();
        assert!(reg.add(market("m1", "", "b", far_future())).is_err());
        assert!(reg.add(market("m2", "a", "a", far_future())).is_err());
        assert!(reg.add(market("m3", "a", "b", 1)).is_err());
    }

    #[test]
    fn test_remove_idempotent() {
        let reg = MarketRegistry::new();
        reg.add(market("m1", "a", "b", far_future())).unwrap();
        assert!(reg.remove("m1"));
        assert!(!reg.remove("m1"));
        // tokens are freed for reuse
        assert!(reg.add(market("m2", "a", "b", far_future())).unwrap());
    }

    #[test]
    fn test_sweep_expired() {
        let reg = MarketRegistry::new();
        let now = unix_now().unwrap();
        reg.add(market("m1", "a", "b", now + 5)).unwrap();
        reg.add(market("m2", "c", "d", now + 3600)).unwrap();

        let evicted = reg.sweep_expired(now + 10);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].market_id.as_ref(), "m1");
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let reg = MarketRegistry::new();
        let mut rx = reg.subscribe();

        reg.add(market("m1", "a", "b", far_future())).unwrap();
        reg.remove("m1");

        match rx.recv().await.unwrap() {
            RegistryEvent::Added(m) => assert_eq!(m.market_id.as_ref(), "m1"),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            RegistryEvent::Removed(id) => assert_eq!(id.as_ref(), "m1"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

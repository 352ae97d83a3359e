//! Feed ingestion: real-time push subscription with REST polling fallback.
//!
//! Both modes normalize venue data into `BookStore` writes and then signal
//! the detector through the coalescing queue. The push connector owns one
//! WebSocket carrying every registered token; the poller sweeps top-of-book
//! with bounded concurrency. Either can run alone; when both run, the
//! per-token sequence check arbitrates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::book::{BookStore, BookUpdate};
use crate::config::{
    POLL_CONCURRENCY, POLL_TIMEOUT, WS_BACKOFF_BASE, WS_BACKOFF_CAP, WS_IDLE_TIMEOUT,
    WS_MAX_PARSE_ERRORS, WS_PING_INTERVAL,
};
use crate::detector::SignalQueue;
use crate::error::EngineError;
use crate::events::{BotEvent, EventBus};
use crate::gateway::{FillRouter, WireFill};
use crate::registry::MarketRegistry;
use crate::stats::SessionStats;
use crate::types::{parse_price_millis, parse_size_hundredths, PriceMillis, SizeHundredths};

// =============================================================================
// WIRE FRAMES
// =============================================================================

#[derive(Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    tokens: &'a [Arc<str>],
}

#[derive(Debug, Deserialize)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

#[derive(Debug, Deserialize)]
pub struct WireChange {
    pub side: String,
    pub price: String,
    pub size: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    Snapshot {
        token: String,
        bids: Vec<WireLevel>,
        asks: Vec<WireLevel>,
        seq: u64,
    },
    Delta {
        token: String,
        changes: Vec<WireChange>,
        seq: u64,
    },
    /// Trade prints are irrelevant to top-of-book arbitrage
    Trade {},
    Heartbeat,
}

/// REST /book response
#[derive(Debug, Deserialize)]
struct WireBook {
    bids: Vec<WireLevel>,
    asks: Vec<WireLevel>,
    seq: u64,
}

fn best_bid(levels: &[WireLevel]) -> (Option<PriceMillis>, SizeHundredths) {
    levels
        .iter()
        .filter_map(|l| {
            let price = parse_price_millis(&l.price)?;
            let size = parse_size_hundredths(&l.size);
            (size > 0).then_some((price, size))
        })
        .max_by_key(|(p, _)| *p)
        .map_or((None, 0), |(p, s)| (Some(p), s))
}

fn best_ask(levels: &[WireLevel]) -> (Option<PriceMillis>, SizeHundredths) {
    levels
        .iter()
        .filter_map(|l| {
            let price = parse_price_millis(&l.price)?;
            let size = parse_size_hundredths(&l.size);
            (size > 0).then_some((price, size))
        })
        .min_by_key(|(p, _)| *p)
        .map_or((None, 0), |(p, s)| (Some(p), s))
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential backoff with full jitter
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: uniform over [0, min(cap, base * 2^attempt)]
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Upper bound of the next delay without consuming an attempt
    pub fn ceiling(&self) -> Duration {
        self.base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap)
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Capability set shared by both ingestion modes. The core holds connectors
/// behind this trait and never branches on the concrete type.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run until `stop`; reconnection and recovery are internal
    async fn start(self: Arc<Self>);

    fn stop(&self);

    /// Flag everything this connector feeds as unusable
    fn mark_all_stale(&self);

    /// Replace the token subscription set
    fn set_tokens(&self, tokens: Vec<Arc<str>>);
}

// =============================================================================
// PUSH FEED
// =============================================================================

pub struct PushFeed {
    url: String,
    store: Arc<BookStore>,
    registry: Arc<MarketRegistry>,
    signals: Arc<SignalQueue>,
    bus: EventBus,
    stats: Arc<SessionStats>,
    tokens: RwLock<Vec<Arc<str>>>,
    resubscribe: Notify,
    running: AtomicBool,
    disconnected: AtomicBool,
}

impl PushFeed {
    pub fn new(
        url: String,
        store: Arc<BookStore>,
        registry: Arc<MarketRegistry>,
        signals: Arc<SignalQueue>,
        bus: EventBus,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            url,
            store,
            registry,
            signals,
            bus,
            stats,
            tokens: RwLock::new(Vec::new()),
            resubscribe: Notify::new(),
            running: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
        }
    }

    async fn run_connection(&self, backoff: &mut Backoff) -> Result<(), EngineError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| EngineError::FeedTransport(e.to_string()))?;
        backoff.reset();
        if self.disconnected.swap(false, Ordering::AcqRel) {
            self.bus.publish(BotEvent::FeedReconnected { source: "push" });
        }
        let (mut write, mut read) = ws.split();

        let tokens = self.tokens.read().expect("token lock poisoned").clone();
        if tokens.is_empty() {
            // nothing to subscribe yet; wait for set_tokens
            self.resubscribe.notified().await;
            return Ok(());
        }

        let frame = SubscribeFrame {
            frame_type: "subscribe",
            tokens: &tokens,
        };
        write
            .send(Message::Text(
                serde_json::to_string(&frame).expect("subscribe frame"),
            ))
            .await
            .map_err(|e| EngineError::FeedTransport(e.to_string()))?;
        info!("[PUSH] subscribed to {} tokens", tokens.len());

        let mut ping = tokio::time::interval(WS_PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // first tick fires immediately
        let mut last_traffic = Instant::now();
        let mut parse_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| EngineError::FeedTransport(e.to_string()))?;
                }

                _ = tokio::time::sleep_until(last_traffic + WS_IDLE_TIMEOUT) => {
                    return Err(EngineError::FeedTransport(format!(
                        "no traffic for {}s", WS_IDLE_TIMEOUT.as_secs()
                    )));
                }

                _ = self.resubscribe.notified() => {
                    // reconnect to pick up the new token set
                    info!("[PUSH] token set changed, refreshing subscription");
                    return Ok(());
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_traffic = Instant::now();
                        match self.handle_text(&text) {
                            Ok(()) => parse_errors = 0,
                            Err(e) => {
                                parse_errors += 1;
                                SessionStats::bump(&self.stats.frames_dropped);
                                debug!("[PUSH] dropped frame: {}", e);
                                if parse_errors >= WS_MAX_PARSE_ERRORS {
                                    return Err(EngineError::FeedProtocol(format!(
                                        "{parse_errors} consecutive parse errors"
                                    )));
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_traffic = Instant::now();
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_traffic = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(EngineError::FeedTransport(format!("server close: {frame:?}")));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(EngineError::FeedTransport(e.to_string()));
                    }
                    None => {
                        return Err(EngineError::FeedTransport("stream ended".into()));
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> Result<(), EngineError> {
        // the venue batches frames into arrays under load
        if let Ok(frames) = serde_json::from_str::<Vec<WireFrame>>(text) {
            for frame in frames {
                self.handle_frame(frame)?;
            }
            return Ok(());
        }
        let frame: WireFrame =
            serde_json::from_str(text).map_err(|e| EngineError::FeedProtocol(e.to_string()))?;
        self.handle_frame(frame)
    }

    fn handle_frame(&self, frame: WireFrame) -> Result<(), EngineError> {
        match frame {
            WireFrame::Snapshot { token, bids, asks, seq } => {
                if self.registry.market_for_token(&token).is_none() {
                    return Ok(()); // unsubscribed straggler
                }
                let (bid, bid_size) = best_bid(&bids);
                let (ask, ask_size) = best_ask(&asks);
                self.write_book(&token, BookUpdate { bid, ask, bid_size, ask_size, seq });
                Ok(())
            }
            WireFrame::Delta { token, changes, seq } => {
                if self.registry.market_for_token(&token).is_none() {
                    return Ok(());
                }
                let book = self.store.book(&token);
                // deltas are meaningless until the post-(re)connect snapshot
                if book.is_stale_flagged() {
                    return Ok(());
                }
                let current = book.snapshot();
                let mut bid = current.bid;
                let mut bid_size = current.bid_size;
                let mut ask = current.ask;
                let mut ask_size = current.ask_size;

                for change in &changes {
                    let price = parse_price_millis(&change.price)
                        .ok_or_else(|| EngineError::FeedProtocol(format!("bad price {}", change.price)))?;
                    let size = parse_size_hundredths(&change.size);
                    match change.side.to_ascii_uppercase().as_str() {
                        "BUY" | "BID" => {
                            if size > 0 && bid.map_or(true, |b| price >= b) {
                                bid = Some(price);
                                bid_size = size;
                            } else if size == 0 && bid == Some(price) {
                                bid = None;
                                bid_size = 0;
                            }
                        }
                        "SELL" | "ASK" => {
                            if size > 0 && ask.map_or(true, |a| price <= a) {
                                ask = Some(price);
                                ask_size = size;
                            } else if size == 0 && ask == Some(price) {
                                ask = None;
                                ask_size = 0;
                            }
                        }
                        other => {
                            return Err(EngineError::FeedProtocol(format!("bad side {other}")));
                        }
                    }
                }
                self.write_book(&token, BookUpdate { bid, ask, bid_size, ask_size, seq });
                Ok(())
            }
            WireFrame::Trade {} | WireFrame::Heartbeat => Ok(()),
        }
    }

    fn write_book(&self, token: &str, update: BookUpdate) {
        if self.store.apply(token, update) {
            SessionStats::bump(&self.stats.book_updates);
            if let Some(market) = self.registry.market_for_token(token) {
                self.signals.signal(market.market_id.clone());
            }
        } else {
            SessionStats::bump(&self.stats.updates_dropped);
        }
    }
}

#[async_trait]
impl Connector for PushFeed {
    async fn start(self: Arc<Self>) {
        let mut backoff = Backoff::new(WS_BACKOFF_BASE, WS_BACKOFF_CAP);

        while self.running.load(Ordering::Acquire) {
            match self.run_connection(&mut backoff).await {
                // deliberate teardown (token set changed); reconnect promptly
                Ok(()) => {}
                Err(e) => {
                    error!("[PUSH] connection lost: {}", e);
                    self.mark_all_stale();
                    self.disconnected.store(true, Ordering::Release);
                    self.bus.publish(BotEvent::FeedDisconnected { source: "push" });
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    let delay = backoff.next_delay();
                    warn!("[PUSH] reconnecting in {}ms", delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
            }
        }
        info!("[PUSH] stopped");
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.resubscribe.notify_waiters();
    }

    fn mark_all_stale(&self) {
        for token in self.tokens.read().expect("token lock poisoned").iter() {
            self.store.mark_stale(token);
        }
    }

    fn set_tokens(&self, tokens: Vec<Arc<str>>) {
        *self.tokens.write().expect("token lock poisoned") = tokens;
        self.resubscribe.notify_waiters();
    }
}

// =============================================================================
// POLL FEED
// =============================================================================

pub struct PollFeed {
    http: reqwest::Client,
    base_url: String,
    store: Arc<BookStore>,
    registry: Arc<MarketRegistry>,
    signals: Arc<SignalQueue>,
    stats: Arc<SessionStats>,
    interval: Duration,
    tokens: RwLock<Vec<Arc<str>>>,
    running: AtomicBool,
}

impl PollFeed {
    pub fn new(
        base_url: String,
        store: Arc<BookStore>,
        registry: Arc<MarketRegistry>,
        signals: Arc<SignalQueue>,
        stats: Arc<SessionStats>,
        interval: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            store,
            registry,
            signals,
            stats,
            interval,
            tokens: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    async fn fetch_one(&self, token: Arc<str>) {
        let url = format!("{}/book?token_id={}", self.base_url, token);
        let result: Result<WireBook, String> = async {
            let resp = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("status {}", resp.status()));
            }
            resp.json().await.map_err(|e| e.to_string())
        }
        .await;

        match result {
            Ok(book) => {
                let (bid, bid_size) = best_bid(&book.bids);
                let (ask, ask_size) = best_ask(&book.asks);
                let applied = self.store.apply(
                    &token,
                    BookUpdate { bid, ask, bid_size, ask_size, seq: book.seq },
                );
                if applied {
                    SessionStats::bump(&self.stats.book_updates);
                    if let Some(market) = self.registry.market_for_token(&token) {
                        self.signals.signal(market.market_id.clone());
                    }
                } else {
                    SessionStats::bump(&self.stats.updates_dropped);
                }
            }
            Err(e) => {
                debug!("[POLL] fetch failed for {}: {}", token, e);
                self.store.mark_stale(&token);
            }
        }
    }
}

#[async_trait]
impl Connector for PollFeed {
    async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::Acquire) {
            ticker.tick().await;
            let tokens = self.tokens.read().expect("token lock poisoned").clone();
            if tokens.is_empty() {
                continue;
            }
            futures_util::stream::iter(tokens)
                .map(|token| self.fetch_one(token))
                .buffer_unordered(POLL_CONCURRENCY)
                .collect::<Vec<()>>()
                .await;
        }
        info!("[POLL] stopped");
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn mark_all_stale(&self) {
        for token in self.tokens.read().expect("token lock poisoned").iter() {
            self.store.mark_stale(token);
        }
    }

    fn set_tokens(&self, tokens: Vec<Arc<str>>) {
        *self.tokens.write().expect("token lock poisoned") = tokens;
    }
}

// =============================================================================
// USER FILL FEED
// =============================================================================

/// Reads the per-user fill stream and routes events into execution attempts.
pub async fn run_user_feed(url: String, router: Arc<FillRouter>) {
    let mut backoff = Backoff::new(WS_BACKOFF_BASE, WS_BACKOFF_CAP);
    loop {
        match connect_async(&url).await {
            Ok((ws, _)) => {
                backoff.reset();
                info!("[FILLS] connected");
                let (_, mut read) = ws.split();
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            match serde_json::from_str::<WireFill>(&text) {
                                Ok(wire) => {
                                    if let Some(event) = wire.into_event() {
                                        router.dispatch(event);
                                    }
                                }
                                Err(e) => debug!("[FILLS] unparseable fill: {}", e),
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                warn!("[FILLS] stream ended");
            }
            Err(e) => error!("[FILLS] connect failed: {}", e),
        }
        let delay = backoff.next_delay();
        tokio::time::sleep(delay).await;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parsing() {
        let snap: WireFrame = serde_json::from_str(
            r#"{"type":"snapshot","token":"tok-up","bids":[{"price":"0.47","size":"80"},{"price":"0.46","size":"10"}],"asks":[{"price":"0.50","size":"100"},{"price":"0.51","size":"40"}],"seq":7}"#,
        )
        .unwrap();
        match snap {
            WireFrame::Snapshot { token, bids, asks, seq } => {
                assert_eq!(token, "tok-up");
                assert_eq!(seq, 7);
                assert_eq!(best_bid(&bids), (Some(470), 8_000));
                assert_eq!(best_ask(&asks), (Some(500), 10_000));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let hb: WireFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(hb, WireFrame::Heartbeat));

        assert!(serde_json::from_str::<WireFrame>(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn test_best_of_book_skips_empty_levels() {
        let levels = vec![
            WireLevel { price: "0.50".into(), size: "0".into() },
            WireLevel { price: "0.52".into(), size: "30".into() },
        ];
        assert_eq!(best_ask(&levels), (Some(520), 3_000));
        let none: Vec<WireLevel> = Vec::new();
        assert_eq!(best_ask(&none), (None, 0));
    }

    #[test]
    fn test_backoff_growth_cap_and_jitter() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(b.ceiling(), Duration::from_millis(500));
        let d0 = b.next_delay();
        assert!(d0 <= Duration::from_millis(500));
        assert_eq!(b.ceiling(), Duration::from_millis(1000));
        let d1 = b.next_delay();
        assert!(d1 <= Duration::from_millis(1000));

        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.ceiling(), Duration::from_secs(30));

        b.reset();
        assert_eq!(b.ceiling(), Duration::from_millis(500));
    }

    fn registry_with_market() -> Arc<MarketRegistry> {
        let registry = Arc::new(MarketRegistry::new());
        registry
            .add(crate::types::Market {
                market_id: "m1".into(),
                up_token: "tok".into(),
                down_token: "tok2".into(),
                expiry_ts: crate::types::unix_now().unwrap() + 600,
                tick_millis: 10,
                taker_fee_bps: 0,
                maker_fee_bps: 0,
                min_order_size: 0,
            })
            .unwrap();
        registry
    }

    fn test_feed(store: Arc<BookStore>, registry: Arc<MarketRegistry>) -> PushFeed {
        PushFeed::new(
            "wss://unused.example".into(),
            store,
            registry,
            Arc::new(SignalQueue::new()),
            EventBus::new(16),
            Arc::new(SessionStats::new()),
        )
    }

    #[test]
    fn test_delta_updates_top_of_book() {
        let store = Arc::new(BookStore::new());
        let feed = test_feed(store.clone(), registry_with_market());

        feed.handle_text(
            r#"{"type":"snapshot","token":"tok","bids":[{"price":"0.47","size":"80"}],"asks":[{"price":"0.50","size":"100"}],"seq":1}"#,
        )
        .unwrap();

        // better ask arrives
        feed.handle_text(
            r#"{"type":"delta","token":"tok","changes":[{"side":"SELL","price":"0.49","size":"25"}],"seq":2}"#,
        )
        .unwrap();
        let snap = store.get("tok").unwrap().snapshot();
        assert_eq!(snap.ask, Some(490));
        assert_eq!(snap.ask_size, 2_500);

        // best ask pulled
        feed.handle_text(
            r#"{"type":"delta","token":"tok","changes":[{"side":"SELL","price":"0.49","size":"0"}],"seq":3}"#,
        )
        .unwrap();
        let snap = store.get("tok").unwrap().snapshot();
        assert_eq!(snap.ask, None);
        assert_eq!(snap.bid, Some(470));
    }

    #[test]
    fn test_delta_ignored_while_stale() {
        let store = Arc::new(BookStore::new());
        let feed = test_feed(store.clone(), registry_with_market());

        feed.handle_text(
            r#"{"type":"snapshot","token":"tok","bids":[],"asks":[{"price":"0.50","size":"10"}],"seq":5}"#,
        )
        .unwrap();
        store.get("tok").unwrap().mark_stale();

        // pre-snapshot delta after a reconnect must not resurrect the book
        feed.handle_text(
            r#"{"type":"delta","token":"tok","changes":[{"side":"SELL","price":"0.48","size":"10"}],"seq":6}"#,
        )
        .unwrap();
        assert!(store.get("tok").unwrap().is_stale_flagged());

        // the fresh snapshot does
        feed.handle_text(
            r#"{"type":"snapshot","token":"tok","bids":[],"asks":[{"price":"0.48","size":"10"}],"seq":2}"#,
        )
        .unwrap();
        let book = store.get("tok").unwrap();
        assert!(!book.is_stale_flagged());
        assert_eq!(book.snapshot().ask, Some(480));
    }

    #[test]
    fn test_signal_sent_on_accepted_update() {
        let store = Arc::new(BookStore::new());
        let registry = Arc::new(MarketRegistry::new());
        registry
            .add(crate::types::Market {
                market_id: "m1".into(),
                up_token: "tok".into(),
                down_token: "tok2".into(),
                expiry_ts: crate::types::unix_now().unwrap() + 600,
                tick_millis: 10,
                taker_fee_bps: 0,
                maker_fee_bps: 0,
                min_order_size: 0,
            })
            .unwrap();

        let signals = Arc::new(SignalQueue::new());
        let feed = PushFeed::new(
            "wss://unused.example".into(),
            store,
            registry,
            signals.clone(),
            EventBus::new(16),
            Arc::new(SessionStats::new()),
        );

        feed.handle_text(
            r#"{"type":"snapshot","token":"tok","bids":[],"asks":[{"price":"0.50","size":"10"}],"seq":1}"#,
        )
        .unwrap();
        assert_eq!(signals.pending_len(), 1);
    }
}

//! Up/Down Arbitrage Bot
//!
//! Wires discovery, feeds, detection, risk, and execution together and runs
//! until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use updown_arb::book::BookStore;
use updown_arb::config::Config;
use updown_arb::detector::Detector;
use updown_arb::discovery::{run_discovery, DiscoveryClient};
use updown_arb::events::{BotEvent, EventBus};
use updown_arb::execution::ExecutionEngine;
use updown_arb::feed::{run_user_feed, Connector, PollFeed, PushFeed};
use updown_arb::gateway::{FillRouter, OrderGateway, RestGateway, TokenSigner};
use updown_arb::registry::{run_expiry_sweep, MarketRegistry};
use updown_arb::risk::{run_reservation_sweeper, RiskGate};
use updown_arb::sim::{SimConfig, SimGateway};
use updown_arb::stats::SessionStats;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const RESERVATION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("updown_arb=info".parse().unwrap()),
        )
        .init();

    let cfg = Config::from_env();
    cfg.validate().context("invalid configuration")?;

    info!("========================================");
    info!("  Up/Down Arbitrage Bot");
    info!("========================================");
    info!("  Mode: {}", if cfg.dry_run { "DRY RUN" } else { "LIVE" });
    info!("  Assets: {}", cfg.assets.join(", "));
    info!("  Durations: {}", cfg.durations.join(", "));
    info!("  Bankroll: ${:.2}", cfg.bankroll_cents as f64 / 100.0);
    info!(
        "  Min margin: {}m | Max bet: ${:.2} | Bankroll fraction: {:.0}%",
        cfg.min_profit_margin_millis,
        cfg.max_bet_size_cents as f64 / 100.0,
        cfg.max_bankroll_fraction * 100.0
    );
    info!("========================================");

    let bus = EventBus::default();
    let stats = Arc::new(SessionStats::new());
    let store = Arc::new(BookStore::new());
    let registry = Arc::new(MarketRegistry::new());
    let router = Arc::new(FillRouter::new());

    // order gateway: in-memory simulator or signed REST submission
    let gateway: Arc<dyn OrderGateway> = if cfg.dry_run {
        info!("[MAIN] dry-run gateway active, no orders leave the process");
        Arc::new(SimGateway::new(
            SimConfig {
                fill_latency: cfg.sim_fill_latency,
                latency_jitter: Duration::from_millis(20),
            },
            router.clone(),
        ))
    } else {
        let token = std::env::var("VENUE_API_TOKEN")
            .context("VENUE_API_TOKEN required for live trading")?;
        let signer = Arc::new(TokenSigner::new(token));
        tokio::spawn(run_user_feed(cfg.user_ws_url.clone(), router.clone()));
        warn!("[MAIN] LIVE trading enabled, real orders will be submitted");
        Arc::new(RestGateway::new(cfg.rest_url.clone(), signer))
    };

    let risk = Arc::new(RiskGate::new(&cfg, bus.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        gateway,
        router,
        risk.clone(),
        bus.clone(),
        stats.clone(),
        &cfg,
    ));

    let detector = Arc::new(Detector::new(
        registry.clone(),
        store.clone(),
        risk.clone(),
        engine,
        bus.clone(),
        stats.clone(),
        cfg.clone(),
    ));
    for _ in 0..cfg.detector_workers {
        tokio::spawn(detector.clone().run_worker());
    }

    // feed connectors: push preferred, poll as fallback
    let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
    if cfg.ws_enabled {
        connectors.push(Arc::new(PushFeed::new(
            cfg.ws_url.clone(),
            store.clone(),
            registry.clone(),
            detector.signals.clone(),
            bus.clone(),
            stats.clone(),
        )));
    }
    connectors.push(Arc::new(PollFeed::new(
        cfg.rest_url.clone(),
        store.clone(),
        registry.clone(),
        detector.signals.clone(),
        stats.clone(),
        cfg.scan_interval,
    )));
    for connector in &connectors {
        tokio::spawn(connector.clone().start());
    }

    // discovery primes the registry, then keeps it fresh
    let discovery = DiscoveryClient::new(&cfg);
    let added = discovery.scan(&registry).await;
    info!("[MAIN] initial discovery: {} markets", added);
    let tokens = registry.all_tokens();
    for connector in &connectors {
        connector.set_tokens(tokens.clone());
    }
    tokio::spawn(run_discovery(
        discovery,
        registry.clone(),
        connectors.clone(),
        DISCOVERY_INTERVAL,
    ));

    tokio::spawn(run_expiry_sweep(
        registry.clone(),
        store.clone(),
        EXPIRY_SWEEP_INTERVAL,
    ));
    tokio::spawn(run_reservation_sweeper(
        risk.clone(),
        RESERVATION_SWEEP_INTERVAL,
    ));

    // event log subscriber
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event {
                    BotEvent::ExecutionCompleted { .. }
                    | BotEvent::HedgeTriggered { .. }
                    | BotEvent::RiskIncident { .. }
                    | BotEvent::FeedDisconnected { .. }
                    | BotEvent::FeedReconnected { .. } => info!("[EVENT] {:?}", event),
                    _ => debug!("[EVENT] {:?}", event),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[EVENT] logger lagged by {} events", n);
                }
                Err(_) => break,
            }
        }
    });

    // heartbeat
    let hb_registry = registry.clone();
    let hb_risk = risk.clone();
    let hb_stats = stats.clone();
    let hb_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let bankroll = hb_risk.bankroll();
            info!("----------------------------------------");
            info!(
                "[HEARTBEAT] markets {} | books {} | bankroll ${:.2} (${:.2} reserved){}",
                hb_registry.len(),
                hb_store.len(),
                bankroll.total_cents() as f64 / 100.0,
                bankroll.reserved_cents as f64 / 100.0,
                if hb_risk.is_halted() { " | HALTED" } else { "" },
            );
            info!("[HEARTBEAT] {}", hb_stats);
            info!("----------------------------------------");
        }
    });

    info!("[MAIN] running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    info!("[MAIN] shutting down");
    for connector in &connectors {
        connector.stop();
    }
    // give in-flight attempts a moment to settle before the summary
    tokio::time::sleep(Duration::from_millis(250)).await;

    let bankroll = risk.bankroll();
    info!("========================================");
    info!("  SESSION SUMMARY");
    info!("  {}", stats);
    info!(
        "  Final bankroll: ${:.2} (${:.2} still reserved)",
        bankroll.total_cents() as f64 / 100.0,
        bankroll.reserved_cents as f64 / 100.0
    );
    info!("========================================");
    if bankroll.reserved_cents > 0 {
        error!("[MAIN] exiting with reserved bankroll; check open orders");
    }

    Ok(())
}

//! Hybrid maker/taker execution engine.
//!
//! Given an accepted opportunity and its reservation, the engine picks an
//! order type per leg from time-to-resolution, submits both legs
//! concurrently, and then advances a per-attempt state machine on arriving
//! fill events:
//!
//! ```text
//! INIT -> PREPARED -> LEGS_SUBMITTED -> (BOTH_ACKED | ABORT)
//! BOTH_ACKED -> MONITORING -> (COMPLETE | HEDGING) -> COMPLETE
//! ```
//!
//! COMPLETE always releases the reservation. A one-sided position either
//! resolves inside the imbalance window (escalation, hedge, or dump) or the
//! market is quarantined with a risk incident.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{
    Config, HEDGE_TIMEOUT, HYBRID_TTR_SECS, MAKER_ONLY_TTR_SECS, MAX_ESCALATIONS, SUBMIT_TIMEOUT,
};
use crate::error::EngineError;
use crate::events::{BotEvent, EventBus, ExecOutcome};
use crate::gateway::{
    FillEvent, FillRouter, FillStatus, OrderGateway, OrderKind, OrderRequest, OrderSide, Tif,
};
use crate::risk::{Reservation, RiskGate};
use crate::stats::SessionStats;
use crate::types::{
    cost_cents_floor, payout_cents, unix_now, Cents, Market, MarketSide, Opportunity, PriceMillis,
    SizeHundredths,
};

/// Grace period to drain in-flight fill events after cancelling legs
const CANCEL_GRACE: Duration = Duration::from_millis(100);

// =============================================================================
// LEG POLICY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegMode {
    /// Post inside the spread, below the ask by one tick
    Maker,
    /// Cross the spread for an immediate fill
    Taker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegPlan {
    pub up: LegMode,
    pub down: LegMode,
    /// Extra ticks over the observed ask a taker leg may pay
    pub slippage_ticks: u32,
}

/// Pick order types from time-to-resolution. Close to expiry fills matter
/// more than fees; far from it the maker rebate path preserves margin.
pub fn select_plan(
    ttr_secs: i64,
    margin_millis: i64,
    taker_fee_millis: i64,
    size_up: SizeHundredths,
    size_down: SizeHundredths,
) -> LegPlan {
    if ttr_secs > MAKER_ONLY_TTR_SECS {
        return LegPlan {
            up: LegMode::Maker,
            down: LegMode::Maker,
            slippage_ticks: 0,
        };
    }
    if ttr_secs > HYBRID_TTR_SECS {
        // deeper book rests maker; the thin side crosses if the margin can
        // absorb two taker fees
        let cross_ok = margin_millis > 2 * taker_fee_millis;
        let thin_mode = if cross_ok { LegMode::Taker } else { LegMode::Maker };
        let (up, down) = if size_up >= size_down {
            (LegMode::Maker, thin_mode)
        } else {
            (thin_mode, LegMode::Maker)
        };
        return LegPlan { up, down, slippage_ticks: 0 };
    }
    LegPlan {
        up: LegMode::Taker,
        down: LegMode::Taker,
        slippage_ticks: if ttr_secs < crate::config::TAKER_ONLY_TTR_SECS { 1 } else { 0 },
    }
}

fn maker_price(ask: PriceMillis, tick: PriceMillis) -> PriceMillis {
    ask.saturating_sub(tick).max(1)
}

fn taker_price(ask: PriceMillis, tick: PriceMillis, slippage_ticks: u32) -> PriceMillis {
    (ask + tick * slippage_ticks).min(999)
}

/// Idempotency key: identical inputs always produce the identical key, so a
/// retried submission maps to the same venue order
pub fn client_key(
    market_id: &str,
    label: &str,
    seq_up: u64,
    seq_down: u64,
    reservation_id: u64,
) -> Arc<str> {
    format!("{market_id}:{label}:{seq_up}:{seq_down}:{reservation_id}").into()
}

// =============================================================================
// ATTEMPT STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    Prepared,
    LegsSubmitted,
    BothAcked,
    Monitoring,
    Hedging,
    Complete,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegStatus {
    Working,
    Filled,
    Cancelled,
    Rejected,
}

impl LegStatus {
    fn is_dead(self) -> bool {
        matches!(self, LegStatus::Cancelled | LegStatus::Rejected)
    }
}

struct Leg {
    mode: LegMode,
    order_id: Arc<str>,
    status: LegStatus,
}

fn transition(market_id: &str, state: &mut AttemptState, next: AttemptState) {
    debug!("[EXEC] {} {:?} -> {:?}", market_id, *state, next);
    *state = next;
}

/// Running totals for one side of the pair
#[derive(Debug, Default, Clone, Copy)]
struct Pos {
    bought: SizeHundredths,
    sold: SizeHundredths,
    cost_cents: Cents,
    proceeds_cents: Cents,
}

impl Pos {
    fn net(&self) -> SizeHundredths {
        self.bought.saturating_sub(self.sold)
    }
}

/// Everything a live attempt accumulates
struct Attempt {
    up: Pos,
    down: Pos,
    /// order_id -> which side and direction it trades
    orders: FxHashMap<Arc<str>, (MarketSide, OrderSide)>,
    hedged: bool,
}

impl Attempt {
    fn new() -> Self {
        Self {
            up: Pos::default(),
            down: Pos::default(),
            orders: FxHashMap::default(),
            hedged: false,
        }
    }

    fn pos(&self, side: MarketSide) -> &Pos {
        match side {
            MarketSide::Up => &self.up,
            MarketSide::Down => &self.down,
        }
    }

    fn pos_mut(&mut self, side: MarketSide) -> &mut Pos {
        match side {
            MarketSide::Up => &mut self.up,
            MarketSide::Down => &mut self.down,
        }
    }

    fn apply(&mut self, ev: &FillEvent) {
        let Some(&(side, direction)) = self.orders.get(&ev.order_id) else {
            return;
        };
        if ev.filled > 0 {
            let pos = self.pos_mut(side);
            match direction {
                OrderSide::Buy => {
                    pos.bought += ev.filled;
                    pos.cost_cents += cost_cents_floor(ev.filled, ev.price);
                }
                OrderSide::Sell => {
                    pos.sold += ev.filled;
                    pos.proceeds_cents += cost_cents_floor(ev.filled, ev.price);
                }
            }
        }
    }

    fn total_cost(&self) -> Cents {
        self.up.cost_cents + self.down.cost_cents
    }

    fn total_proceeds(&self) -> Cents {
        self.up.proceeds_cents + self.down.proceeds_cents
    }

    fn matched(&self) -> SizeHundredths {
        self.up.net().min(self.down.net())
    }

    fn imbalance(&self) -> SizeHundredths {
        self.up.net().abs_diff(self.down.net())
    }

    /// payout on matched pairs plus recovered proceeds minus everything spent
    fn pnl_cents(&self) -> Cents {
        payout_cents(self.matched()) + self.total_proceeds() - self.total_cost()
    }
}

struct Settlement {
    outcome: ExecOutcome,
    matched: SizeHundredths,
    pnl_cents: Cents,
    incident: Option<String>,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ExecutionEngine {
    gateway: Arc<dyn OrderGateway>,
    router: Arc<FillRouter>,
    risk: Arc<RiskGate>,
    bus: EventBus,
    stats: Arc<SessionStats>,
    max_imbalance: Duration,
    max_slippage_ticks: u32,
    /// Attempt deadline, kept safely inside the reservation TTL
    attempt_ttl: Duration,
}

impl ExecutionEngine {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        router: Arc<FillRouter>,
        risk: Arc<RiskGate>,
        bus: EventBus,
        stats: Arc<SessionStats>,
        cfg: &Config,
    ) -> Self {
        let ttl = cfg.reservation_ttl;
        let attempt_ttl = ttl.saturating_sub(Duration::from_millis(500)).max(ttl / 2);
        Self {
            gateway,
            router,
            risk,
            bus,
            stats,
            max_imbalance: cfg.max_imbalance,
            max_slippage_ticks: cfg.max_slippage_ticks,
            attempt_ttl,
        }
    }

    /// Run one execution attempt to completion. Always releases the
    /// reservation and always emits `ExecutionCompleted`.
    pub async fn execute(&self, market: Arc<Market>, opp: Opportunity, reservation: Reservation) {
        let market_id = market.market_id.clone();
        let settlement = self.run_attempt(&market, &opp, &reservation).await;

        self.risk.release(reservation.id, settlement.pnl_cents);

        match settlement.outcome {
            ExecOutcome::BothFilled => {
                SessionStats::bump(&self.stats.completed);
                self.risk.record_execution_success();
            }
            ExecOutcome::Hedged => {
                SessionStats::bump(&self.stats.completed);
                if settlement.incident.is_some() {
                    self.risk.record_execution_failure();
                }
            }
            ExecOutcome::Abandoned => {}
            ExecOutcome::Aborted => {
                SessionStats::bump(&self.stats.failed);
                self.risk.record_execution_failure();
            }
        }
        self.stats.add_pnl(settlement.pnl_cents);

        if let Some(detail) = &settlement.incident {
            self.risk.quarantine(market_id.clone(), detail);
        }

        info!(
            "[EXEC] {} complete: {:?} matched={} pnl={:+.2}",
            market_id,
            settlement.outcome,
            settlement.matched,
            settlement.pnl_cents as f64 / 100.0
        );
        self.bus.publish(BotEvent::ExecutionCompleted {
            market_id,
            outcome: settlement.outcome,
            matched: settlement.matched,
            pnl_cents: settlement.pnl_cents,
        });
    }

    async fn run_attempt(
        &self,
        market: &Arc<Market>,
        opp: &Opportunity,
        reservation: &Reservation,
    ) -> Settlement {
        let market_id = market.market_id.as_ref();
        let mut state = AttemptState::Init;
        let combined = opp.combined_ask();

        // PREPARED: plan legs and sizes
        let Ok(now_unix) = unix_now() else {
            return Settlement {
                outcome: ExecOutcome::Aborted,
                matched: 0,
                pnl_cents: 0,
                incident: None,
            };
        };
        let ttr = market.ttr_secs(now_unix);
        let taker_fee_millis = crate::config::fee_reserve_millis(combined, market.taker_fee_bps);
        let plan = select_plan(ttr, opp.margin_millis, taker_fee_millis, opp.size_up, opp.size_down);

        let affordable = (reservation.notional_cents as u64).saturating_mul(1000) / combined as u64;
        let pairs = opp.size().min(affordable);
        if pairs == 0 {
            return Settlement {
                outcome: ExecOutcome::Abandoned,
                matched: 0,
                pnl_cents: 0,
                incident: None,
            };
        }
        transition(market_id, &mut state, AttemptState::Prepared);
        debug!(
            "[EXEC] {} prepared: ttr={}s plan={:?} pairs={}",
            market_id, ttr, plan, pairs
        );

        let up_req = self.leg_request(market, opp, reservation, MarketSide::Up, plan.up, plan, pairs);
        let down_req =
            self.leg_request(market, opp, reservation, MarketSide::Down, plan.down, plan, pairs);

        // LEGS_SUBMITTED: both legs in parallel, minimal dispatch gap
        transition(market_id, &mut state, AttemptState::LegsSubmitted);
        for (side, req) in [(MarketSide::Up, &up_req), (MarketSide::Down, &down_req)] {
            SessionStats::bump(&self.stats.submissions);
            self.bus.publish(BotEvent::OrderSubmitted {
                market_id: market.market_id.clone(),
                side,
                client_id: req.client_id.clone(),
                price: req.price,
                size: req.size,
            });
        }

        let (up_ack, down_ack) = tokio::join!(
            self.place_with_timeout(&up_req),
            self.place_with_timeout(&down_req),
        );

        let (up_ack, down_ack) = match (up_ack, down_ack) {
            (Ok(u), Ok(d)) => (u, d),
            (u, d) => {
                // ABORT: cancel whichever leg made it to the venue
                warn!("[EXEC] {} ack failure, cancelling both legs", market_id);
                for ack in [u.ok(), d.ok()].into_iter().flatten() {
                    let _ = self.gateway.cancel_order(&ack.order_id).await;
                }
                transition(market_id, &mut state, AttemptState::Abort);
                return Settlement {
                    outcome: ExecOutcome::Aborted,
                    matched: 0,
                    pnl_cents: 0,
                    incident: None,
                };
            }
        };
        transition(market_id, &mut state, AttemptState::BothAcked);
        self.bus.publish(BotEvent::OrderAcked {
            client_id: up_req.client_id.clone(),
            order_id: up_ack.order_id.clone(),
        });
        self.bus.publish(BotEvent::OrderAcked {
            client_id: down_req.client_id.clone(),
            order_id: down_ack.order_id.clone(),
        });

        // fills for every order of this attempt funnel into one channel
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.router.register(up_ack.order_id.clone(), tx.clone());
        self.router.register(down_ack.order_id.clone(), tx.clone());

        let mut attempt = Attempt::new();
        attempt
            .orders
            .insert(up_ack.order_id.clone(), (MarketSide::Up, OrderSide::Buy));
        attempt
            .orders
            .insert(down_ack.order_id.clone(), (MarketSide::Down, OrderSide::Buy));

        let mut up_leg = Leg {
            mode: plan.up,
            order_id: up_ack.order_id,
            status: LegStatus::Working,
        };
        let mut down_leg = Leg {
            mode: plan.down,
            order_id: down_ack.order_id,
            status: LegStatus::Working,
        };

        // MONITORING
        transition(market_id, &mut state, AttemptState::Monitoring);
        let attempt_deadline = Instant::now() + self.attempt_ttl;
        let mut imbalance_deadline: Option<Instant> = None;

        loop {
            let wake = imbalance_deadline
                .map_or(attempt_deadline, |d| d.min(attempt_deadline));
            tokio::select! {
                ev = rx.recv() => {
                    let Some(ev) = ev else { break };
                    self.note_fill(&ev);
                    attempt.apply(&ev);
                    for leg in [&mut up_leg, &mut down_leg] {
                        if leg.order_id == ev.order_id {
                            leg.status = match ev.status {
                                FillStatus::Filled => LegStatus::Filled,
                                FillStatus::Cancelled => LegStatus::Cancelled,
                                FillStatus::Rejected => LegStatus::Rejected,
                                FillStatus::Partial => LegStatus::Working,
                            };
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake) => break,
            }

            if up_leg.status == LegStatus::Filled && down_leg.status == LegStatus::Filled {
                transition(market_id, &mut state, AttemptState::Complete);
                for order_id in attempt.orders.keys() {
                    self.router.unregister(order_id);
                }
                return Settlement {
                    outcome: ExecOutcome::BothFilled,
                    matched: attempt.matched(),
                    pnl_cents: attempt.pnl_cents(),
                    incident: None,
                };
            }
            let one_filled = (up_leg.status == LegStatus::Filled) ^ (down_leg.status == LegStatus::Filled);
            if one_filled && (up_leg.status.is_dead() || down_leg.status.is_dead()) {
                break; // one filled, one cancelled/rejected: hedge immediately
            }
            if up_leg.status.is_dead() && down_leg.status.is_dead() {
                break;
            }
            if one_filled && imbalance_deadline.is_none() {
                imbalance_deadline = Some(Instant::now() + self.max_imbalance);
            }
        }

        // HEDGING / resolution
        transition(market_id, &mut state, AttemptState::Hedging);
        let settlement = self
            .resolve(market, opp, reservation, &mut attempt, [&mut up_leg, &mut down_leg], &mut rx, &tx)
            .await;
        transition(market_id, &mut state, AttemptState::Complete);

        for order_id in attempt.orders.keys() {
            self.router.unregister(order_id);
        }
        settlement
    }

    fn leg_request(
        &self,
        market: &Market,
        opp: &Opportunity,
        reservation: &Reservation,
        side: MarketSide,
        mode: LegMode,
        plan: LegPlan,
        pairs: SizeHundredths,
    ) -> OrderRequest {
        let ask = match side {
            MarketSide::Up => opp.ask_up,
            MarketSide::Down => opp.ask_down,
        };
        let (price, kind, tif) = match mode {
            LegMode::Maker => (maker_price(ask, market.tick_millis), OrderKind::Limit, Tif::Gtc),
            LegMode::Taker => (
                taker_price(ask, market.tick_millis, plan.slippage_ticks),
                OrderKind::Limit,
                Tif::Ioc,
            ),
        };
        OrderRequest {
            token: market.token(side).clone(),
            side: OrderSide::Buy,
            price,
            size: pairs,
            kind,
            tif,
            client_id: client_key(
                &market.market_id,
                side.as_str(),
                opp.seq_up,
                opp.seq_down,
                reservation.id,
            ),
        }
    }

    async fn place_with_timeout(&self, req: &OrderRequest) -> Result<crate::gateway::OrderAck, EngineError> {
        match timeout(SUBMIT_TIMEOUT, self.gateway.place_order(req)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::SubmitTimeout(SUBMIT_TIMEOUT)),
        }
    }

    fn note_fill(&self, ev: &FillEvent) {
        if ev.filled > 0 {
            SessionStats::bump(&self.stats.fills);
            self.bus.publish(BotEvent::OrderFilled {
                order_id: ev.order_id.clone(),
                size: ev.filled,
                price: ev.price,
            });
        }
        if ev.status == FillStatus::Cancelled {
            self.bus.publish(BotEvent::OrderCancelled {
                order_id: ev.order_id.clone(),
            });
        }
    }

    /// Flatten whatever the monitoring phase left behind: cancel working
    /// legs, escalate a lagging maker, hedge the deficit, and as a last
    /// resort dump the long side.
    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        market: &Arc<Market>,
        opp: &Opportunity,
        reservation: &Reservation,
        attempt: &mut Attempt,
        legs: [&mut Leg; 2],
        rx: &mut mpsc::UnboundedReceiver<FillEvent>,
        tx: &mpsc::UnboundedSender<FillEvent>,
    ) -> Settlement {
        let [up_leg, down_leg] = legs;

        // cancel anything still working, then drain stragglers briefly
        for leg in [&*up_leg, &*down_leg] {
            if leg.status == LegStatus::Working {
                let _ = self.gateway.cancel_order(&leg.order_id).await;
            }
        }
        self.drain(attempt, rx, CANCEL_GRACE).await;

        if attempt.imbalance() == 0 {
            let matched = attempt.matched();
            let outcome = if matched > 0 {
                ExecOutcome::BothFilled
            } else {
                ExecOutcome::Abandoned
            };
            return Settlement {
                outcome,
                matched,
                pnl_cents: attempt.pnl_cents(),
                incident: None,
            };
        }

        // the lagging side needs more shares
        let (lag_side, lag_leg) = if attempt.up.net() < attempt.down.net() {
            (MarketSide::Up, up_leg)
        } else {
            (MarketSide::Down, down_leg)
        };
        let lag_ask = match lag_side {
            MarketSide::Up => opp.ask_up,
            MarketSide::Down => opp.ask_down,
        };
        let tick = market.tick_millis;

        // a lagging maker gets converted to taker, at most twice
        if lag_leg.mode == LegMode::Maker && !lag_leg.status.is_dead() {
            for escalation in 1..=MAX_ESCALATIONS {
                let deficit = attempt.imbalance();
                if deficit == 0 {
                    break;
                }
                let slip = escalation.min(self.max_slippage_ticks);
                let price = taker_price(lag_ask, tick, slip);
                debug!(
                    "[EXEC] {} escalation {} on {} leg: {} @ {}m",
                    market.market_id, escalation, lag_side, deficit, price
                );
                let label = format!("{}-e{}", lag_side.as_str(), escalation);
                self.order_and_wait(
                    market,
                    opp,
                    reservation,
                    attempt,
                    lag_side,
                    OrderSide::Buy,
                    price,
                    deficit,
                    Tif::Ioc,
                    &label,
                    self.max_imbalance,
                    rx,
                    tx,
                )
                .await;
            }
        }

        // hedge: marketable buy on the unfilled side within the slippage budget
        let deficit = attempt.imbalance();
        if deficit > 0 {
            attempt.hedged = true;
            SessionStats::bump(&self.stats.hedges);
            self.bus.publish(BotEvent::HedgeTriggered {
                market_id: market.market_id.clone(),
                side: lag_side,
                size: deficit,
            });
            let price = taker_price(lag_ask, tick, self.max_slippage_ticks);
            self.order_and_wait(
                market,
                opp,
                reservation,
                attempt,
                lag_side,
                OrderSide::Buy,
                price,
                deficit,
                Tif::Ioc,
                &format!("{}-h", lag_side.as_str()),
                HEDGE_TIMEOUT,
                rx,
                tx,
            )
            .await;
        }

        // no liquidity on the lagging side: dump the long side at whatever
        // the book pays and book the loss
        let excess = attempt.imbalance();
        if excess > 0 {
            attempt.hedged = true;
            let long_side = lag_side.other();
            let long_pos = attempt.pos(long_side);
            let avg_price = if long_pos.bought > 0 {
                ((long_pos.cost_cents as u128 * 1000) / long_pos.bought as u128) as PriceMillis
            } else {
                lag_ask
            };
            let dump_price = avg_price
                .saturating_sub(tick * self.max_slippage_ticks)
                .max(1);
            SessionStats::bump(&self.stats.hedges);
            self.bus.publish(BotEvent::HedgeTriggered {
                market_id: market.market_id.clone(),
                side: long_side,
                size: excess,
            });
            warn!(
                "[EXEC] {} dumping {} excess {} shares at {}m",
                market.market_id, excess, long_side, dump_price
            );
            self.order_and_wait(
                market,
                opp,
                reservation,
                attempt,
                long_side,
                OrderSide::Sell,
                dump_price,
                excess,
                Tif::Ioc,
                &format!("{}-d", long_side.as_str()),
                HEDGE_TIMEOUT,
                rx,
                tx,
            )
            .await;
        }

        let matched = attempt.matched();
        let pnl = attempt.pnl_cents();
        if attempt.imbalance() > 0 {
            let detail = format!(
                "unresolved partial fill: up={} down={} after hedge escalation",
                attempt.up.net(),
                attempt.down.net()
            );
            let err = EngineError::PartialFillUnresolved {
                market_id: market.market_id.to_string(),
                detail: detail.clone(),
            };
            tracing::error!("[EXEC] {}", err);
            return Settlement {
                outcome: ExecOutcome::Hedged,
                matched,
                pnl_cents: pnl,
                incident: Some(detail),
            };
        }

        let outcome = if attempt.hedged {
            ExecOutcome::Hedged
        } else if matched > 0 {
            ExecOutcome::BothFilled
        } else {
            ExecOutcome::Abandoned
        };
        Settlement {
            outcome,
            matched,
            pnl_cents: pnl,
            incident: None,
        }
    }

    /// Submit one follow-up order, route its fills into the attempt, and wait
    /// out `wait` (cancelling the remainder) before returning.
    #[allow(clippy::too_many_arguments)]
    async fn order_and_wait(
        &self,
        market: &Arc<Market>,
        opp: &Opportunity,
        reservation: &Reservation,
        attempt: &mut Attempt,
        side: MarketSide,
        direction: OrderSide,
        price: PriceMillis,
        size: SizeHundredths,
        tif: Tif,
        label: &str,
        wait: Duration,
        rx: &mut mpsc::UnboundedReceiver<FillEvent>,
        tx: &mpsc::UnboundedSender<FillEvent>,
    ) {
        let req = OrderRequest {
            token: market.token(side).clone(),
            side: direction,
            price,
            size,
            kind: OrderKind::Limit,
            tif,
            client_id: client_key(&market.market_id, label, opp.seq_up, opp.seq_down, reservation.id),
        };
        SessionStats::bump(&self.stats.submissions);
        self.bus.publish(BotEvent::OrderSubmitted {
            market_id: market.market_id.clone(),
            side,
            client_id: req.client_id.clone(),
            price,
            size,
        });

        let ack = match self.place_with_timeout(&req).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("[EXEC] {} {} order failed: {}", market.market_id, label, e);
                return;
            }
        };
        self.bus.publish(BotEvent::OrderAcked {
            client_id: req.client_id.clone(),
            order_id: ack.order_id.clone(),
        });
        self.router.register(ack.order_id.clone(), tx.clone());
        attempt.orders.insert(ack.order_id.clone(), (side, direction));

        let before = attempt.imbalance();
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(ev)) => {
                    self.note_fill(&ev);
                    attempt.apply(&ev);
                    let terminal = matches!(
                        ev.status,
                        FillStatus::Filled | FillStatus::Cancelled | FillStatus::Rejected
                    );
                    if attempt.imbalance() == 0 || (ev.order_id == ack.order_id && terminal) {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        if attempt.imbalance() > 0 && attempt.imbalance() == before {
            debug!("[EXEC] {} {} made no progress", market.market_id, label);
        }
        let _ = self.gateway.cancel_order(&ack.order_id).await;
        // eat the cancellation confirmation if one comes
        self.drain(attempt, rx, Duration::from_millis(20)).await;
    }

    /// Apply any events arriving within `window`
    async fn drain(
        &self,
        attempt: &mut Attempt,
        rx: &mut mpsc::UnboundedReceiver<FillEvent>,
        window: Duration,
    ) {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(ev)) => {
                    self.note_fill(&ev);
                    attempt.apply(&ev);
                }
                Ok(None) | Err(_) => return,
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FillPlan, SimConfig, SimGateway};
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_select_plan_bands() {
        // far out: maker both
        let plan = select_plan(300, 100, 14, 10_000, 10_000);
        assert_eq!((plan.up, plan.down), (LegMode::Maker, LegMode::Maker));
        assert_eq!(plan.slippage_ticks, 0);

        // hybrid, margin absorbs fees: deeper side (down) maker, thin taker
        let plan = select_plan(90, 100, 14, 5_000, 10_000);
        assert_eq!((plan.up, plan.down), (LegMode::Taker, LegMode::Maker));

        // hybrid, thin margin: maker both
        let plan = select_plan(90, 20, 14, 5_000, 10_000);
        assert_eq!((plan.up, plan.down), (LegMode::Maker, LegMode::Maker));

        // 30-60s: taker both, no extra slippage
        let plan = select_plan(45, 100, 14, 10_000, 10_000);
        assert_eq!((plan.up, plan.down), (LegMode::Taker, LegMode::Taker));
        assert_eq!(plan.slippage_ticks, 0);

        // under 30s: taker both with one tick of slack
        let plan = select_plan(10, 100, 14, 10_000, 10_000);
        assert_eq!((plan.up, plan.down), (LegMode::Taker, LegMode::Taker));
        assert_eq!(plan.slippage_ticks, 1);
    }

    #[test]
    fn test_leg_prices() {
        assert_eq!(maker_price(400, 10), 390);
        assert_eq!(maker_price(5, 10), 1);
        assert_eq!(taker_price(400, 10, 0), 400);
        assert_eq!(taker_price(400, 10, 1), 410);
        assert_eq!(taker_price(995, 10, 1), 999);
    }

    #[test]
    fn test_client_key_deterministic() {
        let a = client_key("m1", "up", 3, 4, 7);
        let b = client_key("m1", "up", 3, 4, 7);
        assert_eq!(a, b);
        assert_ne!(a, client_key("m1", "down", 3, 4, 7));
        assert_ne!(a, client_key("m1", "up", 3, 4, 8));
    }

    // --- end-to-end harness ------------------------------------------------

    struct Harness {
        engine: Arc<ExecutionEngine>,
        gateway: Arc<SimGateway>,
        risk: Arc<RiskGate>,
        bus: EventBus,
        market: Arc<Market>,
        stats: Arc<SessionStats>,
    }

    fn harness(ttr_secs: i64) -> Harness {
        let mut cfg = Config::default();
        cfg.bankroll_cents = 100_000;
        cfg.max_bet_size_cents = 20_000;
        cfg.max_bankroll_fraction = 0.5;
        cfg.max_imbalance = Duration::from_millis(60);
        cfg.reservation_ttl = Duration::from_secs(2);

        let bus = EventBus::new(256);
        let stats = Arc::new(SessionStats::new());
        let risk = Arc::new(RiskGate::new(&cfg, bus.clone()));
        let router = Arc::new(FillRouter::new());
        let gateway = Arc::new(SimGateway::new(
            SimConfig {
                fill_latency: Duration::from_millis(10),
                latency_jitter: Duration::ZERO,
            },
            router.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            gateway.clone(),
            router,
            risk.clone(),
            bus.clone(),
            stats.clone(),
            &cfg,
        ));
        let market = Arc::new(Market {
            market_id: "m1".into(),
            up_token: "m1-up".into(),
            down_token: "m1-down".into(),
            expiry_ts: unix_now().unwrap() + ttr_secs,
            tick_millis: 10,
            taker_fee_bps: 0,
            maker_fee_bps: 0,
            min_order_size: 0,
        });
        Harness {
            engine,
            gateway,
            risk,
            bus,
            market,
            stats,
        }
    }

    fn opportunity() -> Opportunity {
        Opportunity {
            market_id: "m1".into(),
            ask_up: 400,
            ask_down: 500,
            size_up: 10_000,
            size_down: 10_000,
            margin_millis: 100,
            detected_ns: crate::types::monotonic_now_ns(),
            seq_up: 1,
            seq_down: 1,
        }
    }

    async fn completed_event(rx: &mut tokio::sync::broadcast::Receiver<BotEvent>) -> BotEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Ok(ev @ BotEvent::ExecutionCompleted { .. })) => return ev,
                Ok(Ok(_)) => continue,
                other => panic!("no completion event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_clean_arbitrage_both_filled() {
        let h = harness(45); // taker both
        let mut rx = h.bus.subscribe();
        let opp = opportunity();
        let res = h.risk.try_reserve(&opp).unwrap();
        assert_eq!(res.notional_cents, 9_000);

        h.engine.execute(h.market.clone(), opp, res).await;

        match completed_event(&mut rx).await {
            BotEvent::ExecutionCompleted {
                outcome,
                matched,
                pnl_cents,
                ..
            } => {
                assert_eq!(outcome, ExecOutcome::BothFilled);
                assert_eq!(matched, 10_000);
                // 100 pairs: cost $90, payout $100
                assert_eq!(pnl_cents, 1_000);
            }
            other => panic!("unexpected {other:?}"),
        }

        let bankroll = h.risk.bankroll();
        assert_eq!(bankroll.reserved_cents, 0);
        assert_eq!(bankroll.total_cents(), 101_000);
        assert!(!h.risk.has_reservation("m1"));
    }

    #[tokio::test]
    async fn test_maker_fill_far_from_expiry() {
        // maker both: fills land at ask - 1 tick, so pnl improves
        let h = harness(600);
        let mut rx = h.bus.subscribe();
        let opp = opportunity();
        let res = h.risk.try_reserve(&opp).unwrap();

        h.engine.execute(h.market.clone(), opp, res).await;

        match completed_event(&mut rx).await {
            BotEvent::ExecutionCompleted { outcome, pnl_cents, .. } => {
                assert_eq!(outcome, ExecOutcome::BothFilled);
                // 100 pairs at (0.39 + 0.49) = $88 cost, $100 payout
                assert_eq!(pnl_cents, 1_200);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_fill_escalates_then_dumps() {
        // up fills; down never does (maker leg sits, escalations sit, hedge
        // sits). The engine must sell the up shares back and finish net zero.
        let h = harness(600); // maker both so escalation path is exercised
        h.gateway.set_plan("m1-down".into(), FillPlan::Sit);
        let mut rx = h.bus.subscribe();
        let opp = opportunity();
        let res = h.risk.try_reserve(&opp).unwrap();

        h.engine.execute(h.market.clone(), opp, res).await;

        match completed_event(&mut rx).await {
            BotEvent::ExecutionCompleted {
                outcome,
                matched,
                pnl_cents,
                ..
            } => {
                assert_eq!(outcome, ExecOutcome::Hedged);
                assert_eq!(matched, 0);
                // bought up at 0.39, dumped at 0.39 - 5 ticks = 0.34
                assert!(pnl_cents < 0, "dump books a loss, got {pnl_cents}");
            }
            other => panic!("unexpected {other:?}"),
        }

        // position is flat, so no incident may have been raised
        loop {
            match rx.try_recv() {
                Ok(BotEvent::RiskIncident { .. }) => panic!("flat position must not raise incident"),
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        assert!(h.stats.hedges.load(std::sync::atomic::Ordering::Relaxed) >= 1);
        assert!(!h.risk.is_quarantined("m1"));
        assert_eq!(h.risk.bankroll().reserved_cents, 0);
    }

    #[tokio::test]
    async fn test_one_leg_rejected_at_submit_aborts_both() {
        // down leg rejected before ack: the other leg is cancelled too
        let h = harness(45);
        h.gateway.set_plan("m1-down".into(), FillPlan::Reject);
        let mut rx = h.bus.subscribe();
        let opp = opportunity();
        let res = h.risk.try_reserve(&opp).unwrap();

        h.engine.execute(h.market.clone(), opp, res).await;

        match completed_event(&mut rx).await {
            BotEvent::ExecutionCompleted { outcome, matched, .. } => {
                assert_eq!(outcome, ExecOutcome::Aborted);
                assert_eq!(matched, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        // clean abort releases the full reservation
        assert_eq!(h.risk.bankroll().total_cents(), 100_000);
        assert_eq!(h.risk.bankroll().reserved_cents, 0);
    }

    #[tokio::test]
    async fn test_down_cancelled_after_ack_hedges() {
        // down acks then reports cancelled; up fills. The hedge buy on the
        // down side completes the pair.
        let h = harness(45);
        h.gateway.set_plan("m1-down".into(), FillPlan::Sit);
        let mut rx = h.bus.subscribe();
        let opp = opportunity();
        let res = h.risk.try_reserve(&opp).unwrap();

        let gw = h.gateway.clone();
        let engine = h.engine.clone();
        let market = h.market.clone();
        let exec = tokio::spawn(async move { engine.execute(market, opp, res).await });

        // wait for the down order to rest, then cancel it out from under the
        // engine so the leg reports Cancelled
        tokio::time::sleep(Duration::from_millis(30)).await;
        gw.set_plan("m1-down".into(), FillPlan::Fill); // hedge buys will fill
        let down_order = gw
            .open_orders()
            .into_iter()
            .find(|(_, token)| token.as_ref() == "m1-down")
            .expect("down leg should be resting")
            .0;
        gw.cancel_order(&down_order).await.unwrap();

        exec.await.unwrap();

        match completed_event(&mut rx).await {
            BotEvent::ExecutionCompleted {
                outcome, matched, ..
            } => {
                assert_eq!(outcome, ExecOutcome::Hedged);
                assert_eq!(matched, 10_000, "hedge must complete the pair");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!h.risk.is_quarantined("m1"));
    }

    #[tokio::test]
    async fn test_nothing_fills_released_clean() {
        let h = harness(600);
        h.gateway.set_plan("m1-up".into(), FillPlan::Sit);
        h.gateway.set_plan("m1-down".into(), FillPlan::Sit);
        let mut rx = h.bus.subscribe();
        let opp = opportunity();
        let res = h.risk.try_reserve(&opp).unwrap();

        let started = std::time::Instant::now();
        h.engine.execute(h.market.clone(), opp, res).await;

        match completed_event(&mut rx).await {
            BotEvent::ExecutionCompleted { outcome, pnl_cents, .. } => {
                assert_eq!(outcome, ExecOutcome::Abandoned);
                assert_eq!(pnl_cents, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        // released well within reservation_ttl + 1s
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(h.risk.bankroll().total_cents(), 100_000);
        assert_eq!(h.risk.bankroll().reserved_cents, 0);
        assert!(!h.risk.has_reservation("m1"));
    }
}

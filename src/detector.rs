//! Opportunity detection.
//!
//! A worker pool drains the coalescing signal queue. Each evaluation reads
//! both token books of one market, requires freshness, and computes the
//! arbitrage margin in integer millis. The detector mutates nothing; accepted
//! opportunities flow to the risk gate and from there into execution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

use crate::book::BookStore;
use crate::config::{fee_reserve_millis, Config, MAKER_ONLY_TTR_SECS};
use crate::error::RejectReason;
use crate::events::{BotEvent, EventBus};
use crate::execution::ExecutionEngine;
use crate::registry::MarketRegistry;
use crate::risk::RiskGate;
use crate::stats::SessionStats;
use crate::types::{monotonic_now_ns, unix_now, Opportunity, UNIT_MILLIS};

// =============================================================================
// SIGNAL QUEUE
// =============================================================================

struct QueueState {
    queue: VecDeque<Arc<str>>,
    queued: FxHashSet<Arc<str>>,
    /// market -> re-signalled while its evaluation was in progress
    evaluating: FxHashMap<Arc<str>, bool>,
}

/// Coalescing market-signal queue: a market is never queued twice, and a
/// signal arriving mid-evaluation re-queues the market when the evaluation
/// finishes. Latest-wins by construction, since evaluations read live books.
pub struct SignalQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: FxHashSet::default(),
                evaluating: FxHashMap::default(),
            }),
            notify: Notify::new(),
        }
    }

    /// Non-blocking; called from the feed hot path
    pub fn signal(&self, market_id: Arc<str>) {
        let mut state = self.state.lock().expect("signal lock poisoned");
        if let Some(dirty) = state.evaluating.get_mut(&market_id) {
            *dirty = true;
            return;
        }
        if state.queued.insert(market_id.clone()) {
            state.queue.push_back(market_id);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Next market to evaluate; marks it in-progress
    pub async fn next(&self) -> Arc<str> {
        loop {
            {
                let mut state = self.state.lock().expect("signal lock poisoned");
                if let Some(market_id) = state.queue.pop_front() {
                    state.queued.remove(&market_id);
                    state.evaluating.insert(market_id.clone(), false);
                    return market_id;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Finish an evaluation; re-queues the market if it was re-signalled
    pub fn done(&self, market_id: &Arc<str>) {
        let mut state = self.state.lock().expect("signal lock poisoned");
        let dirty = state.evaluating.remove(market_id).unwrap_or(false);
        if dirty && state.queued.insert(market_id.clone()) {
            state.queue.push_back(market_id.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("signal lock poisoned").queue.len()
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DETECTOR
// =============================================================================

/// Outcome of one evaluation, for tests and event emission
#[derive(Debug, PartialEq)]
pub enum Evaluation {
    /// No books yet, market gone, or no priced ask; nothing to say
    Silent,
    Rejected(RejectReason),
    Opportunity(Opportunity),
}

pub struct Detector {
    registry: Arc<MarketRegistry>,
    store: Arc<BookStore>,
    risk: Arc<RiskGate>,
    engine: Arc<ExecutionEngine>,
    bus: EventBus,
    stats: Arc<SessionStats>,
    pub signals: Arc<SignalQueue>,
    /// Saturation guard for execution spawns
    submissions: Arc<Semaphore>,
    cfg: Config,
}

impl Detector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<MarketRegistry>,
        store: Arc<BookStore>,
        risk: Arc<RiskGate>,
        engine: Arc<ExecutionEngine>,
        bus: EventBus,
        stats: Arc<SessionStats>,
        cfg: Config,
    ) -> Self {
        let submissions = Arc::new(Semaphore::new(cfg.max_submissions));
        Self {
            registry,
            store,
            risk,
            engine,
            bus,
            stats,
            signals: Arc::new(SignalQueue::new()),
            submissions,
            cfg,
        }
    }

    /// Worker loop; run `cfg.detector_workers` of these
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let market_id = self.signals.next().await;
            self.process(&market_id).await;
            self.signals.done(&market_id);
        }
    }

    async fn process(&self, market_id: &Arc<str>) {
        SessionStats::bump(&self.stats.evaluations);
        match self.evaluate(market_id) {
            Evaluation::Silent => {}
            Evaluation::Rejected(reason) => {
                SessionStats::bump(&self.stats.rejections);
                self.bus.publish(BotEvent::OpportunityRejected {
                    market_id: market_id.clone(),
                    reason,
                });
            }
            Evaluation::Opportunity(opp) => {
                SessionStats::bump(&self.stats.opportunities);
                self.bus.publish(BotEvent::OpportunityDetected {
                    market_id: opp.market_id.clone(),
                    ask_up: opp.ask_up,
                    ask_down: opp.ask_down,
                    margin_millis: opp.margin_millis,
                    size: opp.size(),
                });
                self.dispatch(opp).await;
            }
        }
    }

    /// Pure on a pair of book snapshots; no state mutation
    pub fn evaluate(&self, market_id: &Arc<str>) -> Evaluation {
        let Some(market) = self.registry.get(market_id) else {
            return Evaluation::Silent;
        };

        // an in-flight or quarantined market suppresses emission entirely
        if self.risk.has_reservation(market_id) || self.risk.is_quarantined(market_id) {
            return Evaluation::Silent;
        }

        let (Some(up_book), Some(down_book)) = (
            self.store.get(&market.up_token),
            self.store.get(&market.down_token),
        ) else {
            return Evaluation::Silent;
        };

        let now_ns = monotonic_now_ns();
        if !up_book.is_fresh(now_ns, self.cfg.freshness_ttl)
            || !down_book.is_fresh(now_ns, self.cfg.freshness_ttl)
        {
            return Evaluation::Rejected(RejectReason::BookStale);
        }

        let up = up_book.snapshot();
        let down = down_book.snapshot();
        let (Some(ask_up), Some(ask_down)) = (up.ask, down.ask) else {
            return Evaluation::Silent;
        };

        let Ok(now_unix) = unix_now() else {
            return Evaluation::Silent;
        };
        let ttr = market.ttr_secs(now_unix);
        if ttr <= 0 {
            return Evaluation::Silent;
        }

        // beyond the maker-only horizon both legs post maker and pay no
        // taker fee; inside it at least one leg may cross the spread
        let combined = ask_up + ask_down;
        let fee_reserve = if ttr <= MAKER_ONLY_TTR_SECS {
            fee_reserve_millis(combined, market.taker_fee_bps)
        } else {
            0
        };
        let margin = UNIT_MILLIS as i64 - combined as i64 - fee_reserve;

        let size = up.ask_size.min(down.ask_size);
        let min_size = self.cfg.min_size.max(market.min_order_size);
        if size < min_size {
            return if margin >= self.cfg.min_profit_margin_millis {
                Evaluation::Rejected(RejectReason::BelowMinimum)
            } else {
                Evaluation::Silent
            };
        }

        if margin < self.cfg.min_profit_margin_millis {
            // only positive-but-thin margins are worth an event; an ordinary
            // efficient book is silence
            return if margin > 0 {
                Evaluation::Rejected(RejectReason::BelowMinimum)
            } else {
                Evaluation::Silent
            };
        }

        Evaluation::Opportunity(Opportunity {
            market_id: market.market_id.clone(),
            ask_up,
            ask_down,
            size_up: up.ask_size,
            size_down: down.ask_size,
            margin_millis: margin,
            detected_ns: now_ns,
            seq_up: up.seq,
            seq_down: down.seq,
        })
    }

    async fn dispatch(&self, opp: Opportunity) {
        let market_id = opp.market_id.clone();
        let reservation = match self.risk.try_reserve(&opp) {
            Ok(res) => res,
            Err(reason) => {
                SessionStats::bump(&self.stats.rejections);
                self.bus
                    .publish(BotEvent::OpportunityRejected { market_id, reason });
                return;
            }
        };

        // saturated pool: reject rather than queue, stale arbitrage is
        // worse than none
        let permit = match self.submissions.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("[DETECT] submission pool saturated, dropping {}", market_id);
                self.risk.release_clean(reservation.id);
                SessionStats::bump(&self.stats.rejections);
                self.bus.publish(BotEvent::OpportunityRejected {
                    market_id,
                    reason: RejectReason::SubmissionSaturated,
                });
                return;
            }
        };

        let Some(market) = self.registry.get(&market_id) else {
            self.risk.release_clean(reservation.id);
            return;
        };

        info!(
            "[DETECT] {} up={} down={} margin={}m size={}",
            market_id,
            opp.ask_up,
            opp.ask_down,
            opp.margin_millis,
            opp.size()
        );

        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.execute(market, opp, reservation).await;
            drop(permit);
        });
    }
}

// =============================================================================
// TESTS
// =============================================================================

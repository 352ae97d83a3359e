//! Risk gate: bankroll accounting, reservation lifecycle, sizing, quarantine.
//!
//! All bankroll arithmetic happens inside one mutex so
//! `available + reserved == total` holds at every observable instant.
//! The execution engine receives reservation records by value and posts
//! results back; nothing here points at executions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{Config, BREAKER_COOLDOWN, BREAKER_THRESHOLD, BREAKER_WINDOW};
use crate::error::RejectReason;
use crate::events::{BotEvent, EventBus};
use crate::types::{cost_cents_ceil, monotonic_now_ns, Cents, Opportunity, SizeHundredths};

/// Bankroll lock held from opportunity acceptance until execution terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: u64,
    pub market_id: Arc<str>,
    pub notional_cents: Cents,
    pub created_ns: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BankrollSnapshot {
    pub available_cents: Cents,
    pub reserved_cents: Cents,
}

impl BankrollSnapshot {
    pub fn total_cents(&self) -> Cents {
        self.available_cents + self.reserved_cents
    }
}

struct RiskState {
    available_cents: Cents,
    reserved_cents: Cents,
    next_id: u64,
    reservations: FxHashMap<u64, Reservation>,
    by_market: FxHashMap<Arc<str>, u64>,
    quarantined: FxHashSet<Arc<str>>,
}

pub struct RiskGate {
    state: Mutex<RiskState>,
    breaker: CircuitBreaker,
    bus: EventBus,
    max_bet_size_cents: Cents,
    max_bankroll_fraction: f64,
    min_size: SizeHundredths,
    min_notional_cents: Cents,
    reservation_ttl: Duration,
}

impl RiskGate {
    pub fn new(cfg: &Config, bus: EventBus) -> Self {
        Self {
            state: Mutex::new(RiskState {
                available_cents: cfg.bankroll_cents,
                reserved_cents: 0,
                next_id: 1,
                reservations: FxHashMap::default(),
                by_market: FxHashMap::default(),
                quarantined: FxHashSet::default(),
            }),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_WINDOW, BREAKER_COOLDOWN),
            bus,
            max_bet_size_cents: cfg.max_bet_size_cents,
            max_bankroll_fraction: cfg.max_bankroll_fraction,
            min_size: cfg.min_size,
            min_notional_cents: cfg.min_notional_cents,
            reservation_ttl: cfg.reservation_ttl,
        }
    }

    /// Accept or reject an opportunity, reserving bankroll on acceptance
    pub fn try_reserve(&self, opp: &Opportunity) -> Result<Reservation, RejectReason> {
        let mut state = self.state.lock().expect("risk lock poisoned");

        if state.by_market.contains_key(&opp.market_id) {
            return Err(RejectReason::InFlight);
        }
        if state.quarantined.contains(&opp.market_id) {
            return Err(RejectReason::Quarantined);
        }
        if self.breaker.is_halted() {
            return Err(RejectReason::Halted);
        }

        let combined = opp.combined_ask();
        let budget = (state.available_cents as f64 * self.max_bankroll_fraction) as Cents;
        if budget < cost_cents_ceil(self.min_size, combined) {
            return Err(RejectReason::BankrollExhausted);
        }

        let full_cost = cost_cents_ceil(opp.size(), combined);
        let notional = self.max_bet_size_cents.min(full_cost).min(budget);
        if notional < self.min_notional_cents {
            return Err(RejectReason::BelowMinimum);
        }

        let id = state.next_id;
        state.next_id += 1;
        let reservation = Reservation {
            id,
            market_id: opp.market_id.clone(),
            notional_cents: notional,
            created_ns: monotonic_now_ns(),
        };

        state.available_cents -= notional;
        state.reserved_cents += notional;
        state.by_market.insert(opp.market_id.clone(), id);
        state.reservations.insert(id, reservation.clone());

        Ok(reservation)
    }

    /// Release with no realized result (nothing filled, or dispatch failed)
    pub fn release_clean(&self, reservation_id: u64) {
        self.release(reservation_id, 0);
    }

    /// Release and settle the realized result. `pnl_cents` is
    /// payout + recovered proceeds - cost; negative on a losing hedge.
    pub fn release(&self, reservation_id: u64, pnl_cents: Cents) {
        let mut state = self.state.lock().expect("risk lock poisoned");
        let Some(reservation) = state.reservations.remove(&reservation_id) else {
            // already force-released by the TTL sweeper
            warn!("[RISK] release of unknown reservation {}", reservation_id);
            return;
        };
        state.by_market.remove(&reservation.market_id);
        state.reserved_cents -= reservation.notional_cents;
        state.available_cents += reservation.notional_cents + pnl_cents;
        if pnl_cents != 0 {
            info!(
                "[RISK] settled {} pnl {:+.2}",
                reservation.market_id,
                pnl_cents as f64 / 100.0
            );
        }
    }

    pub fn has_reservation(&self, market_id: &str) -> bool {
        self.state
            .lock()
            .expect("risk lock poisoned")
            .by_market
            .contains_key(market_id)
    }

    /// No further submissions for this market until an operator clears it
    pub fn quarantine(&self, market_id: Arc<str>, detail: &str) {
        error!("[RISK] quarantining {}: {}", market_id, detail);
        self.bus.publish(BotEvent::RiskIncident {
            market_id: market_id.clone(),
            detail: Arc::from(detail),
        });
        self.state
            .lock()
            .expect("risk lock poisoned")
            .quarantined
            .insert(market_id);
    }

    pub fn clear_quarantine(&self, market_id: &str) -> bool {
        self.state
            .lock()
            .expect("risk lock poisoned")
            .quarantined
            .remove(market_id)
    }

    pub fn is_quarantined(&self, market_id: &str) -> bool {
        self.state
            .lock()
            .expect("risk lock poisoned")
            .quarantined
            .contains(market_id)
    }

    pub fn bankroll(&self) -> BankrollSnapshot {
        let state = self.state.lock().expect("risk lock poisoned");
        BankrollSnapshot {
            available_cents: state.available_cents,
            reserved_cents: state.reserved_cents,
        }
    }

    pub fn reservation_ttl(&self) -> Duration {
        self.reservation_ttl
    }

    pub fn record_execution_failure(&self) {
        self.breaker.record_failure();
    }

    pub fn record_execution_success(&self) {
        self.breaker.record_success();
    }

    pub fn is_halted(&self) -> bool {
        self.breaker.is_halted()
    }

    /// Force-release reservations past the hard TTL. The owning execution
    /// attempt runs under a shorter deadline; this is the backstop.
    pub fn sweep_expired(&self, now_ns: u64) -> Vec<Reservation> {
        let ttl_ns = self.reservation_ttl.as_nanos() as u64;
        let expired: Vec<Reservation> = {
            let state = self.state.lock().expect("risk lock poisoned");
            state
                .reservations
                .values()
                .filter(|r| now_ns.saturating_sub(r.created_ns) > ttl_ns)
                .cloned()
                .collect()
        };
        for r in &expired {
            warn!(
                "[RISK] reservation {} on {} exceeded TTL, force-releasing",
                r.id, r.market_id
            );
            self.release_clean(r.id);
        }
        expired
    }
}

/// Backstop sweep so a wedged execution can never pin bankroll forever
pub async fn run_reservation_sweeper(gate: Arc<RiskGate>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        gate.sweep_expired(monotonic_now_ns());
    }
}

// =============================================================================
// TESTS
// =============================================================================

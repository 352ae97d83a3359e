//! Typed event fan-out for observability.
//!
//! Every component publishes into one broadcast bus. Delivery is best-effort,
//! at-most-once per subscriber; a lagging subscriber loses messages instead of
//! backpressuring the latency path.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::RejectReason;
use crate::types::{Cents, MarketSide, PriceMillis, SizeHundredths};

/// Terminal disposition of an execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Both legs filled, position net-zero
    BothFilled,
    /// Position flattened through a hedge order
    Hedged,
    /// Nothing filled, reservation released clean
    Abandoned,
    /// Submission failed before both acks
    Aborted,
}

/// Events published on the bus
#[derive(Debug, Clone)]
pub enum BotEvent {
    OpportunityDetected {
        market_id: Arc<str>,
        ask_up: PriceMillis,
        ask_down: PriceMillis,
        margin_millis: i64,
        size: SizeHundredths,
    },
    OpportunityRejected {
        market_id: Arc<str>,
        reason: RejectReason,
    },
    OrderSubmitted {
        market_id: Arc<str>,
        side: MarketSide,
        client_id: Arc<str>,
        price: PriceMillis,
        size: SizeHundredths,
    },
    OrderAcked {
        client_id: Arc<str>,
        order_id: Arc<str>,
    },
    OrderFilled {
        order_id: Arc<str>,
        size: SizeHundredths,
        price: PriceMillis,
    },
    OrderCancelled {
        order_id: Arc<str>,
    },
    HedgeTriggered {
        market_id: Arc<str>,
        side: MarketSide,
        size: SizeHundredths,
    },
    ExecutionCompleted {
        market_id: Arc<str>,
        outcome: ExecOutcome,
        matched: SizeHundredths,
        pnl_cents: Cents,
    },
    RiskIncident {
        market_id: Arc<str>,
        detail: Arc<str>,
    },
    FeedDisconnected {
        source: &'static str,
    },
    FeedReconnected {
        source: &'static str,
    },
}

/// Cheap-to-clone handle over the broadcast channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; silently a no-op with zero subscribers
    pub fn publish(&self, event: BotEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

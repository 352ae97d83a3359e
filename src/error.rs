//! Error taxonomy for the engine.
//!
//! `EngineError` covers genuine failures. Risk-gate rejections are expected
//! outcomes of normal operation and travel as `RejectReason` inside
//! `OpportunityRejected` events instead.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("market discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("feed transport error: {0}")]
    FeedTransport(String),

    #[error("feed protocol error: {0}")]
    FeedProtocol(String),

    #[error("duplicate token {token} already registered on market {market_id}")]
    DuplicateToken { token: String, market_id: String },

    #[error("order submit timed out after {0:?}")]
    SubmitTimeout(Duration),

    #[error("order rejected by venue: {0}")]
    SubmitRejected(String),

    #[error("unresolved partial fill on {market_id}: {detail}")]
    PartialFillUnresolved { market_id: String, detail: String },

    #[error("idempotency violation: client id {client_id} maps to orders {first} and {second}")]
    IdempotencyViolation {
        client_id: String,
        first: String,
        second: String,
    },

    #[error("wall clock moved backwards by {0}s")]
    ClockSkew(i64),
}

/// Why the risk gate (or detector) declined an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A reservation already exists for this market
    InFlight,
    /// Available bankroll cannot cover even the minimum size
    BankrollExhausted,
    /// Margin, size, or notional under the configured floor
    BelowMinimum,
    /// One or both books exceeded the freshness TTL
    BookStale,
    /// Circuit breaker is open
    Halted,
    /// Market quarantined after an unresolved partial fill
    Quarantined,
    /// Submission pool saturated; stale arbitrage is worse than none
    SubmissionSaturated,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::InFlight => "in_flight",
            RejectReason::BankrollExhausted => "bankroll_exhausted",
            RejectReason::BelowMinimum => "below_minimum",
            RejectReason::BookStale => "book_stale",
            RejectReason::Halted => "halted",
            RejectReason::Quarantined => "quarantined",
            RejectReason::SubmissionSaturated => "submission_saturated",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = EngineError::SubmitTimeout(Duration::from_secs(2));
        assert!(e.to_string().contains("2s"));

        let e = EngineError::DuplicateToken {
            token: "tok".into(),
            market_id: "m1".into(),
        };
        assert!(e.to_string().contains("tok"));
        assert!(e.to_string().contains("m1"));
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(RejectReason::InFlight.to_string(), "in_flight");
        assert_eq!(RejectReason::BookStale.to_string(), "book_stale");
    }
}

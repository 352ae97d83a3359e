//! Order submission gateway.
//!
//! `OrderGateway` is the seam between the execution engine and the venue.
//! The live implementation posts signed payloads over REST; the dry-run
//! simulator in `sim.rs` implements the same trait. Signing stays behind the
//! `OrderSigner` collaborator so wallet material never enters the engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SUBMIT_TIMEOUT;
use crate::error::EngineError;
use crate::types::{millis_to_f64, PriceMillis, SizeHundredths};

// =============================================================================
// ORDER TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit,
    Market,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Limit => "LIMIT",
            OrderKind::Market => "MARKET",
        }
    }
}

/// Time-in-force
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tif {
    Gtc,
    Ioc,
    Fok,
}

impl Tif {
    pub fn as_str(self) -> &'static str {
        match self {
            Tif::Gtc => "GTC",
            Tif::Ioc => "IOC",
            Tif::Fok => "FOK",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub token: Arc<str>,
    pub side: OrderSide,
    pub price: PriceMillis,
    pub size: SizeHundredths,
    pub kind: OrderKind,
    pub tif: Tif,
    /// Client-generated idempotency key; resubmission never double-books
    pub client_id: Arc<str>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: Arc<str>,
    pub status: Arc<str>,
}

// =============================================================================
// FILL EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Partially filled, remainder still working
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

/// One update from the per-user fill stream
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: Arc<str>,
    pub filled: SizeHundredths,
    pub price: PriceMillis,
    pub remaining: SizeHundredths,
    pub status: FillStatus,
}

/// Wire shape of the user fill stream
#[derive(Debug, Deserialize)]
pub struct WireFill {
    pub order_id: String,
    pub filled_size: String,
    pub price: String,
    pub remaining: String,
    pub status: String,
}

impl WireFill {
    pub fn into_event(self) -> Option<FillEvent> {
        let status = match self.status.to_ascii_lowercase().as_str() {
            "open" | "partial" | "partially_filled" => FillStatus::Partial,
            "filled" | "matched" => FillStatus::Filled,
            "cancelled" | "canceled" => FillStatus::Cancelled,
            "rejected" => FillStatus::Rejected,
            _ => return None,
        };
        Some(FillEvent {
            order_id: self.order_id.into(),
            filled: crate::types::parse_size_hundredths(&self.filled_size),
            price: crate::types::parse_price_millis(&self.price)?,
            remaining: crate::types::parse_size_hundredths(&self.remaining),
            status,
        })
    }
}

/// Routes fill events to the execution attempt that owns each order id
pub struct FillRouter {
    routes: Mutex<FxHashMap<Arc<str>, mpsc::UnboundedSender<FillEvent>>>,
}

impl FillRouter {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, order_id: Arc<str>, tx: mpsc::UnboundedSender<FillEvent>) {
        self.routes
            .lock()
            .expect("router lock poisoned")
            .insert(order_id, tx);
    }

    pub fn unregister(&self, order_id: &str) {
        self.routes
            .lock()
            .expect("router lock poisoned")
            .remove(order_id);
    }

    pub fn dispatch(&self, event: FillEvent) {
        let tx = self
            .routes
            .lock()
            .expect("router lock poisoned")
            .get(&event.order_id)
            .cloned();
        match tx {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!("[FILLS] no route for order {}", event.order_id),
        }
    }
}

impl Default for FillRouter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// GATEWAY TRAIT
// =============================================================================

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit an order and await the venue acknowledgement
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, EngineError>;

    /// Cancel an acknowledged order; idempotent on the venue side
    async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError>;
}

/// Produces the signed submission payload. Implemented by the
/// wallet/credentials collaborator; the engine never sees key material.
pub trait OrderSigner: Send + Sync {
    fn sign(&self, req: &OrderRequest) -> Result<serde_json::Value, EngineError>;
}

/// Signer backed by a pre-provisioned venue API token
pub struct TokenSigner {
    token: String,
}

impl TokenSigner {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

impl OrderSigner for TokenSigner {
    fn sign(&self, req: &OrderRequest) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::json!({
            "token": req.token.as_ref(),
            "side": req.side.as_str(),
            "price": format!("{:.3}", millis_to_f64(req.price)),
            "size": format!("{:.2}", req.size as f64 / 100.0),
            "type": req.kind.as_str(),
            "tif": req.tif.as_str(),
            "client_id": req.client_id.as_ref(),
            "auth": self.token,
        }))
    }
}

// =============================================================================
// REST GATEWAY
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireAck {
    order_id: String,
    status: String,
}

pub struct RestGateway {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<dyn OrderSigner>,
    /// client_id -> ack, so a retried submission returns the original order
    seen: Mutex<FxHashMap<Arc<str>, OrderAck>>,
}

impl RestGateway {
    pub fn new(base_url: String, signer: Arc<dyn OrderSigner>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            signer,
            seen: Mutex::new(FxHashMap::default()),
        }
    }
}

#[async_trait]
impl OrderGateway for RestGateway {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, EngineError> {
        if let Some(ack) = self
            .seen
            .lock()
            .expect("gateway lock poisoned")
            .get(&req.client_id)
            .cloned()
        {
            debug!(
                "[GATEWAY] replaying ack for client_id {} -> {}",
                req.client_id, ack.order_id
            );
            return Ok(ack);
        }

        let body = self.signer.sign(req)?;
        let url = format!("{}/orders", self.base_url);
        let resp = self.http.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::SubmitTimeout(SUBMIT_TIMEOUT)
            } else {
                EngineError::SubmitRejected(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::SubmitRejected(format!("{status}: {text}")));
        }

        let wire: WireAck = resp
            .json()
            .await
            .map_err(|e| EngineError::SubmitRejected(format!("bad ack: {e}")))?;
        let ack = OrderAck {
            order_id: wire.order_id.into(),
            status: wire.status.into(),
        };

        let mut seen = self.seen.lock().expect("gateway lock poisoned");
        if let Some(prev) = seen.get(&req.client_id) {
            if prev.order_id != ack.order_id {
                return Err(EngineError::IdempotencyViolation {
                    client_id: req.client_id.to_string(),
                    first: prev.order_id.to_string(),
                    second: ack.order_id.to_string(),
                });
            }
        }
        seen.insert(req.client_id.clone(), ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| EngineError::SubmitRejected(e.to_string()))?;
        if !resp.status().is_success() {
            warn!("[GATEWAY] cancel {} returned {}", order_id, resp.status());
        }
        Ok(())
    }
}

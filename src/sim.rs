//! Dry-run order gateway.
//!
//! Implements `OrderGateway` entirely in memory: instantaneous acks, then a
//! fill at the reference price after a synthetic latency. Every other engine
//! path is identical to live trading, which is what makes dry-run rehearsal
//! meaningful. Per-token fill plans let tests script partial fills, resting
//! orders, and rejections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::EngineError;
use crate::gateway::{FillEvent, FillRouter, FillStatus, OrderAck, OrderGateway, OrderRequest};

/// How the simulator treats orders on a token
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillPlan {
    /// Full fill at the submitted price after the synthetic latency
    Fill,
    /// Fill this fraction, leave the rest working
    Partial(f64),
    /// Rest on the book forever (until cancelled)
    Sit,
    /// Venue rejects the submission outright
    Reject,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Synthetic ack-to-fill latency
    pub fill_latency: Duration,
    /// Uniform extra latency on top, for soak realism
    pub latency_jitter: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            fill_latency: Duration::from_millis(10),
            latency_jitter: Duration::ZERO,
        }
    }
}

struct OpenOrder {
    req: OrderRequest,
    filled: u64,
}

pub struct SimGateway {
    cfg: SimConfig,
    router: Arc<FillRouter>,
    plans: Mutex<FxHashMap<Arc<str>, FillPlan>>,
    /// client_id -> ack, for idempotent resubmission
    seen: Mutex<FxHashMap<Arc<str>, OrderAck>>,
    open: Arc<Mutex<FxHashMap<Arc<str>, OpenOrder>>>,
    next_id: AtomicU64,
}

impl SimGateway {
    pub fn new(cfg: SimConfig, router: Arc<FillRouter>) -> Self {
        Self {
            cfg,
            router,
            plans: Mutex::new(FxHashMap::default()),
            seen: Mutex::new(FxHashMap::default()),
            open: Arc::new(Mutex::new(FxHashMap::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Script behavior for a token; defaults to `Fill`
    pub fn set_plan(&self, token: Arc<str>, plan: FillPlan) {
        self.plans.lock().expect("sim lock poisoned").insert(token, plan);
    }

    fn plan_for(&self, token: &str) -> FillPlan {
        self.plans
            .lock()
            .expect("sim lock poisoned")
            .get(token)
            .copied()
            .unwrap_or(FillPlan::Fill)
    }

    /// Open (unfilled) order ids and their tokens
    pub fn open_orders(&self) -> Vec<(Arc<str>, Arc<str>)> {
        self.open
            .lock()
            .expect("sim lock poisoned")
            .iter()
            .map(|(id, order)| (id.clone(), order.req.token.clone()))
            .collect()
    }

    fn latency(&self) -> Duration {
        let jitter_ms = self.cfg.latency_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.cfg.fill_latency;
        }
        self.cfg.fill_latency + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[async_trait]
impl OrderGateway for SimGateway {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, EngineError> {
        if let Some(ack) = self
            .seen
            .lock()
            .expect("sim lock poisoned")
            .get(&req.client_id)
            .cloned()
        {
            debug!("[SIM] replaying ack for {}", req.client_id);
            return Ok(ack);
        }

        let plan = self.plan_for(&req.token);
        if plan == FillPlan::Reject {
            return Err(EngineError::SubmitRejected("simulated rejection".into()));
        }

        let order_id: Arc<str> = format!("sim-{}", self.next_id.fetch_add(1, Ordering::Relaxed)).into();
        let ack = OrderAck {
            order_id: order_id.clone(),
            status: Arc::from("live"),
        };
        self.seen
            .lock()
            .expect("sim lock poisoned")
            .insert(req.client_id.clone(), ack.clone());
        self.open.lock().expect("sim lock poisoned").insert(
            order_id.clone(),
            OpenOrder {
                req: req.clone(),
                filled: 0,
            },
        );

        let open = self.open.clone();
        let router = self.router.clone();
        let latency = self.latency();
        let req = req.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let event = {
                let mut open = open.lock().expect("sim lock poisoned");
                let Some(order) = open.get_mut(&order_id) else {
                    return; // cancelled before the fill landed
                };
                match plan {
                    FillPlan::Fill => {
                        let size = order.req.size;
                        order.filled = size;
                        let ev = FillEvent {
                            order_id: order_id.clone(),
                            filled: size,
                            price: req.price,
                            remaining: 0,
                            status: FillStatus::Filled,
                        };
                        open.remove(&order_id);
                        Some(ev)
                    }
                    FillPlan::Partial(fraction) => {
                        let size = (order.req.size as f64 * fraction).round() as u64;
                        order.filled = size;
                        Some(FillEvent {
                            order_id: order_id.clone(),
                            filled: size,
                            price: req.price,
                            remaining: req.size - size,
                            status: FillStatus::Partial,
                        })
                    }
                    FillPlan::Sit => None,
                    FillPlan::Reject => None,
                }
            };
            if let Some(event) = event {
                router.dispatch(event);
            }
        });

        Ok(ack)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        let cancelled = self
            .open
            .lock()
            .expect("sim lock poisoned")
            .remove(order_id);
        if let Some(order) = cancelled {
            self.router.dispatch(FillEvent {
                order_id: Arc::from(order_id),
                filled: 0,
                price: order.req.price,
                remaining: order.req.size - order.filled,
                status: FillStatus::Cancelled,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{OrderKind, OrderSide, Tif};
    use tokio::sync::mpsc;

    fn request(token: &str, client_id: &str) -> OrderRequest {
        OrderRequest {
            token: token.into(),
            side: OrderSide::Buy,
            price: 480,
            size: 10_000,
            kind: OrderKind::Limit,
            tif: Tif::Gtc,
            client_id: client_id.into(),
        }
    }

    fn sim() -> (SimGateway, Arc<FillRouter>) {
        let router = Arc::new(FillRouter::new());
        let gw = SimGateway::new(
            SimConfig {
                fill_latency: Duration::from_millis(10),
                latency_jitter: Duration::ZERO,
            },
            router.clone(),
        );
        (gw, router)
    }

    #[tokio::test]
    async fn test_ack_then_fill_at_reference_price() {
        let (gw, router) = sim();
        let ack = gw.place_order(&request("tok", "c-1")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.register(ack.order_id.clone(), tx);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.status, FillStatus::Filled);
        assert_eq!(ev.filled, 10_000);
        assert_eq!(ev.price, 480);
        assert_eq!(ev.remaining, 0);
    }

    #[tokio::test]
    async fn test_resubmission_replays_ack() {
        let (gw, _router) = sim();
        let req = request("tok", "c-1");
        let first = gw.place_order(&req).await.unwrap();
        let second = gw.place_order(&req).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
    }

    #[tokio::test]
    async fn test_cancel_before_fill() {
        let (gw, router) = sim();
        gw.set_plan("tok".into(), FillPlan::Sit);
        let ack = gw.place_order(&request("tok", "c-1")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.register(ack.order_id.clone(), tx);

        gw.cancel_order(&ack.order_id).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.status, FillStatus::Cancelled);
        assert_eq!(ev.remaining, 10_000);

        // no late fill arrives afterwards
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_plan() {
        let (gw, router) = sim();
        gw.set_plan("tok".into(), FillPlan::Partial(0.25));
        let ack = gw.place_order(&request("tok", "c-1")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.register(ack.order_id.clone(), tx);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.status, FillStatus::Partial);
        assert_eq!(ev.filled, 2_500);
        assert_eq!(ev.remaining, 7_500);
    }

    #[tokio::test]
    async fn test_reject_plan() {
        let (gw, _router) = sim();
        gw.set_plan("tok".into(), FillPlan::Reject);
        let err = gw.place_order(&request("tok", "c-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::SubmitRejected(_)));
    }
}

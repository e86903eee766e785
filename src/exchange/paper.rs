//! In-memory exchange used by `--paper` and the engine tests.
//!
//! Orders rest until the price moves through them: buys fill once the price
//! trades at or below their limit, sells at or above. Placement never fills
//! immediately. Under `--paper` the price follows [`PaperExchange::random_walk`].

use super::{Exchange, ExchangeError, ExchangeOrder, OrderEvent, PlaceOrder, PlacedOrder, Quote};
use crate::model::{OrderId, OrderSide, OrderStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

/// Operation a queued failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperOp {
    Ticker,
    Place,
    Cancel,
    OpenOrders,
    OrderStatus,
}

struct PaperState {
    price: Decimal,
    next_oid: u64,
    orders: BTreeMap<OrderId, ExchangeOrder>,
    failures: Vec<(PaperOp, ExchangeError)>,
    events: broadcast::Sender<OrderEvent>,
    place_calls: usize,
    cancel_calls: usize,
}

impl PaperState {
    fn take_failure(&mut self, op: PaperOp) -> Result<(), ExchangeError> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(pos) => Err(self.failures.remove(pos).1),
            None => Ok(()),
        }
    }

    fn emit(&self, event: OrderEvent) {
        // No subscriber is fine; the integrity poll still sees the state.
        let _ = self.events.send(event);
    }
}

pub struct PaperExchange {
    symbol: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(symbol: &str, price: Decimal) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            symbol: symbol.to_string(),
            state: Mutex::new(PaperState {
                price,
                next_oid: 1,
                orders: BTreeMap::new(),
                failures: Vec::new(),
                events,
                place_calls: 0,
                cancel_calls: 0,
            }),
        }
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(ExchangeError::Permanent(format!("unknown symbol {}", symbol)))
        }
    }

    /// Makes the next `times` calls of `op` fail with `err`.
    pub async fn fail_next(&self, op: PaperOp, err: ExchangeError, times: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..times {
            state.failures.push((op, err.clone()));
        }
    }

    pub async fn price(&self) -> Decimal {
        self.state.lock().await.price
    }

    /// Moves the market and fills every resting order the move crosses.
    pub async fn set_price(&self, price: Decimal) -> Vec<OrderId> {
        let mut state = self.state.lock().await;
        state.price = price;

        let crossed: Vec<OrderId> = state
            .orders
            .values()
            .filter(|o| o.status.is_live())
            .filter(|o| match o.side {
                OrderSide::Buy => price <= o.price,
                OrderSide::Sell => price >= o.price,
            })
            .map(|o| o.order_id.clone())
            .collect();

        for oid in &crossed {
            let event = match state.orders.get_mut(oid) {
                Some(order) => {
                    order.status = OrderStatus::Filled;
                    order.filled_qty = order.quantity;
                    info!("[PAPER] Filled {} {} @ {}", order.side, order.quantity, order.price);
                    OrderEvent::StatusChanged {
                        order_id: oid.clone(),
                        status: OrderStatus::Filled,
                        filled_qty: order.quantity,
                    }
                }
                None => continue,
            };
            state.emit(event);
        }
        crossed
    }

    /// Fills `qty` of a resting order and pushes the update.
    pub async fn fill_order(&self, order_id: &OrderId, qty: Decimal) {
        let mut state = self.state.lock().await;
        let event = match state.orders.get_mut(order_id) {
            Some(order) => {
                order.filled_qty = (order.filled_qty + qty).min(order.quantity);
                order.status = if order.filled_qty >= order.quantity {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                OrderEvent::StatusChanged {
                    order_id: order_id.clone(),
                    status: order.status,
                    filled_qty: order.filled_qty,
                }
            }
            None => return,
        };
        state.emit(event);
    }

    /// Fills an order without pushing an event, as a dropped stream would.
    pub async fn fill_silently(&self, order_id: &OrderId) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = OrderStatus::Filled;
            order.filled_qty = order.quantity;
        }
    }

    /// Cancels an order on behalf of someone other than the engine.
    pub async fn cancel_externally(&self, order_id: &OrderId) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = OrderStatus::Cancelled;
        } else {
            return;
        }
        state.emit(OrderEvent::ExternalCancel {
            order_id: order_id.clone(),
        });
    }

    /// Rests an order the engine never placed.
    pub async fn inject_foreign_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> OrderId {
        let mut state = self.state.lock().await;
        let order_id = OrderId::from(state.next_oid);
        state.next_oid += 1;
        state.orders.insert(
            order_id.clone(),
            ExchangeOrder {
                order_id: order_id.clone(),
                cloid: None,
                side,
                price,
                quantity,
                filled_qty: Decimal::ZERO,
                status: OrderStatus::Open,
            },
        );
        order_id
    }

    /// Ends every open event stream.
    pub async fn disconnect_streams(&self) {
        let mut state = self.state.lock().await;
        let (events, _) = broadcast::channel(256);
        state.events = events;
    }

    pub async fn resting_orders(&self) -> Vec<ExchangeOrder> {
        let state = self.state.lock().await;
        state
            .orders
            .values()
            .filter(|o| o.status.is_live())
            .cloned()
            .collect()
    }

    pub async fn place_calls(&self) -> usize {
        self.state.lock().await.place_calls
    }

    pub async fn cancel_calls(&self) -> usize {
        self.state.lock().await.cancel_calls
    }

    /// Drives the market with a bounded random walk: every `interval` the
    /// price moves by up to `max_step` (0.002 = 0.2%) either way.
    pub async fn random_walk(self: Arc<Self>, max_step: Decimal, decimals: u32, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;
        loop {
            timer.tick().await;
            let unit: f64 = {
                use rand::Rng;
                rand::rng().random_range(-1.0..=1.0)
            };
            let current = self.price().await;
            let next = walk_step(current, max_step, unit, decimals);
            if next != current {
                debug!("[PAPER] Price {} -> {}", current, next);
                self.set_price(next).await;
            }
        }
    }
}

/// Next walk price for a move of `unit` (in [-1, 1]) times `max_step`.
/// A move that would leave the price non-positive is skipped.
pub fn walk_step(price: Decimal, max_step: Decimal, unit: f64, decimals: u32) -> Decimal {
    let unit = Decimal::from_f64(unit.clamp(-1.0, 1.0)).unwrap_or(Decimal::ZERO);
    let next = (price * (Decimal::ONE + max_step * unit)).round_dp(decimals);
    if next > Decimal::ZERO {
        next
    } else {
        price
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        self.check_symbol(symbol)?;
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::Ticker)?;
        Ok(Quote {
            bid: Some(state.price),
            ask: Some(state.price),
            last: Some(state.price),
            timestamp: Utc::now(),
        })
    }

    async fn place_order(&self, req: &PlaceOrder) -> Result<PlacedOrder, ExchangeError> {
        self.check_symbol(&req.symbol)?;
        let mut state = self.state.lock().await;
        state.place_calls += 1;
        state.take_failure(PaperOp::Place)?;

        if req.price <= Decimal::ZERO || req.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Permanent(format!(
                "invalid order {} @ {}",
                req.quantity, req.price
            )));
        }

        let order_id = OrderId::from(state.next_oid);
        state.next_oid += 1;
        state.orders.insert(
            order_id.clone(),
            ExchangeOrder {
                order_id: order_id.clone(),
                cloid: Some(req.cloid),
                side: req.side,
                price: req.price,
                quantity: req.quantity,
                filled_qty: Decimal::ZERO,
                status: OrderStatus::Open,
            },
        );
        debug!("[PAPER] Resting {} {} @ {} as {}", req.side, req.quantity, req.price, order_id);

        Ok(PlacedOrder {
            order_id,
            status: OrderStatus::Open,
            filled_qty: Decimal::ZERO,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        let mut state = self.state.lock().await;
        state.cancel_calls += 1;
        state.take_failure(PaperOp::Cancel)?;

        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_live() => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            Some(order) => Err(ExchangeError::Permanent(format!(
                "order {} already {}",
                order_id, order.status
            ))),
            None => Err(ExchangeError::Permanent(format!(
                "order {} not found",
                order_id
            ))),
        }
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::OpenOrders)?;
        Ok(state
            .orders
            .values()
            .filter(|o| o.status.is_live())
            .cloned()
            .collect())
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &OrderId,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::OrderStatus)?;
        Ok(state.orders.get(order_id).cloned())
    }

    async fn stream_order_events(
        &self,
        symbol: &str,
    ) -> Result<BoxStream<'static, OrderEvent>, ExchangeError> {
        self.check_symbol(symbol)?;
        let state = self.state.lock().await;
        let rx = state.events.subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }
}

//! Grid reconciliation engine.
//!
//! The engine is the single writer of [`EngineState`]. Price ticks, order
//! events, timers and operator signals all arrive as [`EngineEvent`]s and are
//! handled one at a time; a reconciliation pass always runs to completion
//! before the next event is looked at.

pub mod order_book;
pub mod retry;
pub mod state;

use crate::config::grid::GridConfig;
use crate::constants::STATUS_SUMMARY_INTERVAL;
use crate::error::GridError;
use crate::exchange::{Exchange, ExchangeOrder, OrderEvent, PlaceOrder, PlacedOrder};
use crate::feed::{PriceNormalizer, PriceTick};
use crate::grid::{layout, GridModel};
use crate::logging::order_audit::OrderAuditLogger;
use crate::model::{OrderId, OrderIntent, OrderSide, OrderStatus, TrackedOrder};
use crate::notify::{NotificationEvent, NotificationKind, NotificationSink};
use crate::persistence::PersistenceSink;
use chrono::Utc;
use futures_util::future::join_all;
use order_book::{ApplyOutcome, BookEvent};
use retry::{with_retry, RetryBudget, RetryPolicy};
use rust_decimal::Decimal;
use serde_json::json;
use state::{EngineMode, EngineSnapshot, EngineState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Diff rounds per pass. Extra rounds only happen when placements fill on
/// arrival and pair into new intents.
const MAX_PASS_ROUNDS: usize = 4;

#[derive(Debug)]
pub enum EngineEvent {
    Tick(PriceTick),
    Order(OrderEvent),
    /// Periodic comparison against exchange truth.
    IntegrityPoll,
    /// The order-event stream was reopened; pushed updates may have been lost.
    StreamReconnected,
    /// Operator request to rebuild state from the exchange.
    Reset,
    Shutdown,
}

pub struct ReconciliationEngine<E, N, P>
where
    E: Exchange + ?Sized,
    N: NotificationSink,
    P: PersistenceSink,
{
    config: GridConfig,
    grid: GridModel,
    exchange: Arc<E>,
    notifier: N,
    persistence: P,
    audit_logger: Option<OrderAuditLogger>,
    policy: RetryPolicy,
    call_timeout: Duration,
    state: EngineState,
    draining: bool,
}

impl<E, N, P> ReconciliationEngine<E, N, P>
where
    E: Exchange + ?Sized,
    N: NotificationSink,
    P: PersistenceSink,
{
    pub fn new(
        config: GridConfig,
        exchange: Arc<E>,
        notifier: N,
        persistence: P,
    ) -> Result<Self, GridError> {
        config
            .validate()
            .map_err(|e| GridError::InvalidConfig(e.to_string()))?;
        let grid = GridModel::new(&config)?;
        Ok(Self {
            policy: config.retry_policy(),
            call_timeout: config.exchange_timeout(),
            grid,
            config,
            exchange,
            notifier,
            persistence,
            audit_logger: None,
            state: EngineState::new(),
            draining: false,
        })
    }

    pub fn with_audit_logger(mut self, logger: Option<OrderAuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn mode(&self) -> EngineMode {
        self.state.mode
    }

    pub fn grid(&self) -> &GridModel {
        &self.grid
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restores the last snapshot, or starts fresh from the ticker, and brings
    /// the engine in line with the exchange.
    pub async fn bootstrap(&mut self) -> Result<(), GridError> {
        info!("[INIT] Bootstrapping {} on {}", self.config.symbol, self.exchange.name());
        self.state.mode = EngineMode::Initializing;

        let loaded = tokio::time::timeout(self.config.persistence_timeout(), self.persistence.load())
            .await
            .unwrap_or_else(|_| {
                Err(GridError::PersistenceFailure(
                    "snapshot load timed out".to_string(),
                ))
            });
        let snapshot = match loaded {
            Ok(s) => s,
            Err(e) => {
                warn!("[INIT] {}. Starting without a snapshot.", e);
                None
            }
        };

        match snapshot {
            Some(snap) if snap.symbol == self.config.symbol => {
                self.restore(snap);
                // Restored orders stay Unknown until a poll confirms them.
                if let Err(e) = self.integrity_poll().await {
                    if e.is_fatal() {
                        self.enter_degraded(&format!("bootstrap poll: {}", e));
                    } else {
                        self.state.mode = EngineMode::Initializing;
                        error!("[INIT] Could not confirm restored orders: {}", e);
                        return Err(e);
                    }
                }
            }
            Some(snap) => {
                warn!(
                    "[INIT] Snapshot belongs to {}, not {}. Ignoring it.",
                    snap.symbol, self.config.symbol
                );
                self.rebuild_from_exchange("bootstrap").await?;
            }
            None => self.rebuild_from_exchange("bootstrap").await?,
        }

        info!(
            "[INIT] {} ready: mode {}, {} live orders",
            self.config.symbol,
            self.state.mode,
            self.state.book.live_orders().count()
        );
        Ok(())
    }

    /// Consumes events until `Shutdown` or until every sender is gone, then
    /// drains whatever is still queued without running further passes.
    pub async fn run(&mut self, mut events: mpsc::Receiver<EngineEvent>) -> Result<(), GridError> {
        let interval = self.config.reconciliation_interval();
        let mut reconcile_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut status_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + STATUS_SUMMARY_INTERVAL,
            STATUS_SUMMARY_INTERVAL,
        );

        info!("Starting Event Loop...");
        loop {
            tokio::select! {
                _ = status_timer.tick() => {
                    self.log_status();
                }
                _ = reconcile_timer.tick() => {
                    self.handle_event(EngineEvent::IntegrityPoll).await;
                }
                msg = events.recv() => match msg {
                    Some(EngineEvent::Shutdown) | None => {
                        info!("Shutdown signal received. Stopping Engine...");
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                }
            }
        }

        self.draining = true;
        events.close();
        let mut drained = 0;
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
            drained += 1;
        }
        if drained > 0 {
            info!("[SHUTDOWN] Drained {} queued events", drained);
        }
        self.persist();
        self.log_status();
        info!("Engine stopped gracefully.");
        Ok(())
    }

    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Tick(tick) => self.on_tick(tick).await,
            EngineEvent::Order(event) => self.on_order_event(event).await,
            EngineEvent::IntegrityPoll => self.poll().await,
            EngineEvent::StreamReconnected => {
                let marked = self.state.book.mark_all_unknown();
                warn!(
                    "[STREAM] Reconnected; {} live orders marked UNKNOWN until verified",
                    marked
                );
                self.poll().await;
            }
            EngineEvent::Reset => self.reset().await,
            EngineEvent::Shutdown => self.draining = true,
        }
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    async fn on_tick(&mut self, tick: PriceTick) {
        self.state.last_price = Some(tick.price);
        if self.draining || self.state.mode == EngineMode::Degraded {
            return;
        }
        let Some(reason) = self.shift_reason(tick.price) else {
            return;
        };
        if self.shift_grid(tick.price, &reason) {
            self.reconcile("grid shift").await;
        }
    }

    async fn on_order_event(&mut self, event: OrderEvent) {
        let book_event = match event {
            OrderEvent::StatusChanged {
                order_id,
                status,
                filled_qty,
            } => BookEvent::StatusChanged {
                order_id,
                status,
                filled_qty,
            },
            OrderEvent::ExternalCancel { order_id } => BookEvent::ExternalCancel { order_id },
        };

        match self.state.book.apply(book_event) {
            ApplyOutcome::Applied { level, current, .. } => {
                if current == OrderStatus::PartiallyFilled {
                    if let Some(o) = self.state.book.get(level) {
                        info!(
                            "[PARTIAL_FILL] L{} {} {}/{} @ {}",
                            level,
                            o.side(),
                            o.filled_qty,
                            o.intent.quantity,
                            o.price()
                        );
                    }
                }
                if current.is_terminal() {
                    self.settle_terminal(level);
                    self.reconcile("order event").await;
                }
            }
            ApplyOutcome::Regressed { level } => {
                warn!(
                    "[DRIFT] Out-of-order status for level {}; marked UNKNOWN until the next integrity poll",
                    level
                );
            }
            ApplyOutcome::Duplicate => debug!("Duplicate order event ignored."),
            ApplyOutcome::Untracked => debug!("Event for untracked order ignored."),
            ApplyOutcome::Occupied { level } => {
                debug!("Event for occupied level {} ignored.", level)
            }
        }
    }

    async fn poll(&mut self) {
        if self.draining {
            return;
        }
        if self.state.mode == EngineMode::Degraded {
            debug!("[RECONCILE] Integrity poll skipped: engine degraded");
            return;
        }
        if let Err(e) = self.integrity_poll().await {
            self.on_failure("integrity poll", e);
        }
    }

    async fn reset(&mut self) {
        if self.draining {
            return;
        }
        warn!("[RESET] Operator reset: rebuilding state from the exchange");
        self.state.book.clear();
        self.state.suppressed.clear();
        if let Err(e) = self.rebuild_from_exchange("reset").await {
            error!("[RESET] Rebuild failed: {}", e);
            self.enter_degraded(&format!("reset failed: {}", e));
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap helpers
    // ------------------------------------------------------------------

    fn restore(&mut self, snap: EngineSnapshot) {
        info!(
            "[INIT] Restoring snapshot from {} ({} orders, anchor {})",
            snap.saved_at,
            snap.orders.len(),
            snap.anchor
        );
        if snap.mode == EngineMode::Degraded {
            warn!("[INIT] Snapshot was DEGRADED; restart treated as an operator reset");
        }

        self.state.anchor = snap.anchor;
        self.state.offset = snap.offset;
        self.state.levels = self.grid.levels(snap.offset);
        self.state.layout = snap
            .layout
            .into_iter()
            .filter(|(index, _)| self.grid.contains_index(snap.offset, *index))
            .collect();
        self.state.position = snap.position;
        self.state.last_reconciled = snap.last_reconciled;
        self.state.book.clear();
        for order in snap.orders.into_iter().filter(|o| o.status.is_live()) {
            self.state.book.insert(order);
        }
        // Nothing restored is trusted until the exchange confirms it.
        self.state.book.mark_all_unknown();
    }

    /// Takes the anchor from the ticker, lays the grid out, adopts exchange
    /// orders resting on grid levels and runs a pass.
    async fn rebuild_from_exchange(&mut self, trigger: &str) -> Result<(), GridError> {
        self.state.mode = EngineMode::Initializing;
        let budget = RetryBudget::new(self.config.max_retry_budget);
        let exchange = self.exchange.clone();
        let exchange = &exchange;
        let symbol = self.config.symbol.clone();
        let symbol = symbol.as_str();

        let quote = with_retry(&self.policy, &budget, self.call_timeout, "get_ticker", move || {
            exchange.get_ticker(symbol)
        })
        .await?;
        let anchor = PriceNormalizer::default()
            .normalize(&quote)
            .map(|t| t.price)
            .ok_or_else(|| GridError::Transient("ticker carried no usable price".to_string()))?;

        let offset = match self.grid.bounds(self.state.offset) {
            Some((lo, hi)) if anchor >= lo && anchor < hi => self.state.offset,
            _ => self.grid.recentre_offset(anchor).ok_or_else(|| {
                GridError::InvalidConfig(format!("cannot place a grid around {}", anchor))
            })?,
        };
        self.relayout(anchor, offset);
        self.state.last_price = Some(anchor);

        let open = with_retry(&self.policy, &budget, self.call_timeout, "open_orders", move || {
            exchange.open_orders(symbol)
        })
        .await?;
        self.adopt(open);

        self.reconcile(trigger).await;
        if self.state.mode != EngineMode::Degraded {
            self.state.last_reconciled = Some(Utc::now());
        }
        Ok(())
    }

    fn adopt(&mut self, open: Vec<ExchangeOrder>) {
        for ex in open {
            let Some(level) = self.grid.level_at_price(self.state.offset, ex.price) else {
                warn!(
                    "[ADOPT] Order {} {} @ {} is off-grid; left untouched",
                    ex.order_id, ex.side, ex.price
                );
                continue;
            };
            if self.state.book.is_occupied(level) {
                warn!(
                    "[ADOPT] Order {} on level {} already occupied; left untouched",
                    ex.order_id, level
                );
                continue;
            }
            info!(
                "[ADOPT] Level {}: {} {} @ {} ({})",
                level, ex.side, ex.quantity, ex.price, ex.order_id
            );
            self.state.book.insert(TrackedOrder {
                intent: OrderIntent {
                    level,
                    side: ex.side,
                    price: ex.price,
                    quantity: ex.quantity,
                    cloid: ex.cloid.unwrap_or_default(),
                },
                order_id: ex.order_id,
                status: ex.status,
                filled_qty: ex.filled_qty,
            });
        }
    }

    fn relayout(&mut self, anchor: Decimal, offset: i64) {
        self.state.anchor = anchor;
        self.state.offset = offset;
        self.state.levels = self.grid.levels(offset);
        self.state.layout = layout(&self.state.levels, anchor, self.config.max_open_levels);
        info!(
            "[GRID] Anchor {} | levels {}..{} | {} planned",
            anchor,
            self.state.levels.first().map(|l| l.price).unwrap_or_default(),
            self.state.levels.last().map(|l| l.price).unwrap_or_default(),
            self.state.layout.len()
        );
    }

    // ------------------------------------------------------------------
    // Grid shift
    // ------------------------------------------------------------------

    fn shift_reason(&self, price: Decimal) -> Option<String> {
        let (lo, hi) = self.grid.bounds(self.state.offset)?;
        if price < lo || price >= hi {
            return Some(format!("price {} left [{}, {})", price, lo, hi));
        }
        let threshold = self.config.recentre_threshold?;
        if self.state.anchor <= Decimal::ZERO {
            return None;
        }
        let drift =
            (price - self.state.anchor).abs() / self.state.anchor * Decimal::ONE_HUNDRED;
        if drift > threshold {
            Some(format!(
                "price {} drifted {}% from anchor {}",
                price,
                drift.round_dp(2),
                self.state.anchor
            ))
        } else {
            None
        }
    }

    fn shift_grid(&mut self, price: Decimal, reason: &str) -> bool {
        let Some(offset) = self.grid.recentre_offset(price) else {
            warn!("[GRID] Cannot recentre on {}; keeping the current grid", price);
            return false;
        };
        let old_anchor = self.state.anchor;
        let old_offset = self.state.offset;
        info!(
            "[GRID_SHIFT] {}: offset {} -> {}, anchor {} -> {}",
            reason, old_offset, offset, old_anchor, price
        );
        self.relayout(price, offset);
        self.notify(
            NotificationKind::GridShift,
            json!({
                "reason": reason,
                "old_anchor": old_anchor.to_string(),
                "new_anchor": price.to_string(),
                "old_offset": old_offset,
                "new_offset": offset,
            }),
        );
        true
    }

    // ------------------------------------------------------------------
    // Reconciliation pass
    // ------------------------------------------------------------------

    async fn reconcile(&mut self, trigger: &str) {
        if self.draining {
            debug!("[RECONCILE] {} pass skipped: shutting down", trigger);
            return;
        }
        if self.state.mode == EngineMode::Degraded {
            debug!("[RECONCILE] {} pass skipped: engine degraded", trigger);
            return;
        }
        if let Err(e) = self.run_pass(trigger).await {
            self.on_failure(trigger, e);
        }
    }

    /// Diffs the book against the layout and executes the result: cancels
    /// first, then placements, each phase concurrently.
    async fn run_pass(&mut self, trigger: &str) -> Result<(), GridError> {
        self.state.mode = EngineMode::Reconciling;
        let budget = RetryBudget::new(self.config.max_retry_budget);
        let mut fatal: Option<GridError> = None;
        let mut incomplete = 0usize;

        for _ in 0..MAX_PASS_ROUNDS {
            let desired = self.state.desired(self.config.order_size);
            let diff = self.state.book.diff(&self.state.levels, &desired);
            if diff.is_empty() {
                break;
            }
            info!(
                "[RECONCILE] {}: {} to cancel, {} to place",
                trigger,
                diff.to_cancel.len(),
                diff.to_place.len()
            );

            // Cancel phase.
            let results = join_all(diff.to_cancel.iter().map(|o| self.cancel_one(o, &budget))).await;
            for (order, result) in diff.to_cancel.iter().zip(results) {
                match result {
                    Ok(()) => {
                        info!(
                            "[ORDER_CANCELLED] L{} {} @ {} ({})",
                            order.level(),
                            order.side(),
                            order.price(),
                            order.order_id
                        );
                        self.state.book.apply(BookEvent::StatusChanged {
                            order_id: order.order_id.clone(),
                            status: OrderStatus::Cancelled,
                            filled_qty: order.filled_qty,
                        });
                        if let Some(logger) = &self.audit_logger {
                            logger.log_cancel(&self.config.symbol, order, trigger);
                        }
                        self.settle_terminal(order.level());
                    }
                    Err(GridError::Permanent(msg)) => {
                        warn!(
                            "[RECONCILE] Cancel of {} refused ({}); marked UNKNOWN",
                            order.order_id, msg
                        );
                        self.state.book.mark_unknown(order.level());
                    }
                    Err(e) if e.is_fatal() => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        warn!("[RECONCILE] Cancel of {} failed: {}", order.order_id, e);
                        incomplete += 1;
                    }
                }
            }

            // Place phase. A level whose cancel failed stays occupied.
            let placeable: Vec<OrderIntent> = diff
                .to_place
                .into_iter()
                .filter(|i| !self.state.book.is_occupied(i.level))
                .collect();
            let results = join_all(placeable.iter().map(|i| self.place_one(i, &budget))).await;

            let mut filled_on_arrival = Vec::new();
            for (intent, result) in placeable.into_iter().zip(results) {
                match result {
                    Ok(placed) => {
                        info!(
                            "[ORDER_SENT] L{} {} {} @ {} ({})",
                            intent.level, intent.side, intent.quantity, intent.price, placed.order_id
                        );
                        if let Some(logger) = &self.audit_logger {
                            logger.log_req(&self.config.symbol, &intent, placed.order_id.as_str());
                        }
                        let level = intent.level;
                        let outcome = self.state.book.apply(BookEvent::Submitted {
                            intent,
                            order_id: placed.order_id,
                            status: placed.status,
                            filled_qty: placed.filled_qty,
                        });
                        if let ApplyOutcome::Applied { current, .. } = outcome {
                            if current.is_terminal() {
                                filled_on_arrival.push(level);
                            }
                        }
                    }
                    Err(GridError::Permanent(msg)) => {
                        self.reject(intent, &msg);
                    }
                    Err(e) if e.is_fatal() => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        warn!("[RECONCILE] Placement on level {} failed: {}", intent.level, e);
                        incomplete += 1;
                    }
                }
            }

            if let Some(e) = fatal.take() {
                return Err(e);
            }
            if filled_on_arrival.is_empty() {
                break;
            }
            for level in filled_on_arrival {
                self.settle_terminal(level);
            }
        }

        if incomplete > 0 {
            warn!(
                "[RECONCILE] {} left {} commands unfinished; the next integrity poll retries them",
                trigger, incomplete
            );
        }
        if budget.spent() > 0 {
            debug!(
                "[RECONCILE] {} spent {}/{} retries",
                trigger,
                budget.spent(),
                budget.limit()
            );
        }
        self.state.mode = EngineMode::Synced;
        self.persist();
        Ok(())
    }

    async fn cancel_one(&self, order: &TrackedOrder, budget: &RetryBudget) -> Result<(), GridError> {
        let exchange = &self.exchange;
        let symbol = self.config.symbol.as_str();
        let order_id = &order.order_id;
        let label = format!("cancel {}", order_id);
        with_retry(&self.policy, budget, self.call_timeout, &label, move || {
            exchange.cancel_order(symbol, order_id)
        })
        .await
    }

    async fn place_one(
        &self,
        intent: &OrderIntent,
        budget: &RetryBudget,
    ) -> Result<PlacedOrder, GridError> {
        let exchange = &self.exchange;
        let req = PlaceOrder {
            symbol: self.config.symbol.clone(),
            side: intent.side,
            price: intent.price,
            quantity: intent.quantity.round_dp(self.config.size_decimals),
            cloid: intent.cloid,
        };
        let req = &req;
        let label = format!("place {} L{} @ {}", intent.side, intent.level, intent.price);
        with_retry(&self.policy, budget, self.call_timeout, &label, move || {
            exchange.place_order(req)
        })
        .await
    }

    /// A placement the exchange refused outright. The level stays vacant until
    /// the next integrity poll.
    fn reject(&mut self, intent: OrderIntent, reason: &str) {
        error!(
            "[ORDER_REJECTED] L{} {} {} @ {}: {}",
            intent.level, intent.side, intent.quantity, intent.price, reason
        );
        self.state.suppressed.insert(intent.level);
        if let Some(logger) = &self.audit_logger {
            logger.log_reject(&self.config.symbol, &intent, reason);
        }
        self.notify(
            NotificationKind::OrderRejected,
            json!({
                "level": intent.level,
                "side": intent.side.to_string(),
                "price": intent.price.to_string(),
                "quantity": intent.quantity.to_string(),
                "reason": reason,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Fills and terminal orders
    // ------------------------------------------------------------------

    /// Acts on a terminal order and removes it from its level.
    fn settle_terminal(&mut self, level: i64) {
        let Some(status) = self.state.book.get(level).map(|o| o.status) else {
            return;
        };
        match status {
            OrderStatus::Filled => self.handle_fill(level),
            OrderStatus::Cancelled | OrderStatus::Rejected => {
                if let Some(order) = self.state.book.retire(level) {
                    if order.filled_qty > Decimal::ZERO {
                        // Partial fill before the cancel still moved inventory.
                        self.state
                            .position
                            .record_fill(order.side(), order.filled_qty, order.price());
                    }
                    debug!("Level {} vacated ({} {})", level, order.order_id, status);
                }
            }
            _ => {}
        }
    }

    fn handle_fill(&mut self, level: i64) {
        let Some(order) = self.state.book.retire(level) else {
            return;
        };
        let quantity = if order.filled_qty > Decimal::ZERO {
            order.filled_qty
        } else {
            order.intent.quantity
        };
        let pnl = self
            .state
            .position
            .record_fill(order.side(), quantity, order.price());
        info!(
            "[ORDER_FILLED] L{} {} {} @ {} (realized {})",
            level,
            order.side(),
            quantity,
            order.price(),
            pnl
        );
        if let Some(logger) = &self.audit_logger {
            logger.log_fill(&self.config.symbol, &order, quantity);
        }
        self.notify(
            NotificationKind::FillExecuted,
            json!({
                "level": level,
                "side": order.side().to_string(),
                "price": order.price().to_string(),
                "quantity": quantity.to_string(),
                "realized_pnl": pnl.to_string(),
                "inventory": self.state.position.inventory.to_string(),
            }),
        );

        self.state.layout.remove(&level);
        let (target, side) = match order.side() {
            OrderSide::Buy => (level + 1, OrderSide::Sell),
            OrderSide::Sell => (level - 1, OrderSide::Buy),
        };
        if !self.state.is_active(target) {
            info!(
                "[PAIR] {} on level {} suppressed: level outside the grid",
                side, target
            );
        } else if self.state.layout.contains_key(&target) {
            info!(
                "[PAIR] {} on level {} suppressed: level already planned",
                side, target
            );
        } else {
            info!("[PAIR] Level {} fill -> {} on level {}", level, side, target);
            self.state.layout.insert(target, side);
        }
    }

    // ------------------------------------------------------------------
    // Integrity poll
    // ------------------------------------------------------------------

    /// Compares the book with the exchange's open orders, settles what the
    /// stream missed, then runs a pass.
    async fn integrity_poll(&mut self) -> Result<(), GridError> {
        self.state.mode = EngineMode::Reconciling;
        let budget = RetryBudget::new(self.config.max_retry_budget);
        let exchange = self.exchange.clone();
        let exchange = &exchange;
        let symbol = self.config.symbol.clone();
        let symbol = symbol.as_str();

        let open = with_retry(&self.policy, &budget, self.call_timeout, "open_orders", move || {
            exchange.open_orders(symbol)
        })
        .await?;

        let mut seen: HashSet<OrderId> = HashSet::new();
        for ex in open {
            seen.insert(ex.order_id.clone());

            if let Some(tracked) = self.state.book.find(&ex.order_id) {
                // Listings may not carry fill progress; never lose what the
                // book already knows.
                let filled_qty = ex.filled_qty.max(tracked.filled_qty);
                let status = if ex.status == OrderStatus::Open && filled_qty > Decimal::ZERO {
                    OrderStatus::PartiallyFilled
                } else {
                    ex.status
                };
                let outcome = self.state.book.apply(BookEvent::StatusChanged {
                    order_id: ex.order_id.clone(),
                    status,
                    filled_qty,
                });
                if let ApplyOutcome::Regressed { level } = outcome {
                    warn!(
                        "[DRIFT] Exchange reports {} as {} against local state; level {} UNKNOWN",
                        ex.order_id, ex.status, level
                    );
                }
                continue;
            }
            if self.state.book.is_completed(&ex.order_id) {
                debug!("Exchange still lists completed order {}", ex.order_id);
                continue;
            }

            match self.grid.level_at_price(self.state.offset, ex.price) {
                Some(level) if self.state.book.is_occupied(level) => {
                    let local = self
                        .state
                        .book
                        .get(level)
                        .map(|o| o.order_id.to_string())
                        .unwrap_or_default();
                    let msg = format!(
                        "exchange order {} ({} @ {}) sits on level {} held by {}",
                        ex.order_id, ex.side, ex.price, level, local
                    );
                    error!("[DRIFT] {}", msg);
                    self.notify(
                        NotificationKind::DriftDetected,
                        json!({
                            "level": level,
                            "exchange_order": ex.order_id.to_string(),
                            "local_order": local,
                            "side": ex.side.to_string(),
                            "price": ex.price.to_string(),
                        }),
                    );
                    return Err(GridError::StateDivergence(msg));
                }
                Some(level) => warn!(
                    "[DRIFT] Untracked order {} rests on vacant level {}; left untouched",
                    ex.order_id, level
                ),
                None => warn!(
                    "[DRIFT] Untracked off-grid order {} {} @ {}; left untouched",
                    ex.order_id, ex.side, ex.price
                ),
            }
        }

        // Live locally but absent on the exchange: the stream missed something.
        let missing: Vec<(i64, OrderId)> = self
            .state
            .book
            .live_orders()
            .filter(|o| !seen.contains(&o.order_id))
            .map(|o| (o.level(), o.order_id.clone()))
            .collect();
        for (level, order_id) in missing {
            info!(
                "[RECONCILE] Order {} on level {} missing from exchange. Querying status...",
                order_id, level
            );
            let id = &order_id;
            let status = with_retry(&self.policy, &budget, self.call_timeout, "order_status", move || {
                exchange.order_status(symbol, id)
            })
            .await?;
            let event = match status {
                Some(o) => BookEvent::StatusChanged {
                    order_id: order_id.clone(),
                    status: o.status,
                    filled_qty: o.filled_qty,
                },
                None => {
                    warn!("[RECONCILE] Exchange has no record of {}; assuming cancelled", order_id);
                    BookEvent::ExternalCancel {
                        order_id: order_id.clone(),
                    }
                }
            };
            if let ApplyOutcome::Applied { current, .. } = self.state.book.apply(event) {
                if current.is_terminal() {
                    info!("[RECONCILE] Order {} settled as {}", order_id, current);
                    self.settle_terminal(level);
                }
            }
        }

        self.state.suppressed.clear();
        self.run_pass("integrity poll").await?;
        self.state.last_reconciled = Some(Utc::now());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure handling and side effects
    // ------------------------------------------------------------------

    fn on_failure(&mut self, context: &str, e: GridError) {
        if e.is_fatal() {
            self.enter_degraded(&format!("{}: {}", context, e));
        } else {
            warn!("[RECONCILE] {} incomplete: {}. Retrying on the next poll.", context, e);
            self.state.mode = EngineMode::Synced;
            self.persist();
        }
    }

    fn enter_degraded(&mut self, reason: &str) {
        error!(
            "[DEGRADED] {}. Order placement halted; {} live orders left untouched. Reset required.",
            reason,
            self.state.book.live_orders().count()
        );
        self.state.mode = EngineMode::Degraded;
        self.notify(
            NotificationKind::Degraded,
            json!({
                "reason": reason,
                "live_orders": self.state.book.live_orders().count(),
            }),
        );
        self.persist();
    }

    fn notify(&self, kind: NotificationKind, payload: serde_json::Value) {
        self.notifier
            .notify(NotificationEvent::new(kind, &self.config.symbol, payload));
    }

    fn persist(&self) {
        self.persistence.save(self.state.snapshot(&self.config.symbol));
        if !self.persistence.is_healthy() {
            warn!("[PERSIST] Snapshots are not being written; a crash now loses state");
        }
    }

    fn log_status(&self) {
        let pos = &self.state.position;
        let mark = self.state.last_price.unwrap_or(self.state.anchor);
        let buys = self
            .state
            .book
            .live_orders()
            .filter(|o| o.side().is_buy())
            .count();
        let sells = self
            .state
            .book
            .live_orders()
            .filter(|o| o.side().is_sell())
            .count();
        info!("========================================");
        info!(
            "[STATUS] {} | {} | price {} | anchor {}",
            self.config.symbol, self.state.mode, mark, self.state.anchor
        );
        info!(
            "[STATUS] Orders: {} buys / {} sells / {} unknown | suppressed {}",
            buys,
            sells,
            self.state.book.unknown_count(),
            self.state.suppressed.len()
        );
        info!(
            "[STATUS] Inventory {} @ {} | realized {} | unrealized {} | round trips {}",
            pos.inventory,
            pos.avg_entry_price.round_dp(self.config.price_decimals),
            pos.realized_pnl,
            pos.unrealized_pnl(mark),
            pos.round_trips
        );
        if let Some(t) = self.state.last_reconciled {
            info!("[STATUS] Last reconciled {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        info!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::grid::RetryConfig;
    use crate::exchange::paper::{PaperExchange, PaperOp};
    use crate::exchange::ExchangeError;
    use crate::notify::testing::RecordingSink;
    use crate::persistence::testing::MemorySink;
    use rust_decimal_macros::dec;

    type TestEngine = ReconciliationEngine<PaperExchange, RecordingSink, MemorySink>;

    const SYMBOL: &str = "BNB/USDC";

    fn config() -> GridConfig {
        GridConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter_fraction: 0.0,
            },
            ..GridConfig::arithmetic(SYMBOL, dec!(500), dec!(600), dec!(10), dec!(0.01))
        }
    }

    struct Harness {
        engine: TestEngine,
        exchange: Arc<PaperExchange>,
        sink: RecordingSink,
        store: MemorySink,
    }

    fn harness_with(config: GridConfig, price: Decimal, store: MemorySink) -> Harness {
        let exchange = Arc::new(PaperExchange::new(SYMBOL, price));
        let sink = RecordingSink::default();
        let engine =
            ReconciliationEngine::new(config, exchange.clone(), sink.clone(), store.clone())
                .unwrap();
        Harness {
            engine,
            exchange,
            sink,
            store,
        }
    }

    async fn started(config: GridConfig, price: Decimal) -> Harness {
        let mut h = harness_with(config, price, MemorySink::default());
        h.engine.bootstrap().await.unwrap();
        h
    }

    fn order_at(engine: &TestEngine, level: i64) -> TrackedOrder {
        engine.state().book.get(level).cloned().unwrap()
    }

    fn filled(order: &TrackedOrder) -> EngineEvent {
        EngineEvent::Order(OrderEvent::StatusChanged {
            order_id: order.order_id.clone(),
            status: OrderStatus::Filled,
            filled_qty: order.intent.quantity,
        })
    }

    fn live_levels(engine: &TestEngine, side: OrderSide) -> Vec<i64> {
        engine
            .state()
            .book
            .live_orders()
            .filter(|o| o.side() == side)
            .map(|o| o.level())
            .collect()
    }

    #[tokio::test]
    async fn test_bootstrap_places_initial_grid() {
        let h = started(config(), dec!(550)).await;

        assert_eq!(h.engine.mode(), EngineMode::Synced);
        assert_eq!(live_levels(&h.engine, OrderSide::Buy), vec![0, 1, 2, 3]);
        assert_eq!(live_levels(&h.engine, OrderSide::Sell), vec![5, 6, 7, 8, 9]);
        assert!(h.engine.state().book.get(4).is_none());
        assert_eq!(h.exchange.resting_orders().await.len(), 9);
        assert_eq!(h.store.last().unwrap().orders.len(), 9);
        assert!(h.engine.state().last_reconciled.is_some());
    }

    #[tokio::test]
    async fn test_filled_buy_pairs_a_sell_one_level_up() {
        // Anchor 555 leaves 550 as the gap, so 540 carries a buy.
        let mut h = started(config(), dec!(555)).await;
        let buy = order_at(&h.engine, 4);
        assert_eq!(buy.price(), dec!(540));
        assert!(h.engine.state().book.get(5).is_none());
        let places_before = h.exchange.place_calls().await;

        h.exchange.fill_order(&buy.order_id, dec!(0.01)).await;
        h.engine.handle_event(filled(&buy)).await;

        assert_eq!(h.exchange.place_calls().await, places_before + 1);
        let sell = order_at(&h.engine, 5);
        assert_eq!(sell.side(), OrderSide::Sell);
        assert_eq!(sell.price(), dec!(550));
        assert_eq!(sell.intent.quantity, dec!(0.01));
        assert!(h.engine.state().book.get(4).is_none());
        assert!(!h.engine.state().layout.contains_key(&4));
        assert_eq!(h.sink.count(NotificationKind::FillExecuted), 1);
        assert_eq!(h.engine.state().position.inventory, dec!(0.01));

        // The same fill again changes nothing.
        h.engine.handle_event(filled(&buy)).await;
        assert_eq!(h.exchange.place_calls().await, places_before + 1);
        assert_eq!(h.sink.count(NotificationKind::FillExecuted), 1);
    }

    #[tokio::test]
    async fn test_filled_sell_pairs_a_buy_and_realizes_pnl() {
        let mut h = started(config(), dec!(550)).await;
        let buy = order_at(&h.engine, 3);
        h.exchange.fill_order(&buy.order_id, dec!(0.01)).await;
        h.engine.handle_event(filled(&buy)).await;

        // The buy at 530 paired into a sell at 540, which now fills.
        let sell = order_at(&h.engine, 4);
        assert_eq!(sell.side(), OrderSide::Sell);
        h.exchange.fill_order(&sell.order_id, dec!(0.01)).await;
        h.engine.handle_event(filled(&sell)).await;

        let rebuy = order_at(&h.engine, 3);
        assert_eq!(rebuy.side(), OrderSide::Buy);
        let pos = &h.engine.state().position;
        assert_eq!(pos.round_trips, 1);
        assert_eq!(pos.realized_pnl, dec!(0.1));
        assert_eq!(pos.inventory, dec!(0));
    }

    #[tokio::test]
    async fn test_pairing_onto_planned_level_is_suppressed() {
        let mut h = started(config(), dec!(550)).await;
        let top = order_at(&h.engine, 9);
        let places_before = h.exchange.place_calls().await;

        h.exchange.fill_order(&top.order_id, dec!(0.01)).await;
        h.engine.handle_event(filled(&top)).await;

        // Level 8 already carries a planned sell; nothing new goes out.
        assert_eq!(h.exchange.place_calls().await, places_before);
        assert!(h.engine.state().book.get(9).is_none());
        assert_eq!(h.engine.mode(), EngineMode::Synced);
    }

    #[tokio::test]
    async fn test_foreign_order_on_occupied_level_degrades() {
        let mut h = started(config(), dec!(550)).await;
        h.exchange
            .inject_foreign_order(OrderSide::Buy, dec!(520), dec!(0.01))
            .await;
        let places_before = h.exchange.place_calls().await;

        h.engine.handle_event(EngineEvent::IntegrityPoll).await;

        assert_eq!(h.engine.mode(), EngineMode::Degraded);
        assert_eq!(h.sink.count(NotificationKind::DriftDetected), 1);
        assert_eq!(h.sink.count(NotificationKind::Degraded), 1);
        assert_eq!(h.exchange.cancel_calls().await, 0);

        // Degraded halts placement but keeps tracking fills.
        let buy = order_at(&h.engine, 3);
        h.exchange.fill_order(&buy.order_id, dec!(0.01)).await;
        h.engine.handle_event(filled(&buy)).await;
        h.engine
            .handle_event(EngineEvent::Tick(PriceTick::new(dec!(700))))
            .await;
        h.engine.handle_event(EngineEvent::IntegrityPoll).await;
        assert_eq!(h.exchange.place_calls().await, places_before);
        assert_eq!(h.exchange.cancel_calls().await, 0);
        assert_eq!(h.engine.state().position.inventory, dec!(0.01));
        assert_eq!(h.sink.count(NotificationKind::DriftDetected), 1);
    }

    #[tokio::test]
    async fn test_foreign_order_on_vacant_level_is_ignored() {
        let mut h = started(config(), dec!(550)).await;
        // 540 is the spread gap.
        h.exchange
            .inject_foreign_order(OrderSide::Buy, dec!(540), dec!(0.01))
            .await;
        h.exchange
            .inject_foreign_order(OrderSide::Buy, dec!(523.5), dec!(0.01))
            .await;

        h.engine.handle_event(EngineEvent::IntegrityPoll).await;

        assert_eq!(h.engine.mode(), EngineMode::Synced);
        assert_eq!(h.sink.count(NotificationKind::DriftDetected), 0);
        assert_eq!(h.exchange.cancel_calls().await, 0);
    }

    #[tokio::test]
    async fn test_price_breakout_shifts_grid() {
        let mut h = started(config(), dec!(550)).await;

        h.engine
            .handle_event(EngineEvent::Tick(PriceTick::new(dec!(605))))
            .await;

        let state = h.engine.state();
        assert_eq!(state.offset, 5);
        assert_eq!(state.anchor, dec!(605));
        assert_eq!(state.levels.first().unwrap().price, dec!(550));
        assert_eq!(state.levels.last().unwrap().price, dec!(640));
        assert_eq!(live_levels(&h.engine, OrderSide::Buy), vec![5, 6, 7, 8, 9]);
        assert_eq!(live_levels(&h.engine, OrderSide::Sell), vec![11, 12, 13, 14]);
        assert!(state.book.orders().all(|o| o.level() >= 5));
        assert_eq!(h.exchange.cancel_calls().await, 9);
        assert_eq!(h.exchange.resting_orders().await.len(), 9);
        assert_eq!(h.sink.count(NotificationKind::GridShift), 1);
        assert_eq!(h.engine.mode(), EngineMode::Synced);
    }

    #[tokio::test]
    async fn test_no_threshold_shifts_only_on_breach() {
        let mut h = started(config(), dec!(550)).await;
        h.engine
            .handle_event(EngineEvent::Tick(PriceTick::new(dec!(590))))
            .await;
        assert_eq!(h.engine.state().offset, 0);
        assert_eq!(h.engine.state().anchor, dec!(550));
        assert_eq!(h.sink.count(NotificationKind::GridShift), 0);
    }

    #[tokio::test]
    async fn test_threshold_recentres_inside_bounds() {
        let config = GridConfig {
            recentre_threshold: Some(dec!(3)),
            ..config()
        };
        let mut h = started(config, dec!(550)).await;

        // 1.8% drift stays put.
        h.engine
            .handle_event(EngineEvent::Tick(PriceTick::new(dec!(560))))
            .await;
        assert_eq!(h.engine.state().offset, 0);

        // 3.6% drift recentres around 570.
        h.engine
            .handle_event(EngineEvent::Tick(PriceTick::new(dec!(570))))
            .await;
        assert_eq!(h.engine.state().offset, 2);
        assert_eq!(h.engine.state().anchor, dec!(570));
        assert_eq!(h.sink.count(NotificationKind::GridShift), 1);
        assert_eq!(h.engine.mode(), EngineMode::Synced);
    }

    #[tokio::test]
    async fn test_permanent_rejection_leaves_level_vacant_until_poll() {
        let mut h = harness_with(config(), dec!(550), MemorySink::default());
        h.exchange
            .fail_next(
                PaperOp::Place,
                ExchangeError::Permanent("insufficient balance".into()),
                1,
            )
            .await;
        h.engine.bootstrap().await.unwrap();

        assert_eq!(h.engine.mode(), EngineMode::Synced);
        assert_eq!(h.engine.state().book.live_orders().count(), 8);
        assert_eq!(h.engine.state().suppressed.len(), 1);
        assert_eq!(h.sink.count(NotificationKind::OrderRejected), 1);
        let vacant = *h.engine.state().suppressed.iter().next().unwrap();
        assert!(h.engine.state().book.get(vacant).is_none());

        // A fill elsewhere does not retry the rejected level.
        let top = *live_levels(&h.engine, OrderSide::Sell).last().unwrap();
        let sell = order_at(&h.engine, top);
        h.exchange.fill_order(&sell.order_id, dec!(0.01)).await;
        h.engine.handle_event(filled(&sell)).await;
        assert!(h.engine.state().book.get(vacant).is_none());

        h.engine.handle_event(EngineEvent::IntegrityPoll).await;
        assert!(h.engine.state().suppressed.is_empty());
        assert!(h.engine.state().book.is_occupied(vacant));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut h = harness_with(config(), dec!(550), MemorySink::default());
        h.exchange
            .fail_next(PaperOp::Place, ExchangeError::Transient("timeout".into()), 2)
            .await;
        h.engine.bootstrap().await.unwrap();

        assert_eq!(h.engine.mode(), EngineMode::Synced);
        assert_eq!(h.engine.state().book.live_orders().count(), 9);
        assert_eq!(h.exchange.place_calls().await, 11);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_degrades() {
        let config = GridConfig {
            max_retry_budget: 2,
            ..config()
        };
        let mut h = harness_with(config, dec!(550), MemorySink::default());
        h.exchange
            .fail_next(PaperOp::Place, ExchangeError::Transient("timeout".into()), 100)
            .await;
        h.engine.bootstrap().await.unwrap();

        assert_eq!(h.engine.mode(), EngineMode::Degraded);
        assert_eq!(h.sink.count(NotificationKind::Degraded), 1);
        assert_eq!(h.store.last().unwrap().mode, EngineMode::Degraded);
    }

    #[tokio::test]
    async fn test_external_cancel_is_replaced() {
        let mut h = started(config(), dec!(550)).await;
        let victim = order_at(&h.engine, 2);

        h.exchange.cancel_externally(&victim.order_id).await;
        h.engine
            .handle_event(EngineEvent::Order(OrderEvent::ExternalCancel {
                order_id: victim.order_id.clone(),
            }))
            .await;

        let replacement = order_at(&h.engine, 2);
        assert_ne!(replacement.order_id, victim.order_id);
        assert_eq!(replacement.side(), OrderSide::Buy);
        assert_eq!(replacement.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_reconnect_marks_unknown_then_restores() {
        let mut h = started(config(), dec!(550)).await;
        let places_before = h.exchange.place_calls().await;

        h.engine.handle_event(EngineEvent::StreamReconnected).await;

        assert_eq!(h.engine.state().book.unknown_count(), 0);
        assert_eq!(h.engine.state().book.live_orders().count(), 9);
        assert_eq!(h.exchange.place_calls().await, places_before);
        assert_eq!(h.exchange.cancel_calls().await, 0);
        assert_eq!(h.engine.mode(), EngineMode::Synced);
    }

    #[tokio::test]
    async fn test_poll_settles_fill_missed_by_stream() {
        let mut h = started(config(), dec!(550)).await;
        let buy = order_at(&h.engine, 3);
        h.exchange.fill_silently(&buy.order_id).await;

        h.engine.handle_event(EngineEvent::StreamReconnected).await;

        let sell = order_at(&h.engine, 4);
        assert_eq!(sell.side(), OrderSide::Sell);
        assert_eq!(sell.price(), dec!(540));
        assert!(h.engine.state().book.get(3).is_none());
        assert_eq!(h.sink.count(NotificationKind::FillExecuted), 1);
    }

    #[tokio::test]
    async fn test_stale_event_is_ignored() {
        let mut h = started(config(), dec!(550)).await;
        let buy = order_at(&h.engine, 1);
        h.engine
            .handle_event(EngineEvent::Order(OrderEvent::StatusChanged {
                order_id: buy.order_id.clone(),
                status: OrderStatus::Pending,
                filled_qty: Decimal::ZERO,
            }))
            .await;
        assert_eq!(order_at(&h.engine, 1).status, OrderStatus::Open);
        assert_eq!(h.engine.state().book.unknown_count(), 0);

        h.engine.handle_event(EngineEvent::IntegrityPoll).await;
        assert_eq!(order_at(&h.engine, 1).status, OrderStatus::Open);
        assert_eq!(h.exchange.cancel_calls().await, 0);
    }

    #[tokio::test]
    async fn test_partial_fill_survives_stale_open_and_polls() {
        let mut h = started(config(), dec!(550)).await;
        let buy = order_at(&h.engine, 3);
        let status_of = |engine: &TestEngine| {
            let o = order_at(engine, 3);
            (o.order_id, o.status, o.filled_qty)
        };

        // Stream-only progress; the exchange listing still reports plain Open.
        h.engine
            .handle_event(EngineEvent::Order(OrderEvent::StatusChanged {
                order_id: buy.order_id.clone(),
                status: OrderStatus::PartiallyFilled,
                filled_qty: dec!(0.004),
            }))
            .await;
        h.engine
            .handle_event(EngineEvent::Order(OrderEvent::StatusChanged {
                order_id: buy.order_id.clone(),
                status: OrderStatus::Open,
                filled_qty: Decimal::ZERO,
            }))
            .await;
        let expected = (buy.order_id.clone(), OrderStatus::PartiallyFilled, dec!(0.004));
        assert_eq!(status_of(&h.engine), expected);

        h.engine.handle_event(EngineEvent::IntegrityPoll).await;
        h.engine.handle_event(EngineEvent::IntegrityPoll).await;
        assert_eq!(status_of(&h.engine), expected);
        assert_eq!(h.engine.state().book.unknown_count(), 0);
        assert_eq!(h.engine.mode(), EngineMode::Synced);
        assert_eq!(h.exchange.cancel_calls().await, 0);
    }

    #[tokio::test]
    async fn test_reset_adopts_exchange_orders() {
        let mut h = started(config(), dec!(550)).await;
        let foreign = h
            .exchange
            .inject_foreign_order(OrderSide::Buy, dec!(520), dec!(0.01))
            .await;
        h.engine.handle_event(EngineEvent::IntegrityPoll).await;
        assert_eq!(h.engine.mode(), EngineMode::Degraded);

        // Operator clears the stray order, then resets.
        h.exchange.cancel_externally(&foreign).await;
        let places_before = h.exchange.place_calls().await;
        h.engine.handle_event(EngineEvent::Reset).await;

        assert_eq!(h.engine.mode(), EngineMode::Synced);
        assert_eq!(h.engine.state().book.live_orders().count(), 9);
        assert_eq!(h.exchange.place_calls().await, places_before);
    }

    #[tokio::test]
    async fn test_restart_restores_snapshot_without_replacing_orders() {
        let first = started(config(), dec!(550)).await;
        let snapshot = first.store.last().unwrap();
        let exchange = first.exchange.clone();
        let places_before = exchange.place_calls().await;

        let store = MemorySink::with_snapshot(snapshot);
        let mut engine = ReconciliationEngine::new(
            config(),
            exchange.clone(),
            RecordingSink::default(),
            store,
        )
        .unwrap();
        engine.bootstrap().await.unwrap();

        assert_eq!(engine.mode(), EngineMode::Synced);
        assert_eq!(engine.state().book.live_orders().count(), 9);
        assert_eq!(engine.state().book.unknown_count(), 0);
        assert_eq!(exchange.place_calls().await, places_before);
    }

    #[tokio::test]
    async fn test_restore_stays_initializing_until_poll_succeeds() {
        let first = started(config(), dec!(550)).await;
        let snapshot = first.store.last().unwrap();
        let exchange = first.exchange.clone();
        let places_before = exchange.place_calls().await;

        // Every attempt of the confirming poll fails.
        exchange
            .fail_next(
                PaperOp::OpenOrders,
                ExchangeError::Transient("connection reset".into()),
                3,
            )
            .await;
        let mut engine = ReconciliationEngine::new(
            config(),
            exchange.clone(),
            RecordingSink::default(),
            MemorySink::with_snapshot(snapshot),
        )
        .unwrap();

        let err = engine.bootstrap().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(engine.mode(), EngineMode::Initializing);
        assert_eq!(engine.state().book.unknown_count(), 9);
        assert_eq!(exchange.place_calls().await, places_before);
        assert_eq!(exchange.cancel_calls().await, 0);

        engine.bootstrap().await.unwrap();
        assert_eq!(engine.mode(), EngineMode::Synced);
        assert_eq!(engine.state().book.unknown_count(), 0);
        assert_eq!(engine.state().book.live_orders().count(), 9);
        assert!(engine.state().last_reconciled.is_some());
        assert_eq!(exchange.place_calls().await, places_before);
    }

    #[tokio::test]
    async fn test_fill_without_quantity_is_audited_at_order_size() {
        let dir = tempfile::tempdir().unwrap();
        let logger = OrderAuditLogger::new(dir.path().to_str().unwrap()).unwrap();
        let mut h = harness_with(config(), dec!(550), MemorySink::default());
        h.engine = h.engine.with_audit_logger(Some(logger));
        h.engine.bootstrap().await.unwrap();
        let buy = order_at(&h.engine, 3);

        h.exchange.fill_order(&buy.order_id, dec!(0.01)).await;
        h.engine
            .handle_event(EngineEvent::Order(OrderEvent::StatusChanged {
                order_id: buy.order_id.clone(),
                status: OrderStatus::Filled,
                filled_qty: Decimal::ZERO,
            }))
            .await;

        assert_eq!(h.engine.state().position.inventory, dec!(0.01));
        let content = std::fs::read_to_string(dir.path().join("trades.csv")).unwrap();
        let fill = content
            .lines()
            .find(|l| l.contains(",FILL,"))
            .unwrap();
        assert!(fill.contains(",FILL,3,Buy,530,0.01,"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_without_new_passes() {
        let mut h = started(config(), dec!(550)).await;
        let buy = order_at(&h.engine, 3);
        let places_before = h.exchange.place_calls().await;

        let (tx, rx) = mpsc::channel(8);
        tx.send(EngineEvent::Shutdown).await.unwrap();
        tx.send(filled(&buy)).await.unwrap();
        tx.send(EngineEvent::Tick(PriceTick::new(dec!(700))))
            .await
            .unwrap();
        h.engine.run(rx).await.unwrap();

        assert_eq!(h.engine.state().position.inventory, dec!(0.01));
        assert_eq!(h.engine.state().offset, 0);
        assert_eq!(h.exchange.place_calls().await, places_before);
        assert!(tx.is_closed());
    }
}

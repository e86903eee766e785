//! Local view of which order rests on which grid level.

use crate::grid::GridLevel;
use crate::model::{Cloid, OrderId, OrderIntent, OrderSide, OrderStatus, TrackedOrder};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// What the engine wants resting on one level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesiredOrder {
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    Submitted {
        intent: OrderIntent,
        order_id: OrderId,
        status: OrderStatus,
        filled_qty: Decimal,
    },
    StatusChanged {
        order_id: OrderId,
        status: OrderStatus,
        filled_qty: Decimal,
    },
    ExternalCancel {
        order_id: OrderId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        level: i64,
        previous: OrderStatus,
        current: OrderStatus,
    },
    /// Same or older news; nothing changed.
    Duplicate,
    /// A terminal order reported live, or two different terminal outcomes;
    /// the order is now `Unknown`.
    Regressed { level: i64 },
    /// No record of this order id.
    Untracked,
    /// A live order already holds the level.
    Occupied { level: i64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookDiff {
    pub to_cancel: Vec<TrackedOrder>,
    pub to_place: Vec<OrderIntent>,
}

impl BookDiff {
    pub fn is_empty(&self) -> bool {
        self.to_cancel.is_empty() && self.to_place.is_empty()
    }
}

/// Retired order ids kept to swallow late events. Older ids are forgotten
/// first; by then the integrity poll has long settled them.
pub const REMEMBERED_IDS: usize = 4096;

#[derive(Debug, Clone)]
pub struct OrderBook {
    orders: BTreeMap<i64, TrackedOrder>,
    by_id: HashMap<OrderId, i64>,
    completed: HashSet<OrderId>,
    completed_order: VecDeque<OrderId>,
    capacity: usize,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::with_capacity(REMEMBERED_IDS)
    }
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book remembering at most `capacity` retired order ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            orders: BTreeMap::new(),
            by_id: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            capacity,
        }
    }

    pub fn get(&self, level: i64) -> Option<&TrackedOrder> {
        self.orders.get(&level)
    }

    pub fn find(&self, order_id: &OrderId) -> Option<&TrackedOrder> {
        self.by_id.get(order_id).and_then(|l| self.orders.get(l))
    }

    pub fn is_completed(&self, order_id: &OrderId) -> bool {
        self.completed.contains(order_id)
    }

    /// A non-terminal order (including `Unknown`) holds the level.
    pub fn is_occupied(&self, level: i64) -> bool {
        self.orders
            .get(&level)
            .map(|o| o.status.is_live())
            .unwrap_or(false)
    }

    pub fn orders(&self) -> impl Iterator<Item = &TrackedOrder> {
        self.orders.values()
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &TrackedOrder> {
        self.orders.values().filter(|o| o.status.is_live())
    }

    pub fn unknown_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Unknown)
            .count()
    }

    /// Orders to cancel and intents to place so the book matches `desired`.
    ///
    /// `Unknown` orders are never cancelled and keep their level occupied.
    pub fn diff(&self, levels: &[GridLevel], desired: &BTreeMap<i64, DesiredOrder>) -> BookDiff {
        let active: HashSet<i64> = levels.iter().map(|l| l.index).collect();
        let mut diff = BookDiff::default();
        let mut vacating = HashSet::new();

        for order in self.live_orders() {
            if order.status == OrderStatus::Unknown {
                continue;
            }
            let level = order.level();
            let keep = active.contains(&level)
                && desired
                    .get(&level)
                    .map(|d| order.intent.matches(d.side, d.price))
                    .unwrap_or(false);
            if !keep {
                vacating.insert(level);
                diff.to_cancel.push(order.clone());
            }
        }

        for (level, want) in desired {
            if !active.contains(level) {
                continue;
            }
            if self.is_occupied(*level) && !vacating.contains(level) {
                continue;
            }
            diff.to_place.push(OrderIntent {
                level: *level,
                side: want.side,
                price: want.price,
                quantity: want.quantity,
                cloid: Cloid::new(),
            });
        }

        diff
    }

    pub fn apply(&mut self, event: BookEvent) -> ApplyOutcome {
        match event {
            BookEvent::Submitted {
                intent,
                order_id,
                status,
                filled_qty,
            } => self.insert(TrackedOrder {
                intent,
                order_id,
                status,
                filled_qty,
            }),
            BookEvent::StatusChanged {
                order_id,
                status,
                filled_qty,
            } => self.transition(&order_id, status, Some(filled_qty)),
            BookEvent::ExternalCancel { order_id } => {
                self.transition(&order_id, OrderStatus::Cancelled, None)
            }
        }
    }

    /// Tracks an order, replacing a terminal record on the same level.
    pub fn insert(&mut self, order: TrackedOrder) -> ApplyOutcome {
        if self.by_id.contains_key(&order.order_id) || self.completed.contains(&order.order_id) {
            return ApplyOutcome::Duplicate;
        }
        let level = order.level();
        if self.is_occupied(level) {
            return ApplyOutcome::Occupied { level };
        }
        if let Some(old) = self.orders.remove(&level) {
            self.by_id.remove(&old.order_id);
            self.remember(old.order_id);
        }

        let current = order.status;
        self.by_id.insert(order.order_id.clone(), level);
        self.orders.insert(level, order);
        ApplyOutcome::Applied {
            level,
            previous: OrderStatus::Pending,
            current,
        }
    }

    fn transition(
        &mut self,
        order_id: &OrderId,
        status: OrderStatus,
        filled_qty: Option<Decimal>,
    ) -> ApplyOutcome {
        if self.completed.contains(order_id) {
            return ApplyOutcome::Duplicate;
        }
        let Some(level) = self.by_id.get(order_id).copied() else {
            return ApplyOutcome::Untracked;
        };
        let Some(order) = self.orders.get_mut(&level) else {
            return ApplyOutcome::Untracked;
        };

        let previous = order.status;
        let filled_qty = filled_qty.unwrap_or(order.filled_qty);

        // An authoritative status resolves an Unknown order whatever it is.
        if previous == OrderStatus::Unknown {
            if status == OrderStatus::Unknown {
                return ApplyOutcome::Duplicate;
            }
            order.status = status;
            order.filled_qty = order.filled_qty.max(filled_qty);
            return ApplyOutcome::Applied {
                level,
                previous,
                current: status,
            };
        }

        let (Some(old_rank), Some(new_rank)) = (previous.rank(), status.rank()) else {
            order.status = OrderStatus::Unknown;
            return ApplyOutcome::Regressed { level };
        };

        if new_rank > old_rank {
            order.status = status;
            order.filled_qty = order.filled_qty.max(filled_qty);
            return ApplyOutcome::Applied {
                level,
                previous,
                current: status,
            };
        }

        if new_rank < old_rank {
            // Older news about a live order is stale. A terminal order
            // reported live again is a contradiction.
            if previous.is_live() {
                return ApplyOutcome::Duplicate;
            }
            order.status = OrderStatus::Unknown;
            return ApplyOutcome::Regressed { level };
        }

        // Same rank.
        if previous != status {
            // Two different terminal outcomes for one order.
            order.status = OrderStatus::Unknown;
            return ApplyOutcome::Regressed { level };
        }
        if status == OrderStatus::PartiallyFilled && filled_qty > order.filled_qty {
            order.filled_qty = filled_qty;
            return ApplyOutcome::Applied {
                level,
                previous,
                current: status,
            };
        }
        ApplyOutcome::Duplicate
    }

    /// Drops a terminal order from its level. Late events for it stay no-ops.
    pub fn retire(&mut self, level: i64) -> Option<TrackedOrder> {
        match self.orders.get(&level) {
            Some(o) if o.status.is_terminal() => {}
            _ => return None,
        }
        let order = self.orders.remove(&level)?;
        self.by_id.remove(&order.order_id);
        self.remember(order.order_id.clone());
        Some(order)
    }

    fn remember(&mut self, order_id: OrderId) {
        if self.capacity == 0 || !self.completed.insert(order_id.clone()) {
            return;
        }
        self.completed_order.push_back(order_id);
        while self.completed_order.len() > self.capacity {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }

    pub fn mark_unknown(&mut self, level: i64) -> bool {
        match self.orders.get_mut(&level) {
            Some(o) if o.status.is_live() => {
                o.status = OrderStatus::Unknown;
                true
            }
            _ => false,
        }
    }

    /// Marks every live order `Unknown`. Returns how many were marked.
    pub fn mark_all_unknown(&mut self) -> usize {
        let mut marked = 0;
        for order in self.orders.values_mut() {
            if order.status.is_live() && order.status != OrderStatus::Unknown {
                order.status = OrderStatus::Unknown;
                marked += 1;
            }
        }
        marked
    }

    /// Forgets every order, remembered ids included.
    pub fn clear(&mut self) {
        self.orders.clear();
        self.by_id.clear();
        self.completed.clear();
        self.completed_order.clear();
    }
}

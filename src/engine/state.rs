use crate::engine::order_book::{DesiredOrder, OrderBook};
use crate::grid::{GridLevel, Layout};
use crate::model::{OrderSide, TrackedOrder};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Initializing,
    Synced,
    Reconciling,
    /// Placement halted until an operator reset.
    Degraded,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineMode::Initializing => "INITIALIZING",
            EngineMode::Synced => "SYNCED",
            EngineMode::Reconciling => "RECONCILING",
            EngineMode::Degraded => "DEGRADED",
        };
        write!(f, "{}", s)
    }
}

/// Inventory and PnL accumulated from fills.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionStats {
    pub inventory: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub round_trips: u32,
    pub buy_fills: u32,
    pub sell_fills: u32,
}

impl PositionStats {
    /// Books a fill. Returns the PnL it realized.
    pub fn record_fill(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) -> Decimal {
        match side {
            OrderSide::Buy => {
                // Weighted Average Cost Basis
                let new_inventory = self.inventory + quantity;
                if new_inventory > Decimal::ZERO {
                    self.avg_entry_price = (self.avg_entry_price * self.inventory
                        + price * quantity)
                        / new_inventory;
                }
                self.inventory = new_inventory;
                self.buy_fills += 1;
                Decimal::ZERO
            }
            OrderSide::Sell => {
                let covered = quantity.min(self.inventory).max(Decimal::ZERO);
                let pnl = (price - self.avg_entry_price) * covered;
                self.realized_pnl += pnl;
                self.inventory = (self.inventory - quantity).max(Decimal::ZERO);
                if self.inventory.is_zero() {
                    self.avg_entry_price = Decimal::ZERO;
                }
                self.sell_fills += 1;
                if covered > Decimal::ZERO {
                    self.round_trips += 1;
                }
                pnl
            }
        }
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        if self.inventory > Decimal::ZERO && self.avg_entry_price > Decimal::ZERO {
            (mark - self.avg_entry_price) * self.inventory
        } else {
            Decimal::ZERO
        }
    }
}

/// Everything the engine owns. Mutated only by the engine loop.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub mode: EngineMode,
    pub anchor: Decimal,
    /// Global index of the lowest active level.
    pub offset: i64,
    pub levels: Vec<GridLevel>,
    pub layout: Layout,
    pub book: OrderBook,
    /// Levels left vacant after a permanent failure, until the next integrity poll.
    pub suppressed: BTreeSet<i64>,
    pub position: PositionStats,
    pub last_price: Option<Decimal>,
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            mode: EngineMode::Initializing,
            anchor: Decimal::ZERO,
            offset: 0,
            levels: Vec::new(),
            layout: Layout::new(),
            book: OrderBook::new(),
            suppressed: BTreeSet::new(),
            position: PositionStats::default(),
            last_price: None,
            last_reconciled: None,
        }
    }

    pub fn level(&self, index: i64) -> Option<&GridLevel> {
        self.levels.iter().find(|l| l.index == index)
    }

    pub fn is_active(&self, index: i64) -> bool {
        self.level(index).is_some()
    }

    /// Orders the layout asks for, minus suppressed levels.
    pub fn desired(&self, quantity: Decimal) -> BTreeMap<i64, DesiredOrder> {
        self.layout
            .iter()
            .filter(|(index, _)| !self.suppressed.contains(index))
            .filter_map(|(index, side)| {
                self.level(*index).map(|l| {
                    (
                        *index,
                        DesiredOrder {
                            side: *side,
                            price: l.price,
                            quantity,
                        },
                    )
                })
            })
            .collect()
    }

    pub fn snapshot(&self, symbol: &str) -> EngineSnapshot {
        EngineSnapshot {
            symbol: symbol.to_string(),
            mode: self.mode,
            anchor: self.anchor,
            offset: self.offset,
            layout: self.layout.clone(),
            orders: self.book.orders().cloned().collect(),
            position: self.position.clone(),
            last_reconciled: self.last_reconciled,
            saved_at: Utc::now(),
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted form of the engine state, written after every settled pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub symbol: String,
    pub mode: EngineMode,
    pub anchor: Decimal,
    pub offset: i64,
    pub layout: Layout,
    pub orders: Vec<TrackedOrder>,
    pub position: PositionStats,
    pub last_reconciled: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_weighted_average_and_pnl() {
        let mut pos = PositionStats::default();
        pos.record_fill(OrderSide::Buy, dec!(10), dec!(100));
        assert_eq!(pos.inventory, dec!(10));
        assert_eq!(pos.avg_entry_price, dec!(100));

        pos.record_fill(OrderSide::Buy, dec!(10), dec!(110));
        assert_eq!(pos.inventory, dec!(20));
        assert_eq!(pos.avg_entry_price, dec!(105)); // (10*100 + 10*110) / 20

        let pnl = pos.record_fill(OrderSide::Sell, dec!(5), dec!(120));
        assert_eq!(pnl, dec!(75));
        assert_eq!(pos.inventory, dec!(15));
        assert_eq!(pos.avg_entry_price, dec!(105)); // Stays same on sell
        assert_eq!(pos.round_trips, 1);
        assert_eq!(pos.unrealized_pnl(dec!(110)), dec!(75));
    }

    #[test]
    fn test_sell_without_inventory_realizes_nothing() {
        let mut pos = PositionStats::default();
        let pnl = pos.record_fill(OrderSide::Sell, dec!(1), dec!(550));
        assert_eq!(pnl, dec!(0));
        assert_eq!(pos.inventory, dec!(0));
        assert_eq!(pos.round_trips, 0);
    }

    #[test]
    fn test_snapshot_roundtrips_through_json() {
        let mut state = EngineState::new();
        state.anchor = dec!(550);
        state.layout.insert(-2, OrderSide::Buy);
        state.layout.insert(5, OrderSide::Sell);
        let snap = state.snapshot("BNB/USDC");

        let json = serde_json::to_string(&snap).unwrap();
        let back: EngineSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}

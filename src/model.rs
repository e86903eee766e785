use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, OrderSide::Sell)
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

/// Client order id the engine tags every order with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cloid(uuid::Uuid);

impl Cloid {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }

    /// Parses the `0x`-prefixed hex form exchanges echo back.
    pub fn from_hex_str(s: &str) -> Option<Self> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        u128::from_str_radix(hex, 16)
            .ok()
            .map(|v| Self(uuid::Uuid::from_u128(v)))
    }
}

impl Default for Cloid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Cloid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.0.simple())
    }
}

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OrderId {
    fn from(oid: u64) -> Self {
        Self(oid.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    /// Local certainty lost; must be confirmed against the exchange.
    Unknown,
}

impl OrderStatus {
    /// Position in the lifecycle ordering. `Unknown` sits outside it.
    pub fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Open => Some(1),
            OrderStatus::PartiallyFilled => Some(2),
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => Some(3),
            OrderStatus::Unknown => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// An order the engine wants resting on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub level: i64,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub cloid: Cloid,
}

impl OrderIntent {
    /// Same resting order on the book, regardless of client id and size.
    pub fn matches(&self, side: OrderSide, price: Decimal) -> bool {
        self.side == side && self.price == price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub intent: OrderIntent,
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
}

impl TrackedOrder {
    pub fn level(&self) -> i64 {
        self.intent.level
    }

    pub fn side(&self) -> OrderSide {
        self.intent.side
    }

    pub fn price(&self) -> Decimal {
        self.intent.price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(OrderStatus::Pending.rank() < OrderStatus::Open.rank());
        assert!(OrderStatus::Open.rank() < OrderStatus::PartiallyFilled.rank());
        assert_eq!(OrderStatus::Filled.rank(), OrderStatus::Cancelled.rank());
        assert_eq!(OrderStatus::Unknown.rank(), None);
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Unknown.is_live());
    }

    #[test]
    fn test_cloid_hex_roundtrip() {
        let cloid = Cloid::new();
        let parsed = Cloid::from_hex_str(&cloid.to_string()).unwrap();
        assert_eq!(cloid, parsed);
        assert!(Cloid::from_hex_str("0xnothex").is_none());
    }
}

//! Exchange abstraction the engine drives.
//!
//! Adapters translate their wire-level failures into [`ExchangeError`] so the
//! engine can decide between retrying and giving a level up.

pub mod hyperliquid;
pub mod paper;

use crate::model::{Cloid, OrderId, OrderSide, OrderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Network, timeout or rate limit. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Invalid price, insufficient balance, rejection. Retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    /// Classifies a raw error message from an exchange or HTTP client.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();

        if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns")
            || lower.contains("unreachable")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
        {
            return ExchangeError::Transient(msg);
        }

        if lower.contains("insufficient")
            || lower.contains("balance")
            || lower.contains("not enough")
            || lower.contains("invalid")
            || lower.contains("tick size")
            || lower.contains("minimum")
            || lower.contains("reject")
            || lower.contains("not allowed")
            || lower.contains("auth")
            || lower.contains("signature")
        {
            return ExchangeError::Permanent(msg);
        }

        // Unclassified failures are retried; the retry budget bounds the cost.
        ExchangeError::Transient(msg)
    }
}

/// Top of book plus last trade as the exchange reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub cloid: Cloid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
}

/// An order as the exchange currently sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub order_id: OrderId,
    pub cloid: Option<Cloid>,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_qty: Decimal,
    pub status: OrderStatus,
}

/// Asynchronous order update pushed by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    StatusChanged {
        order_id: OrderId,
        status: OrderStatus,
        filled_qty: Decimal,
    },
    ExternalCancel {
        order_id: OrderId,
    },
}

impl OrderEvent {
    pub fn order_id(&self) -> &OrderId {
        match self {
            OrderEvent::StatusChanged { order_id, .. } => order_id,
            OrderEvent::ExternalCancel { order_id } => order_id,
        }
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange name (e.g. "hyperliquid", "paper")
    fn name(&self) -> &str;

    async fn get_ticker(&self, symbol: &str) -> Result<Quote, ExchangeError>;

    async fn place_order(&self, req: &PlaceOrder) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> Result<(), ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// `None` when the exchange has no record of the order.
    async fn order_status(
        &self,
        symbol: &str,
        order_id: &OrderId,
    ) -> Result<Option<ExchangeOrder>, ExchangeError>;

    /// Opens a fresh order-event stream. The stream ends on disconnect and the
    /// caller reopens it.
    async fn stream_order_events(
        &self,
        symbol: &str,
    ) -> Result<BoxStream<'static, OrderEvent>, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ExchangeError::from_message("Connection reset by peer").is_retryable());
        assert!(ExchangeError::from_message("HTTP 429 Too Many Requests").is_retryable());
        assert!(ExchangeError::from_message("request timed out").is_retryable());
        assert!(!ExchangeError::from_message("Insufficient spot balance").is_retryable());
        assert!(!ExchangeError::from_message("Order has invalid price").is_retryable());
        assert!(!ExchangeError::from_message("Order rejected: post only").is_retryable());
        assert!(ExchangeError::from_message("something odd").is_retryable());
    }
}

//! Price and order-event intake.
//!
//! Both tasks only enqueue [`EngineEvent`]s; the engine loop is the single
//! writer of state.

use crate::constants::{
    EXCHANGE_CALL_TIMEOUT, MAX_QUOTE_AGE, PRICE_POLL_INTERVAL, STREAM_IDLE_TIMEOUT,
    STREAM_RECONNECT_DELAY, STREAM_RECONNECT_MAX_DELAY,
};
use crate::engine::EngineEvent;
use crate::exchange::{Exchange, Quote};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One normalized price observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTick {
    pub price: Decimal,
    /// Exchange time, never earlier than the previous tick's.
    pub timestamp: DateTime<Utc>,
    /// Local receive time.
    pub monotonic: Instant,
}

impl PriceTick {
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
            monotonic: Instant::now(),
        }
    }
}

/// Turns raw quotes into ticks: mid of bid/ask when both are usable, else the
/// last trade. Crossed, non-positive, stale and out-of-order quotes are dropped.
#[derive(Debug, Clone)]
pub struct PriceNormalizer {
    max_age: chrono::Duration,
    last_timestamp: Option<DateTime<Utc>>,
}

impl PriceNormalizer {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age: chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX),
            last_timestamp: None,
        }
    }

    pub fn normalize(&mut self, quote: &Quote) -> Option<PriceTick> {
        self.normalize_at(quote, Utc::now())
    }

    fn normalize_at(&mut self, quote: &Quote, now: DateTime<Utc>) -> Option<PriceTick> {
        if now - quote.timestamp > self.max_age {
            debug!("[FEED] Dropping stale quote from {}", quote.timestamp);
            return None;
        }
        if let Some(last) = self.last_timestamp {
            if quote.timestamp < last {
                debug!("[FEED] Dropping out-of-order quote from {}", quote.timestamp);
                return None;
            }
        }

        let price = match (quote.bid, quote.ask) {
            (Some(bid), Some(ask)) if bid > Decimal::ZERO && ask > Decimal::ZERO => {
                if bid > ask {
                    warn!("[FEED] Crossed quote bid {} > ask {}; dropped", bid, ask);
                    return None;
                }
                (bid + ask) / Decimal::TWO
            }
            _ => quote.last?,
        };
        if price <= Decimal::ZERO {
            warn!("[FEED] Non-positive price {}; dropped", price);
            return None;
        }

        self.last_timestamp = Some(quote.timestamp);
        Some(PriceTick {
            price,
            timestamp: quote.timestamp,
            monotonic: Instant::now(),
        })
    }
}

impl Default for PriceNormalizer {
    fn default() -> Self {
        Self::new(MAX_QUOTE_AGE)
    }
}

/// Polls the ticker and enqueues ticks until the engine queue closes.
pub struct PriceFeed<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    symbol: String,
    tx: mpsc::Sender<EngineEvent>,
    interval: Duration,
    timeout: Duration,
    normalizer: PriceNormalizer,
}

impl<E: Exchange + ?Sized> PriceFeed<E> {
    pub fn new(exchange: Arc<E>, symbol: &str, tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
            tx,
            interval: PRICE_POLL_INTERVAL,
            timeout: EXCHANGE_CALL_TIMEOUT,
            normalizer: PriceNormalizer::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(mut self) {
        info!("[FEED] Polling {} ticker every {:?}", self.symbol, self.interval);
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.tx.closed() => break,
                _ = timer.tick() => {}
            }

            let quote =
                match tokio::time::timeout(self.timeout, self.exchange.get_ticker(&self.symbol))
                    .await
                {
                    Ok(Ok(q)) => q,
                    Ok(Err(e)) => {
                        warn!("[FEED] Ticker fetch failed: {}", e);
                        continue;
                    }
                    Err(_) => {
                        warn!("[FEED] Ticker fetch timed out after {:?}", self.timeout);
                        continue;
                    }
                };

            let Some(tick) = self.normalizer.normalize(&quote) else {
                continue;
            };
            // A newer tick follows shortly; dropping one under load is harmless.
            match self.tx.try_send(EngineEvent::Tick(tick)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("[FEED] Engine queue full; tick dropped"),
                Err(TrySendError::Closed(_)) => break,
            }
        }
        info!("[FEED] Price feed stopped.");
    }
}

/// Forwards exchange order events, reopening the stream with backoff. Every
/// reopen is announced so the engine can re-verify its orders.
pub struct OrderEventListener<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    symbol: String,
    tx: mpsc::Sender<EngineEvent>,
    base_delay: Duration,
    max_delay: Duration,
    idle_timeout: Duration,
}

impl<E: Exchange + ?Sized> OrderEventListener<E> {
    pub fn new(exchange: Arc<E>, symbol: &str, tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
            tx,
            base_delay: STREAM_RECONNECT_DELAY,
            max_delay: STREAM_RECONNECT_MAX_DELAY,
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }

    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub async fn run(self) {
        let mut connected_before = false;
        let mut delay = self.base_delay;

        loop {
            if self.tx.is_closed() {
                break;
            }
            match self.exchange.stream_order_events(&self.symbol).await {
                Ok(mut stream) => {
                    info!("[STREAM] Order-event stream open for {}", self.symbol);
                    delay = self.base_delay;
                    if connected_before
                        && self.tx.send(EngineEvent::StreamReconnected).await.is_err()
                    {
                        break;
                    }
                    connected_before = true;

                    loop {
                        let next = tokio::select! {
                            _ = self.tx.closed() => return,
                            next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
                        };
                        match next {
                            Ok(Some(event)) => {
                                if self.tx.send(EngineEvent::Order(event)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {
                                warn!("[STREAM] Order-event stream closed by exchange");
                                break;
                            }
                            Err(_) => {
                                warn!(
                                    "[STREAM] No order events for {:?}; reopening",
                                    self.idle_timeout
                                );
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[STREAM] Failed to open order-event stream: {}", e);
                }
            }

            debug!("[STREAM] Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.tx.closed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.max_delay);
        }
        info!("[STREAM] Order-event listener stopped.");
    }
}

//! Live adapter over the Hyperliquid SDK.

use super::{Exchange, ExchangeError, ExchangeOrder, OrderEvent, PlaceOrder, PlacedOrder, Quote};
use crate::config::exchange::ExchangeConfig;
use crate::model::{Cloid, OrderId, OrderSide, OrderStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H160;
use futures_util::stream::{self, BoxStream, StreamExt};
use hyperliquid_rust_sdk::{
    BaseUrl, ClientCancelRequest, ClientLimit, ClientOrder, ClientOrderRequest, ExchangeClient,
    ExchangeDataStatus, ExchangeResponseStatus, InfoClient, Message, Subscription, UserData,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MarketMeta {
    pub symbol: String,
    /// API identifier
    pub coin: String,
    pub sz_decimals: u32,
    pub price_decimals: u32,
}

fn base_url(network: &str) -> BaseUrl {
    if network == "mainnet" {
        BaseUrl::Mainnet
    } else {
        BaseUrl::Testnet
    }
}

fn sdk_err(e: impl std::fmt::Display) -> ExchangeError {
    ExchangeError::from_message(e.to_string())
}

fn parse_decimal(raw: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw)
        .map_err(|e| ExchangeError::Permanent(format!("malformed decimal '{}': {}", raw, e)))
}

fn parse_oid(order_id: &OrderId) -> Result<u64, ExchangeError> {
    order_id
        .as_str()
        .parse()
        .map_err(|_| ExchangeError::Permanent(format!("malformed oid {}", order_id)))
}

fn parse_side(raw: &str) -> OrderSide {
    // 'B' (Bid) = Buy, 'A' (Ask) = Sell
    if raw.to_uppercase().starts_with('B') {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

fn parse_status(raw: &str, remaining: Decimal, original: Decimal) -> OrderStatus {
    match raw {
        "open" if remaining < original => OrderStatus::PartiallyFilled,
        "open" | "triggered" => OrderStatus::Open,
        "filled" => OrderStatus::Filled,
        "rejected" => OrderStatus::Rejected,
        s if s.to_lowercase().contains("cancel") => OrderStatus::Cancelled,
        _ => OrderStatus::Unknown,
    }
}

/// Spot and perp metadata, keyed by display symbol.
async fn load_metadata(info_client: &mut InfoClient) -> Result<HashMap<String, MarketMeta>> {
    info!("Fetching market metadata...");
    let mut markets = HashMap::new();

    match info_client.spot_meta().await {
        Ok(spot_meta) => {
            let index_to_token: HashMap<_, _> =
                spot_meta.tokens.iter().map(|t| (t.index, t)).collect();
            for asset in spot_meta.universe {
                if asset.tokens.len() < 2 {
                    continue;
                }
                if let (Some(base), Some(quote)) = (
                    index_to_token.get(&asset.tokens[0]),
                    index_to_token.get(&asset.tokens[1]),
                ) {
                    let symbol = format!("{}/{}", base.name, quote.name);
                    let sz_decimals = base.sz_decimals as u32;
                    markets.insert(
                        symbol.clone(),
                        MarketMeta {
                            symbol,
                            coin: asset.name.clone(),
                            sz_decimals,
                            price_decimals: 8u32.saturating_sub(sz_decimals),
                        },
                    );
                }
            }
        }
        Err(e) => warn!("Failed to fetch spot metadata: {}", e),
    }

    match info_client.meta().await {
        Ok(meta) => {
            for asset in meta.universe {
                let sz_decimals = asset.sz_decimals;
                markets.insert(
                    asset.name.clone(),
                    MarketMeta {
                        symbol: asset.name.clone(),
                        coin: asset.name,
                        sz_decimals,
                        price_decimals: 6u32.saturating_sub(sz_decimals),
                    },
                );
            }
        }
        Err(e) => warn!("Failed to fetch perp metadata: {}", e),
    }

    Ok(markets)
}

pub struct HyperliquidExchange {
    network: String,
    user: H160,
    market: MarketMeta,
    info: Mutex<InfoClient>,
    exchange: ExchangeClient,
    /// Kept alive for the current event stream; replacing it ends the old one.
    stream_client: Mutex<Option<InfoClient>>,
    /// Original size and accumulated fills per oid, to turn fills into statuses.
    fills: Arc<Mutex<HashMap<u64, (Decimal, Decimal)>>>,
}

impl HyperliquidExchange {
    pub async fn connect(config: &ExchangeConfig, symbol: &str) -> Result<Self> {
        let wallet: LocalWallet = config
            .private_key
            .parse()
            .map_err(|e| anyhow!("Invalid private key: {}", e))?;
        let user = match &config.account_address {
            Some(addr) => {
                H160::from_str(addr).map_err(|e| anyhow!("Invalid account address: {}", e))?
            }
            None => wallet.address(),
        };

        info!("Connecting to InfoClient...");
        let mut info = InfoClient::with_reconnect(None, Some(base_url(&config.network)))
            .await
            .map_err(|e| anyhow!("Failed to connect InfoClient: {}", e))?;

        info!("Connecting to ExchangeClient...");
        info!("Using Agent Wallet to trade for Account: {:?}", user);
        let exchange = ExchangeClient::new(None, wallet, Some(base_url(&config.network)), None, None)
            .await
            .map_err(|e| anyhow!("Failed to connect ExchangeClient: {}", e))?;

        let markets = load_metadata(&mut info).await?;
        let market = markets.get(symbol).cloned().ok_or_else(|| {
            anyhow!(
                "Critical Error: Metadata for symbol '{}' not found. Please check your configuration.",
                symbol
            )
        })?;
        info!(
            "Metadata loaded for {} (coin {}, {} size decimals, {} price decimals).",
            symbol, market.coin, market.sz_decimals, market.price_decimals
        );

        Ok(Self {
            network: config.network.clone(),
            user,
            market,
            info: Mutex::new(info),
            exchange,
            stream_client: Mutex::new(None),
            fills: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        if symbol == self.market.symbol {
            Ok(())
        } else {
            Err(ExchangeError::Permanent(format!("unknown symbol {}", symbol)))
        }
    }

    fn to_f64(value: Decimal) -> Result<f64, ExchangeError> {
        value
            .to_f64()
            .ok_or_else(|| ExchangeError::Permanent(format!("{} does not fit f64", value)))
    }
}

/// Turns one websocket message into order events for `coin`.
/// Adds a fill to the running total for `oid`. A completed order's entry is
/// dropped so the map only holds orders that can still fill.
fn record_fill(
    fills: &mut HashMap<u64, (Decimal, Decimal)>,
    oid: u64,
    sz: Decimal,
) -> (OrderStatus, Decimal) {
    let Some((original, filled)) = fills.get_mut(&oid) else {
        // Placed before this process started; the integrity poll settles
        // the final status.
        return (OrderStatus::PartiallyFilled, sz);
    };
    *filled += sz;
    let filled = *filled;
    if filled >= *original {
        fills.remove(&oid);
        (OrderStatus::Filled, filled)
    } else {
        (OrderStatus::PartiallyFilled, filled)
    }
}

async fn translate(
    message: Message,
    coin: &str,
    fills: &Mutex<HashMap<u64, (Decimal, Decimal)>>,
) -> Vec<OrderEvent> {
    let data = match message {
        Message::User(user_events) => user_events.data,
        _ => return Vec::new(),
    };

    match data {
        UserData::Fills(trades) => {
            let mut events = Vec::new();
            let mut fills = fills.lock().await;
            for fill in trades {
                if fill.coin != coin {
                    debug!(
                        "Ignoring fill for different coin: {} (expected: {})",
                        fill.coin, coin
                    );
                    continue;
                }
                let sz = match Decimal::from_str(&fill.sz) {
                    Ok(sz) => sz,
                    Err(e) => {
                        warn!("Fill for oid {} has malformed size {}: {}", fill.oid, fill.sz, e);
                        continue;
                    }
                };
                let (status, filled_qty) = record_fill(&mut fills, fill.oid, sz);
                events.push(OrderEvent::StatusChanged {
                    order_id: OrderId::from(fill.oid),
                    status,
                    filled_qty,
                });
            }
            events
        }
        UserData::NonUserCancel(cancels) => {
            let mut fills = fills.lock().await;
            cancels
                .into_iter()
                .filter(|c| c.coin == coin)
                .map(|c| {
                    fills.remove(&c.oid);
                    OrderEvent::ExternalCancel {
                        order_id: OrderId::from(c.oid),
                    }
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

#[async_trait]
impl Exchange for HyperliquidExchange {
    fn name(&self) -> &str {
        "hyperliquid"
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        self.check_symbol(symbol)?;
        let l2 = self
            .info
            .lock()
            .await
            .l2_snapshot(self.market.coin.clone())
            .await
            .map_err(sdk_err)?;

        let best = |side: usize| -> Result<Option<Decimal>, ExchangeError> {
            match l2.levels.get(side).and_then(|levels| levels.first()) {
                Some(level) => Ok(Some(parse_decimal(&level.px)?)),
                None => Ok(None),
            }
        };

        Ok(Quote {
            bid: best(0)?,
            ask: best(1)?,
            last: None,
            timestamp: Utc::now(),
        })
    }

    async fn place_order(&self, req: &PlaceOrder) -> Result<PlacedOrder, ExchangeError> {
        self.check_symbol(&req.symbol)?;
        let sdk_req = ClientOrderRequest {
            asset: self.market.coin.clone(),
            is_buy: req.side.is_buy(),
            limit_px: Self::to_f64(req.price)?,
            sz: Self::to_f64(req.quantity)?,
            reduce_only: false,
            order_type: ClientOrder::Limit(ClientLimit {
                tif: "Gtc".to_string(),
            }),
            cloid: Some(req.cloid.as_uuid()),
        };

        let response = self.exchange.order(sdk_req, None).await.map_err(sdk_err)?;
        let res = match response {
            ExchangeResponseStatus::Ok(res) => res,
            ExchangeResponseStatus::Err(e) => return Err(ExchangeError::from_message(e)),
        };
        let status = res
            .data
            .and_then(|d| d.statuses.into_iter().next())
            .ok_or_else(|| ExchangeError::Transient("empty order response".to_string()))?;

        match status {
            ExchangeDataStatus::Resting(r) => {
                self.fills
                    .lock()
                    .await
                    .insert(r.oid, (req.quantity, Decimal::ZERO));
                Ok(PlacedOrder {
                    order_id: OrderId::from(r.oid),
                    status: OrderStatus::Open,
                    filled_qty: Decimal::ZERO,
                })
            }
            ExchangeDataStatus::Filled(f) => Ok(PlacedOrder {
                order_id: OrderId::from(f.oid),
                status: OrderStatus::Filled,
                filled_qty: parse_decimal(&f.total_sz)?,
            }),
            ExchangeDataStatus::Error(e) => Err(ExchangeError::from_message(e)),
            other => Err(ExchangeError::Transient(format!(
                "unexpected order status {:?}",
                other
            ))),
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        let oid = parse_oid(order_id)?;
        let response = self
            .exchange
            .cancel(
                ClientCancelRequest {
                    asset: self.market.coin.clone(),
                    oid,
                },
                None,
            )
            .await
            .map_err(sdk_err)?;

        match response {
            ExchangeResponseStatus::Ok(res) => {
                match res.data.and_then(|d| d.statuses.into_iter().next()) {
                    Some(ExchangeDataStatus::Error(e)) => Err(ExchangeError::from_message(e)),
                    _ => {
                        self.fills.lock().await.remove(&oid);
                        Ok(())
                    }
                }
            }
            ExchangeResponseStatus::Err(e) => Err(ExchangeError::from_message(e)),
        }
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        let orders = self
            .info
            .lock()
            .await
            .open_orders(self.user)
            .await
            .map_err(sdk_err)?;
        let mut out = Vec::new();
        for o in orders.into_iter().filter(|o| o.coin == self.market.coin) {
            let quantity = parse_decimal(&o.sz)?;
            out.push(ExchangeOrder {
                order_id: OrderId::from(o.oid),
                cloid: None,
                side: parse_side(&o.side),
                price: parse_decimal(&o.limit_px)?,
                quantity,
                filled_qty: Decimal::ZERO,
                status: OrderStatus::Open,
            });
        }
        Ok(out)
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &OrderId,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        let oid = parse_oid(order_id)?;
        let response = self
            .info
            .lock()
            .await
            .query_order_by_oid(self.user, oid)
            .await
            .map_err(sdk_err)?;

        let Some(state) = response.order else {
            return Ok(None);
        };
        let remaining = parse_decimal(&state.order.sz)?;
        let original = parse_decimal(&state.order.orig_sz).unwrap_or(remaining);
        let status = parse_status(&state.status, remaining, original);
        let filled_qty = if status == OrderStatus::Filled {
            original
        } else {
            original - remaining
        };

        Ok(Some(ExchangeOrder {
            order_id: order_id.clone(),
            cloid: state.order.cloid.as_deref().and_then(Cloid::from_hex_str),
            side: parse_side(&state.order.side),
            price: parse_decimal(&state.order.limit_px)?,
            quantity: original,
            filled_qty,
            status,
        }))
    }

    async fn stream_order_events(
        &self,
        symbol: &str,
    ) -> Result<BoxStream<'static, OrderEvent>, ExchangeError> {
        self.check_symbol(symbol)?;
        let mut client = InfoClient::with_reconnect(None, Some(base_url(&self.network)))
            .await
            .map_err(sdk_err)?;

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        client
            .subscribe(Subscription::UserEvents { user: self.user }, sender)
            .await
            .map_err(sdk_err)?;
        info!("Subscribed to UserEvents for {:?}.", self.user);

        // Dropping the previous client closes its channel and ends its stream.
        *self.stream_client.lock().await = Some(client);

        let coin = self.market.coin.clone();
        let fills = self.fills.clone();
        Ok(UnboundedReceiverStream::new(receiver)
            .then(move |message| {
                let coin = coin.clone();
                let fills = fills.clone();
                async move { translate(message, &coin, &fills).await }
            })
            .flat_map(stream::iter)
            .boxed())
    }
}

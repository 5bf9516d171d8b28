pub mod rest;
pub mod stream;

pub use rest::FuturesRestClient;
pub use stream::{PriceFeed, PriceStream, PriceTick};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Candle, Side, Symbol, TimeFrame};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    /// The exchange definitively rejected the order; safe to retry or fall
    /// back because nothing was placed.
    #[error("order rejected: {0}")]
    Rejected(String),
    /// The request may or may not have reached the exchange. Callers must
    /// poll order status before retrying to avoid a double-open.
    #[error("ambiguous order outcome: {0}")]
    Ambiguous(String),
    #[error("rate limited")]
    RateLimited,
    #[error("response parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Client-generated id; lets callers poll status after an ambiguous
    /// submit without risking a double-open.
    pub client_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    /// True when this order reduces an existing position.
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            symbol,
            side,
            kind: OrderKind::Market,
            quantity,
            price: None,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            symbol,
            side,
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
            reduce_only: false,
        }
    }

    pub fn closing(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// The exchange's order response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub ok: bool,
    pub order_id: String,
    pub filled_price: Decimal,
    pub filled_qty: Decimal,
    pub fee: Decimal,
    pub reason: Option<String>,
}

/// Abstract exchange surface consumed by the engine. The REST client is the
/// production implementation; tests script this trait directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        timeframe: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn mark_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    async fn funding_rate(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError>;

    async fn order_status(&self, symbol: &Symbol, order_id: &str)
        -> Result<OrderResponse, ExchangeError>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError>;
}

pub mod regime;

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use crate::exchange::{ExchangeClient, ExchangeError};
use crate::types::{CandleBuffer, MarketSnapshot, Symbol, TimeFrame};

/// Candle depth fetched per timeframe. Sized for the scorer's deepest
/// lookback (72 x 1h, 30 x 1d) with headroom.
const M5_DEPTH: u32 = 50;
const M15_DEPTH: u32 = 50;
const H1_DEPTH: u32 = 80;
const D1_DEPTH: u32 = 35;

/// Read-only market data access: one coherent multi-timeframe snapshot per
/// symbol per scan. Candle collection pipelines are external; this only
/// reads what the exchange already serves.
pub struct MarketDataReader {
    exchange: Arc<dyn ExchangeClient>,
}

impl MarketDataReader {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self { exchange }
    }

    pub async fn snapshot(&self, symbol: &Symbol) -> Result<MarketSnapshot, ExchangeError> {
        let (m5, m15, h1, d1) = tokio::try_join!(
            self.exchange.fetch_candles(symbol, TimeFrame::M5, M5_DEPTH),
            self.exchange.fetch_candles(symbol, TimeFrame::M15, M15_DEPTH),
            self.exchange.fetch_candles(symbol, TimeFrame::H1, H1_DEPTH),
            self.exchange.fetch_candles(symbol, TimeFrame::D1, D1_DEPTH),
        )?;

        let funding_rate = match self.exchange.funding_rate(symbol).await {
            Ok(rate) => Some(rate),
            Err(e) => {
                debug!("No funding rate for {}: {}", symbol, e);
                None
            }
        };

        Ok(MarketSnapshot {
            symbol: symbol.clone(),
            m5: CandleBuffer::from_candles(m5),
            m15: CandleBuffer::from_candles(m15),
            h1: CandleBuffer::from_candles(h1),
            d1: CandleBuffer::from_candles(d1),
            funding_rate,
            fetched_at: Utc::now(),
        })
    }

    pub async fn latest_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        self.exchange.mark_price(symbol).await
    }

    /// 24h change percentage from the latest daily candle, for the regime
    /// tracker.
    pub async fn daily_change_pct(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let d1 = self.exchange.fetch_candles(symbol, TimeFrame::D1, 2).await?;
        d1.last()
            .map(|c| c.change_pct())
            .ok_or_else(|| ExchangeError::Parse("no daily candle returned".to_string()))
    }
}

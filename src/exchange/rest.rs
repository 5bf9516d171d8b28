use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::settings::ExchangeSettings;
use crate::types::{Candle, Side, Symbol, TimeFrame};

use super::{ExchangeClient, ExchangeError, OrderKind, OrderRequest, OrderResponse};

type HmacSha256 = Hmac<Sha256>;
type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const GET_RETRIES: u32 = 3;
const GET_RETRY_BACKOFF_MS: u64 = 250;

/// REST client for the perpetual-futures API. Idempotent GETs retry up to
/// three times; orders are submitted exactly once here - the retry/fallback
/// policy lives in the entry executor, and ambiguous failures are surfaced
/// as such so callers poll status instead of re-submitting.
pub struct FuturesRestClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    market_limiter: Limiter,
    order_limiter: Limiter,
}

impl FuturesRestClient {
    pub fn new(settings: &ExchangeSettings) -> Self {
        let market_quota = Quota::per_second(
            NonZeroU32::new(settings.market_data_rps.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        let order_quota = Quota::per_second(
            NonZeroU32::new(settings.order_rps.max(1)).unwrap_or(NonZeroU32::MIN),
        );

        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            secret_key: settings.secret_key.clone(),
            market_limiter: RateLimiter::direct(market_quota),
            order_limiter: RateLimiter::direct(order_quota),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        parts.push(format!("timestamp={}", timestamp));
        parts.push("recvWindow=5000".to_string());
        let query = parts.join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn get_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ExchangeError> {
        let mut last_err = ExchangeError::Transport("no attempt made".to_string());
        for attempt in 0..GET_RETRIES {
            self.market_limiter.until_ready().await;
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| ExchangeError::Parse(e.to_string()));
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    last_err = ExchangeError::RateLimited;
                }
                Ok(resp) => {
                    last_err = ExchangeError::Transport(format!("http {}", resp.status()));
                }
                Err(e) => {
                    last_err = ExchangeError::Transport(e.to_string());
                }
            }
            if attempt + 1 < GET_RETRIES {
                tokio::time::sleep(Duration::from_millis(GET_RETRY_BACKOFF_MS * (attempt as u64 + 1)))
                    .await;
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl ExchangeClient for FuturesRestClient {
    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        timeframe: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.exchange_code(),
            timeframe.as_str(),
            limit
        );

        let raw: Vec<Vec<serde_json::Value>> = self.get_with_retry(&url).await?;

        let candles = raw
            .into_iter()
            .map(|k| {
                let open_time = k.first().and_then(|v| v.as_i64()).unwrap_or(0);
                let field = |i: usize| -> Result<Decimal, ExchangeError> {
                    let s = k.get(i).and_then(|v| v.as_str()).unwrap_or("0");
                    Decimal::from_str(s).map_err(|e| ExchangeError::Parse(e.to_string()))
                };
                Ok(Candle {
                    symbol: symbol.clone(),
                    timeframe,
                    open_time: Utc
                        .timestamp_millis_opt(open_time)
                        .single()
                        .unwrap_or_else(Utc::now),
                    open: field(1)?,
                    high: field(2)?,
                    low: field(3)?,
                    close: field(4)?,
                    volume: field(5)?,
                    quote_volume: field(7)?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;

        debug!("Fetched {} {} candles for {}", candles.len(), timeframe, symbol);
        Ok(candles)
    }

    async fn mark_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let url = format!(
            "{}/v1/premiumIndex?symbol={}",
            self.base_url,
            symbol.exchange_code()
        );
        let resp: MarkPriceResponse = self.get_with_retry(&url).await?;
        Decimal::from_str(&resp.mark_price).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    async fn funding_rate(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let url = format!(
            "{}/v1/premiumIndex?symbol={}",
            self.base_url,
            symbol.exchange_code()
        );
        let resp: MarkPriceResponse = self.get_with_retry(&url).await?;
        Decimal::from_str(&resp.last_funding_rate)
            .map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        self.order_limiter.until_ready().await;

        let order_side = match (request.side, request.reduce_only) {
            (Side::Long, false) | (Side::Short, true) => "BUY",
            (Side::Short, false) | (Side::Long, true) => "SELL",
        };

        let mut params = vec![
            ("symbol", request.symbol.exchange_code()),
            ("side", order_side.to_string()),
            ("quantity", request.quantity.to_string()),
            ("newClientOrderId", request.client_id.clone()),
        ];
        match request.kind {
            OrderKind::Market => params.push(("type", "MARKET".to_string())),
            OrderKind::Limit => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                if let Some(price) = request.price {
                    params.push(("price", price.to_string()));
                }
            }
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let query = self.signed_query(&params);
        let url = format!("{}/v1/order?{}", self.base_url, query);

        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                // A send failure after the request may have left the exchange:
                // treat timeouts as ambiguous, connection refusals as transport.
                if e.is_timeout() {
                    ExchangeError::Ambiguous(e.to_string())
                } else {
                    ExchangeError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let body: OrderApiResponse = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Ambiguous(format!("unreadable order response: {}", e)))?;

        if !status.is_success() || !body.ok {
            let reason = body.reason.unwrap_or_else(|| format!("http {}", status));
            warn!("Order rejected for {}: {}", request.symbol, reason);
            return Err(ExchangeError::Rejected(reason));
        }

        Ok(OrderResponse {
            ok: true,
            order_id: body.order_id,
            filled_price: parse_price(&body.filled_price)?,
            filled_qty: parse_price(&body.filled_qty)?,
            fee: parse_price(&body.fee)?,
            reason: None,
        })
    }

    async fn order_status(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<OrderResponse, ExchangeError> {
        let query = self.signed_query(&[
            ("symbol", symbol.exchange_code()),
            ("origClientOrderId", order_id.to_string()),
        ]);
        let url = format!("{}/v1/order?{}", self.base_url, query);

        self.market_limiter.until_ready().await;
        let body: OrderApiResponse = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;

        Ok(OrderResponse {
            ok: body.ok,
            order_id: body.order_id,
            filled_price: parse_price(&body.filled_price)?,
            filled_qty: parse_price(&body.filled_qty)?,
            fee: parse_price(&body.fee)?,
            reason: body.reason,
        })
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let query = self.signed_query(&[
            ("symbol", symbol.exchange_code()),
            ("orderId", order_id.to_string()),
        ]);
        let url = format!("{}/v1/order?{}", self.base_url, query);

        self.order_limiter.until_ready().await;
        let resp = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ExchangeError::Rejected(format!("cancel failed: http {}", resp.status())))
        }
    }
}

fn parse_price(s: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(s).map_err(|e| ExchangeError::Parse(e.to_string()))
}

fn zero_string() -> String {
    "0".to_string()
}

#[derive(Debug, Deserialize)]
struct MarkPriceResponse {
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "lastFundingRate", default = "zero_string")]
    last_funding_rate: String,
}

#[derive(Debug, Deserialize)]
struct OrderApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(rename = "orderId", default)]
    order_id: String,
    #[serde(rename = "filledPrice", default = "zero_string")]
    filled_price: String,
    #[serde(rename = "filledQty", default = "zero_string")]
    filled_qty: String,
    #[serde(default = "zero_string")]
    fee: String,
    #[serde(default)]
    reason: Option<String>,
}

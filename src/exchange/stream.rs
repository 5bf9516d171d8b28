use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::types::Symbol;

const RECONNECT_DELAY_SECS: u64 = 5;
const TICK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

struct FeedInner {
    latest: HashMap<Symbol, PriceTick>,
    senders: HashMap<Symbol, broadcast::Sender<PriceTick>>,
}

/// Per-symbol fan-out hub between the single stream consumer task and the
/// many exit monitors / entry executors. Monitors subscribe to their symbol;
/// the consumer publishes every tick. Lock sections are pointer-sized and
/// never held across await.
pub struct PriceFeed {
    inner: RwLock<FeedInner>,
}

impl PriceFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(FeedInner {
                latest: HashMap::new(),
                senders: HashMap::new(),
            }),
        })
    }

    pub fn subscribe(&self, symbol: &Symbol) -> broadcast::Receiver<PriceTick> {
        let mut inner = self.inner.write().expect("price feed lock poisoned");
        inner
            .senders
            .entry(symbol.clone())
            .or_insert_with(|| broadcast::channel(TICK_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn latest(&self, symbol: &Symbol) -> Option<PriceTick> {
        let inner = self.inner.read().expect("price feed lock poisoned");
        inner.latest.get(symbol).cloned()
    }

    pub fn publish(&self, tick: PriceTick) {
        let mut inner = self.inner.write().expect("price feed lock poisoned");
        if let Some(sender) = inner.senders.get(&tick.symbol) {
            // Send failures just mean no monitor is currently subscribed.
            let _ = sender.send(tick.clone());
        }
        inner.latest.insert(tick.symbol.clone(), tick);
    }
}

/// Mark-price stream consumer. Connects, parses ticks into the feed, and
/// reconnects with a fixed delay until shutdown.
pub struct PriceStream {
    ws_url: String,
    symbols: Vec<Symbol>,
}

impl PriceStream {
    pub fn new(ws_url: String, symbols: Vec<Symbol>) -> Self {
        Self { ws_url, symbols }
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@markPrice", s.exchange_code().to_lowercase()))
            .collect();
        format!("{}?streams={}", self.ws_url, streams.join("/"))
    }

    pub async fn run(self, feed: Arc<PriceFeed>, mut shutdown: watch::Receiver<bool>) {
        let code_map: HashMap<String, Symbol> = self
            .symbols
            .iter()
            .map(|s| (s.exchange_code(), s.clone()))
            .collect();
        let url = self.stream_url();

        loop {
            tokio::select! {
                result = Self::run_connection(&url, &code_map, &feed) => {
                    match result {
                        Ok(()) => warn!("Price stream closed, reconnecting..."),
                        Err(e) => error!("Price stream error: {}, reconnecting...", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Price stream shutting down");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                _ = shutdown.changed() => {
                    info!("Price stream shutting down");
                    return;
                }
            }
        }
    }

    async fn run_connection(
        url: &str,
        code_map: &HashMap<String, Symbol>,
        feed: &Arc<PriceFeed>,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        let (_, mut read) = ws_stream.split();

        info!("Price stream connected ({} symbols)", code_map.len());

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(tick) = parse_mark_price(&text, code_map) {
                        feed.publish(tick);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Price stream closed by server");
                    break;
                }
                Err(e) => {
                    error!("Price stream receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn parse_mark_price(text: &str, code_map: &HashMap<String, Symbol>) -> Option<PriceTick> {
    // Combined-stream envelope first, bare event as fallback.
    let event: WsMarkPriceEvent = if let Ok(combined) = serde_json::from_str::<WsCombined>(text) {
        serde_json::from_value(combined.data).ok()?
    } else {
        serde_json::from_str(text).ok()?
    };

    if event.event_type != "markPriceUpdate" {
        debug!("Ignoring stream event type {}", event.event_type);
        return None;
    }

    let symbol = code_map.get(&event.symbol)?.clone();
    let price = Decimal::from_str(&event.mark_price).ok()?;
    Some(PriceTick {
        symbol,
        price,
        at: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct WsCombined {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsMarkPriceEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn code_map() -> HashMap<String, Symbol> {
        [("BTCUSDT".to_string(), Symbol::from("BTC/USDT"))]
            .into_iter()
            .collect()
    }

    #[test]
    fn parses_combined_stream_message() {
        let text = r#"{"stream":"btcusdt@markPrice","data":{"e":"markPriceUpdate","s":"BTCUSDT","p":"65000.50"}}"#;
        let tick = parse_mark_price(text, &code_map()).unwrap();
        assert_eq!(tick.symbol, Symbol::from("BTC/USDT"));
        assert_eq!(tick.price, dec!(65000.50));
    }

    #[test]
    fn ignores_unknown_symbols_and_events() {
        let unknown_symbol = r#"{"e":"markPriceUpdate","s":"XYZUSDT","p":"1.0"}"#;
        assert!(parse_mark_price(unknown_symbol, &code_map()).is_none());
        let other_event = r#"{"e":"kline","s":"BTCUSDT","p":"1.0"}"#;
        assert!(parse_mark_price(other_event, &code_map()).is_none());
    }

    #[tokio::test]
    async fn feed_fans_out_to_subscribers_and_tracks_latest() {
        let feed = PriceFeed::new();
        let symbol = Symbol::from("BTC/USDT");
        let mut rx = feed.subscribe(&symbol);

        feed.publish(PriceTick {
            symbol: symbol.clone(),
            price: dec!(100),
            at: Utc::now(),
        });

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.price, dec!(100));
        assert_eq!(feed.latest(&symbol).unwrap().price, dec!(100));
        assert!(feed.latest(&Symbol::from("ETH/USDT")).is_none());
    }
}

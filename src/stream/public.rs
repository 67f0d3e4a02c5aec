//! Public Market-Data Stream (component B).
//!
//! One reader task owns the socket; the latest snapshot is published to an
//! `ArcSwap` so the orchestrator reads it lock-free.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::{FunError, FunResult};
use crate::model::BookSnapshot;

const BYBIT_PUBLIC_LINEAR_WS: &str = "wss://stream.bybit.com/v5/public/linear";

fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

pub struct PublicStream {
    latest: ArcSwap<Option<BookSnapshot>>,
    ready: AtomicBool,
    shutdown: AtomicBool,
    last_message_ms: AtomicI64,
}

impl PublicStream {
    /// Connect and subscribe to `orderbook.1`, `publicTrade`, and `tickers`
    /// for `symbol`, then spawn the reader task. Returns once the
    /// subscription ack is sent; does not wait for the first snapshot.
    pub async fn connect(symbol: &str) -> FunResult<Arc<Self>> {
        let stream = Arc::new(Self {
            latest: ArcSwap::from_pointee(None),
            ready: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(local_now_ms()),
        });

        let (ws_stream, _) = connect_async(BYBIT_PUBLIC_LINEAR_WS)
            .await
            .map_err(|e| FunError::Transport(e.into()))?;

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({
            "op": "subscribe",
            "args": [
                format!("orderbook.1.{symbol}"),
                format!("publicTrade.{symbol}"),
                format!("tickers.{symbol}"),
            ],
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .map_err(|e| FunError::Transport(e.into()))?;

        let task_stream = stream.clone();
        tokio::spawn(async move {
            task_stream.run_reader(read, write).await;
        });

        Ok(stream)
    }

    async fn run_reader(
        &self,
        mut read: futures_util::stream::SplitStream<crate::stream::WsStream>,
        mut write: futures_util::stream::SplitSink<crate::stream::WsStream, Message>,
    ) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let msg = match read.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!(error = %e, "public_stream_read_error");
                    break;
                }
                None => break,
            };

            self.last_message_ms.store(local_now_ms(), Ordering::Relaxed);

            match msg {
                Message::Text(text) => self.handle_text(&text),
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        debug!("public_stream_reader_stopped");
    }

    fn handle_text(&self, text: &str) {
        let v: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };

        let Some(topic) = v.get("topic").and_then(|t| t.as_str()) else {
            return;
        };

        let prev = (**self.latest.load()).clone().unwrap_or(BookSnapshot {
            best_bid: Decimal::ZERO,
            best_ask: Decimal::ZERO,
            last_trade: Decimal::ZERO,
            wall_clock_received_ms: 0,
        });

        let mut next = prev;
        next.wall_clock_received_ms = local_now_ms();

        if topic.starts_with("orderbook.") {
            if let Some(data) = v.get("data") {
                if let Some(bid) = data
                    .get("b")
                    .and_then(|b| b.as_array())
                    .and_then(|a| a.first())
                    .and_then(|e| e.as_array())
                    .and_then(|e| e.first())
                    .and_then(|p| p.as_str())
                    .and_then(|s| s.parse().ok())
                {
                    next.best_bid = bid;
                }
                if let Some(ask) = data
                    .get("a")
                    .and_then(|a| a.as_array())
                    .and_then(|a| a.first())
                    .and_then(|e| e.as_array())
                    .and_then(|e| e.first())
                    .and_then(|p| p.as_str())
                    .and_then(|s| s.parse().ok())
                {
                    next.best_ask = ask;
                }
            }
        } else if topic.starts_with("publicTrade.") {
            if let Some(trade) = v.get("data").and_then(|d| d.as_array()).and_then(|a| a.last()) {
                if let Some(px) = trade.get("p").and_then(|p| p.as_str()).and_then(|s| s.parse().ok()) {
                    next.last_trade = px;
                }
            }
        } else if topic.starts_with("tickers.") {
            if let Some(data) = v.get("data") {
                if let Some(px) = data
                    .get("lastPrice")
                    .and_then(|p| p.as_str())
                    .and_then(|s| s.parse().ok())
                {
                    next.last_trade = px;
                }
            }
        } else {
            return;
        }

        if next.best_bid > Decimal::ZERO && next.best_ask > Decimal::ZERO {
            self.ready.store(true, Ordering::Release);
        }

        self.latest.store(Arc::new(Some(next)));
    }

    /// Non-blocking read of the latest snapshot.
    pub fn snapshot(&self) -> Option<BookSnapshot> {
        (**self.latest.load()).clone()
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn staleness_ms(&self) -> i64 {
        (local_now_ms() - self.last_message_ms.load(Ordering::Relaxed)).max(0)
    }

    pub fn is_healthy(&self, max_staleness_ms: i64) -> bool {
        self.ready() && self.staleness_ms() <= max_staleness_ms
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> PublicStream {
        PublicStream {
            latest: ArcSwap::from_pointee(None),
            ready: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(local_now_ms()),
        }
    }

    #[test]
    fn handle_text_updates_best_bid_and_ask() {
        let stream = sample_stream();
        let msg = serde_json::json!({
            "topic": "orderbook.1.LPTUSDT",
            "data": {"b": [["4.9990", "10"]], "a": [["4.9995", "8"]]}
        })
        .to_string();

        stream.handle_text(&msg);

        let snap = stream.snapshot().unwrap();
        assert_eq!(snap.best_bid.to_string(), "4.9990");
        assert_eq!(snap.best_ask.to_string(), "4.9995");
        assert!(stream.ready());
    }

    #[test]
    fn unrelated_topic_is_ignored() {
        let stream = sample_stream();
        stream.handle_text(r#"{"topic":"unknown.LPTUSDT","data":{}}"#);
        assert!(stream.snapshot().is_none());
        assert!(!stream.ready());
    }
}

//! Trade-Submission Channel (component D).
//!
//! Correlation ids are `ulid`s, routed the same way as the private stream's
//! order waiters: a map of id -> `oneshot::Sender<TradeReply>` guarded by a
//! single short-held lock. On a retryable position-index mismatch the
//! channel resubmits once with the opposite index (0 <-> 2) and returns the
//! second attempt's outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::BybitCredentials;
use crate::error::{FunError, FunResult};
use crate::model::{OrderDraft, TimeInForce};

const BYBIT_TRADE_WS: &str = "wss://stream.bybit.com/v5/trade";

/// The specific exchange error code meaning "position index doesn't match
/// the account's configured mode" — retryable with the opposite index.
const POSITION_IDX_MISMATCH_CODE: i64 = 10001;

#[derive(Debug, Clone)]
pub enum TradeReply {
    Accepted { order_id: String },
    Rejected { code: i64, message: String },
}

struct PendingState {
    outstanding: HashMap<String, oneshot::Sender<TradeReply>>,
}

pub struct TradeChannel {
    pending: SyncMutex<PendingState>,
    shutdown: AtomicBool,
    sink: AsyncMutex<Option<futures_util::stream::SplitSink<crate::stream::WsStream, Message>>>,
}

impl TradeChannel {
    pub async fn connect(creds: &BybitCredentials) -> FunResult<Arc<Self>> {
        let channel = Arc::new(Self {
            pending: SyncMutex::new(PendingState {
                outstanding: HashMap::new(),
            }),
            shutdown: AtomicBool::new(false),
            sink: AsyncMutex::new(None),
        });

        let (ws_stream, _) = connect_async(BYBIT_TRADE_WS)
            .await
            .map_err(|e| FunError::Transport(e.into()))?;
        let (mut write, read) = ws_stream.split();

        let auth = super::ws_auth_message(creds)?;
        write
            .send(Message::Text(auth))
            .await
            .map_err(|e| FunError::Transport(e.into()))?;

        *channel.sink.lock().await = Some(write);

        let task_channel = channel.clone();
        tokio::spawn(async move {
            task_channel.run_reader(read).await;
        });

        Ok(channel)
    }

    async fn run_reader(
        &self,
        mut read: futures_util::stream::SplitStream<crate::stream::WsStream>,
    ) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let msg = match read.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!(error = %e, "trade_channel_read_error");
                    break;
                }
                None => break,
            };

            match msg {
                Message::Text(text) => self.handle_text(&text),
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.drain_pending_cancelled();
        debug!("trade_channel_reader_stopped");
    }

    fn handle_text(&self, text: &str) {
        let v: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let Some(req_id) = v.get("reqId").and_then(|x| x.as_str()) else {
            return;
        };

        let ret_code = v.get("retCode").and_then(|x| x.as_i64()).unwrap_or(0);
        let reply = if ret_code == 0 {
            let order_id = v
                .get("data")
                .and_then(|d| d.get("orderId"))
                .and_then(|x| x.as_str())
                .unwrap_or_default()
                .to_string();
            TradeReply::Accepted { order_id }
        } else {
            let message = v
                .get("retMsg")
                .and_then(|x| x.as_str())
                .unwrap_or_default()
                .to_string();
            TradeReply::Rejected { code: ret_code, message }
        };

        let tx = self.pending.lock().outstanding.remove(req_id);
        if let Some(tx) = tx {
            let _ = tx.send(reply);
        }
    }

    async fn send_request(&self, draft: &OrderDraft, symbol: &str, timeout_ms: u64) -> FunResult<TradeReply> {
        let req_id = Ulid::new().to_string();
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().outstanding.insert(req_id.clone(), tx);
            rx
        };

        let side = match draft.side {
            crate::model::Side::Buy => "Buy",
            crate::model::Side::Sell => "Sell",
        };
        let tif = match draft.time_in_force {
            TimeInForce::ImmediateOrCancel => "IOC",
        };

        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side,
            "orderType": "Limit",
            "qty": draft.qty.to_string(),
            "price": draft.price.to_string(),
            "timeInForce": tif,
            "positionIdx": draft.position_index.as_u8(),
            "reduceOnly": draft.reduce_only,
        });

        let request = serde_json::json!({
            "reqId": req_id,
            "op": "order.create",
            "args": [body],
        });

        {
            let mut sink_guard = self.sink.lock().await;
            let Some(sink) = sink_guard.as_mut() else {
                self.pending.lock().outstanding.remove(&req_id);
                return Err(FunError::transient("trade channel not connected"));
            };
            sink.send(Message::Text(request.to_string()))
                .await
                .map_err(|e| FunError::Transport(e.into()))?;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().outstanding.remove(&req_id);
                Err(FunError::transient("trade channel reply sender dropped"))
            }
            Err(_) => {
                self.pending.lock().outstanding.remove(&req_id);
                Err(FunError::transient(format!(
                    "create_order ack timed out after {timeout_ms}ms"
                )))
            }
        }
    }

    /// Submit `draft` for `symbol`. Retries exactly once with the opposite
    /// `position_index` on the retryable position-index-mismatch code.
    /// A timeout or an ambiguous error is returned verbatim — the caller
    /// must never treat it as proof the position did not open.
    pub async fn create_order(
        &self,
        draft: &OrderDraft,
        symbol: &str,
        timeout_ms: u64,
    ) -> FunResult<String> {
        let reply = self.send_request(draft, symbol, timeout_ms).await?;

        let reply = match reply {
            TradeReply::Rejected { code, .. } if code == POSITION_IDX_MISMATCH_CODE => {
                let mut retried_draft = draft.clone();
                retried_draft.position_index = draft.position_index.opposite();
                debug!(symbol, "retrying create_order with flipped position_index");
                self.send_request(&retried_draft, symbol, timeout_ms).await?
            }
            other => other,
        };

        match reply {
            TradeReply::Accepted { order_id } => Ok(order_id),
            TradeReply::Rejected { code, message } => {
                Err(FunError::transient(format!("order rejected ({code}): {message}")))
            }
        }
    }

    fn drain_pending_cancelled(&self) {
        self.pending.lock().outstanding.clear();
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.drain_pending_cancelled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_without_socket() -> TradeChannel {
        TradeChannel {
            pending: SyncMutex::new(PendingState {
                outstanding: HashMap::new(),
            }),
            shutdown: AtomicBool::new(false),
            sink: AsyncMutex::new(None),
        }
    }

    #[tokio::test]
    async fn handle_text_routes_accepted_reply_to_waiting_sender() {
        let channel = channel_without_socket();
        let (tx, rx) = oneshot::channel();
        channel.pending.lock().outstanding.insert("req-1".to_string(), tx);

        channel.handle_text(r#"{"reqId":"req-1","retCode":0,"data":{"orderId":"ord-9"}}"#);

        match rx.await.unwrap() {
            TradeReply::Accepted { order_id } => assert_eq!(order_id, "ord-9"),
            TradeReply::Rejected { .. } => panic!("expected acceptance"),
        }
    }

    #[tokio::test]
    async fn handle_text_routes_position_index_mismatch_as_rejected() {
        let channel = channel_without_socket();
        let (tx, rx) = oneshot::channel();
        channel.pending.lock().outstanding.insert("req-2".to_string(), tx);

        channel.handle_text(
            r#"{"reqId":"req-2","retCode":10001,"retMsg":"position idx not match position mode"}"#,
        );

        match rx.await.unwrap() {
            TradeReply::Rejected { code, .. } => assert_eq!(code, POSITION_IDX_MISMATCH_CODE),
            TradeReply::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn unmatched_req_id_reply_is_dropped_silently() {
        let channel = channel_without_socket();
        // No panics, no outstanding entries touched.
        channel.handle_text(r#"{"reqId":"unknown","retCode":0,"data":{"orderId":"x"}}"#);
        assert!(channel.pending.lock().outstanding.is_empty());
    }
}

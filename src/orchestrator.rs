//! Execution Orchestrator (component F) — the hard part.
//!
//! Drives one payout's timeline end to end: fix reference price, evaluate
//! admission, dispatch the open, await fill, schedule the close, reconcile
//! the opened quantity under ambiguity, and hand executions to the PnL
//! reconstructor. Every suspension point here has a hard timeout, per §5.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::clock::ServerClock;
use crate::config::FunConfig;
use crate::error::FunResult;
use crate::exchange::ExchangeRest;
use crate::model::{BookSnapshot, ExecutionRecord, OrderDraft, PayoutSpec, Side, TimeInForce};
use crate::pnl::{self, PnlReport};
use crate::preflight::PreflightResult;
use crate::quantize::{ceil_to_step, floor_to_step};
use crate::stream::private::WaitOutcome;
use crate::stream::{PrivateStream, PublicStream, TradeChannel};

fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutState {
    SkipStale,
    SkipDown,
    NoFill,
    Closed,
    ResidualOpen,
}

#[derive(Debug, Clone)]
pub struct PayoutOutcome {
    pub state: PayoutState,
    pub opened_qty: Decimal,
    pub closed_qty: Decimal,
    pub pnl: Option<PnlReport>,
    pub note: Option<String>,
}

pub struct Orchestrator<'a> {
    pub clock: &'a ServerClock,
    pub public: Arc<PublicStream>,
    pub private: Arc<PrivateStream>,
    pub trade: Arc<TradeChannel>,
    pub exchange: &'a dyn ExchangeRest,
    pub config: &'a FunConfig,
}

impl<'a> Orchestrator<'a> {
    /// Run one payout to completion. `payout_server_ms` is the scheduled
    /// funding-settlement instant, supplied by the caller (the
    /// funding-opportunity scanner is an out-of-scope external collaborator,
    /// §1); everything else in this timeline is derived from it.
    pub async fn run(
        &self,
        spec: &PayoutSpec,
        preflight: &PreflightResult,
        payout_server_ms: i64,
    ) -> FunResult<PayoutOutcome> {
        let fix_server_ms = payout_server_ms - self.config.ws_fix_lead_ms;
        let open_server_ms = payout_server_ms - self.config.open_early_ms;
        let close_server_ms = payout_server_ms + self.config.fast_close_delay_ms();

        debug!(
            fix_server_ms,
            open_server_ms, close_server_ms, payout_server_ms, "trade_plan_timeline"
        );

        self.clock.sleep_until_server_ms(fix_server_ms).await;
        let Some(ref_px_fix) = self.fix_reference_price() else {
            return Ok(self.terminal(PayoutState::SkipStale, Decimal::ZERO, Decimal::ZERO, None, "public stream stale or not ready at fix"));
        };

        let entry_bps_plan = admission_plan_bps(self.config, spec.funding_rate_pct);
        info!(ref_px_fix = %ref_px_fix, entry_bps_plan = %entry_bps_plan, "fix_complete");

        self.clock.sleep_until_server_ms(open_server_ms).await;

        let Some(snapshot_open) = self.public.snapshot() else {
            return Ok(self.terminal(PayoutState::SkipStale, Decimal::ZERO, Decimal::ZERO, None, "public stream produced no snapshot at open"));
        };
        if snapshot_open.is_stale(local_now_ms(), self.config.open_max_staleness_ms) {
            return Ok(self.terminal(PayoutState::SkipStale, Decimal::ZERO, Decimal::ZERO, None, "public stream stale at open"));
        }

        let down_bps = ((ref_px_fix - snapshot_open.best_bid) / ref_px_fix) * Decimal::from(10_000);
        if down_bps > entry_bps_plan {
            info!(%down_bps, %entry_bps_plan, "admission_rejected");
            return Ok(self.terminal(PayoutState::SkipDown, Decimal::ZERO, Decimal::ZERO, None, "price moved beyond admission tolerance"));
        }

        let entry_ticks = self.config.entry_ticks();
        let limit_px = floor_to_step(
            snapshot_open.best_bid - Decimal::from(entry_ticks) * preflight.instrument.tick_size,
            preflight.instrument.tick_size,
        );

        let open_draft = OrderDraft {
            side: Side::Sell,
            qty: spec.qty,
            time_in_force: TimeInForce::ImmediateOrCancel,
            position_index: preflight.position_index,
            reduce_only: false,
            price: limit_px,
        };

        let order_id = match self.trade.create_order(&open_draft, &spec.symbol, 500).await {
            Ok(id) => Some(id),
            Err(e) => {
                // Ambiguous: the order may have been accepted server-side
                // despite the error. Never early-exit here (§4.F).
                warn!(error = %e, "open_acknowledgement_ambiguous");
                None
            }
        };

        let filled_qty = match &order_id {
            Some(id) => match self.private.wait_final(id, 1500).await {
                WaitOutcome::Final(final_state) if final_state.filled_qty > Decimal::ZERO => {
                    final_state.filled_qty
                }
                WaitOutcome::Final(_) => Decimal::ZERO,
                WaitOutcome::TimedOut => Decimal::ZERO,
            },
            None => Decimal::ZERO,
        };

        let opened_qty = self
            .reconcile_opened_qty(spec, preflight, filled_qty, close_server_ms)
            .await;

        if opened_qty <= Decimal::ZERO {
            return Ok(self.terminal(PayoutState::NoFill, Decimal::ZERO, Decimal::ZERO, None, "reconciliation found no opened quantity"));
        }

        self.clock.sleep_until_server_ms(close_server_ms).await;
        let closed_qty = self
            .close_position(&spec.symbol, preflight, opened_qty)
            .await;

        let executions = self.gather_executions(&spec.symbol, open_server_ms, close_server_ms).await;
        let pnl = pnl::reconstruct(&executions);

        let final_state = if closed_qty >= opened_qty {
            PayoutState::Closed
        } else {
            warn!(opened_qty = %opened_qty, closed_qty = %closed_qty, "residual_position_after_close_attempts");
            PayoutState::ResidualOpen
        };

        Ok(PayoutOutcome {
            state: final_state,
            opened_qty,
            closed_qty,
            pnl: Some(pnl),
            note: None,
        })
    }

    fn terminal(
        &self,
        state: PayoutState,
        opened_qty: Decimal,
        closed_qty: Decimal,
        pnl: Option<PnlReport>,
        note: &str,
    ) -> PayoutOutcome {
        PayoutOutcome {
            state,
            opened_qty,
            closed_qty,
            pnl,
            note: Some(note.to_string()),
        }
    }

    fn fix_reference_price(&self) -> Option<Decimal> {
        let snapshot = self.public.snapshot()?;
        reference_price_from_snapshot(&snapshot, local_now_ms(), self.config.open_max_staleness_ms)
    }

    async fn reconcile_opened_qty(
        &self,
        spec: &PayoutSpec,
        preflight: &PreflightResult,
        filled_qty: Decimal,
        close_deadline_server_ms: i64,
    ) -> Decimal {
        if filled_qty > Decimal::ZERO {
            return filled_qty;
        }

        // Poll the private-stream position cache briefly, up to the close
        // deadline, before falling back to a REST snapshot.
        let poll_deadline = self.clock.now_server_ms() + (close_deadline_server_ms - self.clock.now_server_ms()).clamp(0, 400);
        loop {
            if let Some(size) = self
                .private
                .position_size(&spec.symbol, preflight.position_index.as_u8(), Side::Sell)
            {
                let delta = size - preflight.short_before;
                if delta > Decimal::ZERO {
                    return delta;
                }
            }
            if self.clock.now_server_ms() >= poll_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        match self
            .exchange
            .position_size_rest(&spec.symbol, preflight.position_index.as_u8(), Side::Sell)
            .await
        {
            Ok(size) => (size - preflight.short_before).max(Decimal::ZERO),
            Err(e) => {
                warn!(error = %e, "rest_reconciliation_fallback_failed");
                Decimal::ZERO
            }
        }
    }

    async fn close_position(&self, symbol: &str, preflight: &PreflightResult, opened_qty: Decimal) -> Decimal {
        let position_index = preflight.position_index;
        let tick = preflight.instrument.tick_size;
        let entry_ticks = self.config.entry_ticks();

        for attempt in 0..self.config.fast_close_max_attempts {
            let Some(snapshot) = self.public.snapshot() else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let close_px = ceil_to_step(snapshot.best_ask + Decimal::from(entry_ticks) * tick, tick);

            let draft = OrderDraft {
                side: Side::Buy,
                qty: opened_qty,
                time_in_force: TimeInForce::ImmediateOrCancel,
                position_index,
                reduce_only: true,
                price: close_px,
            };

            if let Err(e) = self.trade.create_order(&draft, symbol, 500).await {
                debug!(attempt, error = %e, "close_attempt_ambiguous");
            }

            // The open position is a short, cached under Side::Sell (the side
            // the exchange's own position event reports it as) — not the
            // closing order's Side::Buy.
            if let Some(remaining) = self.private.position_size(symbol, position_index.as_u8(), Side::Sell) {
                if remaining == Decimal::ZERO {
                    return opened_qty;
                }
            }

            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        match self.private.position_size(symbol, position_index.as_u8(), Side::Sell) {
            Some(remaining) if remaining == Decimal::ZERO => opened_qty,
            Some(remaining) => (opened_qty - remaining).max(Decimal::ZERO),
            None => Decimal::ZERO,
        }
    }

    async fn gather_executions(&self, symbol: &str, open_server_ms: i64, close_server_ms: i64) -> Vec<ExecutionRecord> {
        let start_ms = open_server_ms - 5_000;
        let end_ms = close_server_ms + 10_000;

        let cached = self.private.executions_in_window(symbol, start_ms, end_ms);
        if !cached.is_empty() {
            return cached;
        }

        self.exchange
            .executions_in_window_rest(symbol, start_ms, end_ms)
            .await
            .unwrap_or_default()
    }
}

/// Derive the fix-time reference price from a snapshot, or `None` if it
/// can't be trusted: stale by wall-clock time, or ready (best_bid/best_ask
/// populated) but with no trade print yet, which would otherwise hand back
/// a zero price and divide by zero in the admission check at open.
fn reference_price_from_snapshot(
    snapshot: &BookSnapshot,
    now_local_ms: i64,
    max_staleness_ms: i64,
) -> Option<Decimal> {
    if snapshot.is_stale(now_local_ms, max_staleness_ms) {
        return None;
    }
    let ref_px = snapshot.last_trade.min(snapshot.best_bid);
    if ref_px <= Decimal::ZERO {
        return None;
    }
    Some(ref_px)
}

pub fn admission_plan_bps(config: &FunConfig, funding_rate_pct: Decimal) -> Decimal {
    let funding_bps_abs = (funding_rate_pct * Decimal::from(10_000)).abs();
    let base = Decimal::try_from(config.entry_base_bps).unwrap_or(Decimal::ZERO);
    let mult = Decimal::try_from(config.entry_funding_mult).unwrap_or(Decimal::ZERO);
    let min = Decimal::try_from(config.entry_min_bps).unwrap_or(Decimal::ZERO);
    let max = Decimal::try_from(config.entry_max_bps).unwrap_or(Decimal::ZERO);

    (base + mult * funding_bps_abs).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn admission_plan_uses_base_plus_funding_multiplier() {
        let config = FunConfig::default();
        let plan = admission_plan_bps(&config, d("-0.001")); // 10 bps funding
        assert_eq!(plan, d("49")); // 40 + 0.9*10
    }

    #[test]
    fn admission_plan_matches_happy_path_scenario() {
        let config = FunConfig::default();
        // funding = -0.5% => 50 bps; base 40 + 0.9*50 = 85
        let plan = admission_plan_bps(&config, d("-0.005"));
        assert_eq!(plan, d("85"));
    }

    #[test]
    fn admission_plan_clamps_below_min() {
        let config = FunConfig::default();
        // funding tiny => base+mult*x stays above min anyway since base=40>min=30
        let plan = admission_plan_bps(&config, d("-0.00001"));
        assert!(plan >= d("30"));
    }

    #[test]
    fn admission_plan_clamps_above_max() {
        let config = FunConfig::default();
        let plan = admission_plan_bps(&config, d("-10")); // absurdly large funding
        assert_eq!(plan, d("2500"));
    }

    fn snapshot(best_bid: &str, best_ask: &str, last_trade: &str, wall_clock_received_ms: i64) -> BookSnapshot {
        BookSnapshot {
            best_bid: d(best_bid),
            best_ask: d(best_ask),
            last_trade: d(last_trade),
            wall_clock_received_ms,
        }
    }

    #[test]
    fn reference_price_is_none_when_ready_book_has_no_trade_print_yet() {
        // best_bid/best_ask > 0 satisfies PublicStream::ready(), but
        // last_trade == 0 is still a valid, untraded state.
        let snap = snapshot("5.0000", "5.0005", "0", 1_000);
        assert_eq!(reference_price_from_snapshot(&snap, 1_000, 200), None);
    }

    #[test]
    fn reference_price_is_the_min_of_last_trade_and_best_bid_when_both_positive() {
        let snap = snapshot("4.9990", "5.0005", "5.0000", 1_000);
        assert_eq!(
            reference_price_from_snapshot(&snap, 1_000, 200),
            Some(d("4.9990"))
        );
    }

    #[test]
    fn reference_price_is_none_when_stale_by_local_clock() {
        let snap = snapshot("5.0000", "5.0005", "4.9999", 1_000);
        // 500ms since the snapshot arrived, staleness threshold is 200ms.
        assert_eq!(reference_price_from_snapshot(&snap, 1_500, 200), None);
    }

    #[test]
    fn reference_price_survives_a_large_server_offset_once_compared_in_local_time() {
        // Regression: this used to be compared against server time, which
        // is offset from wall_clock_received_ms (always local) by whatever
        // the clock estimator measured. A snapshot that just arrived must
        // not read as stale just because the server offset is large.
        let snap = snapshot("5.0000", "5.0005", "4.9999", 1_000);
        assert_eq!(reference_price_from_snapshot(&snap, 1_010, 200), Some(d("4.9999")));
    }
}

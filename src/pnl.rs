//! PnL Reconstructor (component H).
//!
//! Partitions an execution list into buys and sells, derives volume-weighted
//! average prices, and sums realised USDT PnL. Funding credit is recorded
//! separately by the exchange and is never included here.

use rust_decimal::Decimal;

use crate::model::{ExecutionRecord, Side};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnlReport {
    pub buy_qty: Decimal,
    pub sell_qty: Decimal,
    pub avg_buy_price: Decimal,
    pub avg_sell_price: Decimal,
    pub fees_usdt: Decimal,
    pub realised_pnl_usdt: Decimal,
    pub buy_count: usize,
    pub sell_count: usize,
}

/// Aggregate `executions` into a `PnlReport`. An empty list yields an
/// all-zero report, which is a legitimate (not erroneous) answer.
pub fn reconstruct(executions: &[ExecutionRecord]) -> PnlReport {
    let mut buy_qty = Decimal::ZERO;
    let mut buy_notional = Decimal::ZERO;
    let mut sell_qty = Decimal::ZERO;
    let mut sell_notional = Decimal::ZERO;
    let mut fees_usdt = Decimal::ZERO;
    let mut buy_count = 0usize;
    let mut sell_count = 0usize;

    for exec in executions {
        fees_usdt += exec.fee_usdt;
        match exec.side {
            Side::Buy => {
                buy_qty += exec.qty;
                buy_notional += exec.qty * exec.price;
                buy_count += 1;
            }
            Side::Sell => {
                sell_qty += exec.qty;
                sell_notional += exec.qty * exec.price;
                sell_count += 1;
            }
        }
    }

    let avg_buy_price = if buy_qty > Decimal::ZERO {
        buy_notional / buy_qty
    } else {
        Decimal::ZERO
    };
    let avg_sell_price = if sell_qty > Decimal::ZERO {
        sell_notional / sell_qty
    } else {
        Decimal::ZERO
    };

    let realised_pnl_usdt = sell_notional - buy_notional - fees_usdt;

    PnlReport {
        buy_qty,
        sell_qty,
        avg_buy_price,
        avg_sell_price,
        fees_usdt,
        realised_pnl_usdt,
        buy_count,
        sell_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn exec(side: Side, qty: &str, price: &str, exec_time_ms: i64, fee: &str) -> ExecutionRecord {
        ExecutionRecord {
            order_id: "o".to_string(),
            side,
            qty: d(qty),
            price: d(price),
            exec_time_ms,
            fee_usdt: d(fee),
        }
    }

    #[test]
    fn short_round_trip_is_profitable_when_sell_exceeds_buy() {
        let execs = vec![
            exec(Side::Sell, "5", "5.00", 1000, "0"),
            exec(Side::Buy, "5", "4.99", 2000, "0"),
        ];
        let report = reconstruct(&execs);
        assert_eq!(report.realised_pnl_usdt, d("0.05"));
        assert_eq!(report.avg_buy_price, d("4.99"));
        assert_eq!(report.avg_sell_price, d("5.00"));
    }

    #[test]
    fn empty_execution_list_is_a_legitimate_zero_report() {
        let report = reconstruct(&[]);
        assert_eq!(report.realised_pnl_usdt, Decimal::ZERO);
        assert_eq!(report.buy_count, 0);
        assert_eq!(report.sell_count, 0);
    }

    #[test]
    fn fees_reduce_realised_pnl() {
        let execs = vec![
            exec(Side::Sell, "10", "5.00", 1000, "0.10"),
            exec(Side::Buy, "10", "4.95", 2000, "0.10"),
        ];
        let report = reconstruct(&execs);
        // (50.00 - 49.50) - 0.20 = 0.30
        assert_eq!(report.realised_pnl_usdt, d("0.30"));
    }

    #[test]
    fn pnl_additivity_across_disjoint_time_windows() {
        let execs = vec![
            exec(Side::Sell, "5", "5.00", 1000, "0.02"),
            exec(Side::Buy, "3", "4.99", 1500, "0.01"),
            exec(Side::Buy, "2", "4.98", 2500, "0.01"),
        ];

        let whole = reconstruct(&execs);

        let window_a: Vec<_> = execs.iter().filter(|e| e.exec_time_ms < 2000).cloned().collect();
        let window_b: Vec<_> = execs.iter().filter(|e| e.exec_time_ms >= 2000).cloned().collect();

        let report_a = reconstruct(&window_a);
        let report_b = reconstruct(&window_b);

        assert_eq!(
            whole.realised_pnl_usdt,
            report_a.realised_pnl_usdt + report_b.realised_pnl_usdt
        );
    }

    #[test]
    fn avg_price_is_volume_weighted() {
        let execs = vec![
            exec(Side::Buy, "2", "4.00", 1000, "0"),
            exec(Side::Buy, "8", "5.00", 1500, "0"),
        ];
        let report = reconstruct(&execs);
        // (2*4.00 + 8*5.00) / 10 = 4.80
        assert_eq!(report.avg_buy_price, d("4.80"));
    }
}

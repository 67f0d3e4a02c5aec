//! End-to-end integration tests for the CLI-reachable pipeline stages that
//! don't require a live exchange socket: spec parsing, clock estimation,
//! preflight resolution, and admission planning wired together against
//! `MockExchangeRest`. The three WebSocket streams (components B/C/D) need a
//! live Bybit endpoint and are covered instead by the inline unit tests in
//! `src/stream/`.

use std::str::FromStr;

use rust_decimal::Decimal;

use fun::clock::ServerClock;
use fun::config::FunConfig;
use fun::exchange::MockExchangeRest;
use fun::model::{AccountMode, Instrument, PayoutSpec, PositionIndex, Side};
use fun::orchestrator::admission_plan_bps;
use fun::preflight;

fn lpt_instrument() -> Instrument {
    Instrument {
        symbol: "LPTUSDT".to_string(),
        tick_size: Decimal::from_str("0.0001").unwrap(),
        qty_step: Decimal::from_str("0.01").unwrap(),
        min_qty: Decimal::from_str("0.01").unwrap(),
        account_mode: AccountMode::OneWay,
    }
}

#[tokio::test]
async fn full_pipeline_up_to_order_submission_resolves_a_trade_plan() {
    let mock = MockExchangeRest::new();
    mock.set_instrument(lpt_instrument());
    mock.set_server_time_offset_ms(25);
    mock.set_position(0, Side::Sell, Decimal::ZERO);

    let spec = PayoutSpec::parse("LPT Bybit 10 -0.5%").expect("spec parses");
    let config = FunConfig::default();

    let preflight_result = preflight::run(&mock, &spec, &config)
        .await
        .expect("preflight succeeds against a well-formed mock");
    assert_eq!(preflight_result.position_index, PositionIndex::OneWay);
    assert_eq!(preflight_result.short_before, Decimal::ZERO);

    let clock = ServerClock::estimate(&mock, fun::clock::DEFAULT_PROBE_COUNT)
        .await
        .expect("clock estimation succeeds against a well-formed mock");
    assert!((clock.offset().0 - 25).abs() <= 5);

    let entry_bps_plan = admission_plan_bps(&config, spec.funding_rate_pct);
    // funding = -0.5% = 50 bps; base 40 + 0.9*50 = 85, within [30, 2500]
    assert_eq!(entry_bps_plan, Decimal::from_str("85").unwrap());
}

#[tokio::test]
async fn preflight_rejects_a_spec_that_violates_the_instrument_step() {
    let mock = MockExchangeRest::new();
    let mut instrument = lpt_instrument();
    instrument.qty_step = Decimal::from_str("0.25").unwrap();
    mock.set_instrument(instrument);

    let spec = PayoutSpec::parse("LPT Bybit 10.1 -0.5%").expect("spec parses");
    let config = FunConfig::default();

    let result = preflight::run(&mock, &spec, &config).await;
    assert!(result.is_err(), "10.1 is not a multiple of the 0.25 qty step");
}

#[tokio::test]
async fn preflight_rejects_when_balance_does_not_clear_the_buffer() {
    let mock = MockExchangeRest::new();
    mock.set_instrument(lpt_instrument());

    let spec = PayoutSpec::parse("LPT Bybit 10 -0.5%").expect("spec parses");
    // Built directly rather than through FunConfig::from_env(), which reads
    // process-wide env vars shared with every other test in this binary.
    let mut config = FunConfig::default();
    config.balance_buffer_usdt = 1_000_000.0;

    let result = preflight::run(&mock, &spec, &config).await;
    assert!(result.is_err());
}

#[test]
fn rejects_a_non_negative_funding_spec_before_any_network_activity() {
    assert!(PayoutSpec::parse("LPT Bybit 10 0.1%").is_err());
}

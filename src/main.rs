//! Funding-payout harvesting engine entry point.
//!
//! Startup order: load config/env -> init tracing -> parse CLI -> construct
//! the exchange REST collaborator -> preflight -> estimate clock offset ->
//! connect the three streams -> hand off to the orchestrator -> print the
//! summary line -> drain logs -> exit with the code the error taxonomy picks.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use fun::clock::ServerClock;
use fun::config::{BybitCredentials, FunConfig};
use fun::exchange::{BybitRestClient, ExchangeRest};
use fun::model::PayoutSpec;
use fun::orchestrator::{Orchestrator, PayoutState};
use fun::preflight;
use fun::stream::{PrivateStream, PublicStream, TradeChannel};

/// Harvest a single negative perpetual-futures funding payout on Bybit.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// `"<SYMBOL> <EXCHANGE> <QTY> <FUNDING_PCT>"`, e.g. "LPT Bybit 10 -0.1%"
    payout_spec: String,
}

/// How long to wait for the first orderbook/ticker snapshot before giving
/// up on startup. Every other suspension point in this pipeline has a hard
/// timeout; a rejected subscription or dead symbol must not hang forever.
const PUBLIC_STREAM_READY_TIMEOUT_MS: u64 = 10_000;

async fn wait_for_public_ready(public: &PublicStream, timeout_ms: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while !public.ready() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("public market-data stream did not become ready within {timeout_ms}ms");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    Ok(())
}

fn main() -> ExitCode {
    fun::logging::load_env();
    let log_handle = fun::logging::init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run());

    let exit_code = match &result {
        Ok(summary) => {
            info!("{summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "fatal configurational error");
            ExitCode::FAILURE
        }
    };

    log_handle.drain();
    exit_code
}

async fn run() -> Result<String> {
    let args = Args::parse();
    let spec = PayoutSpec::parse(&args.payout_spec).context("invalid payout spec")?;
    let config = FunConfig::from_env();
    let creds = BybitCredentials::from_env().context("missing or invalid Bybit credentials")?;

    let exchange: Arc<dyn ExchangeRest> = Arc::new(BybitRestClient::new(creds.clone()));

    info!(symbol = %spec.symbol, qty = %spec.qty, funding_pct = %spec.funding_rate_pct, "preflight_start");
    let preflight_result = preflight::run(exchange.as_ref(), &spec, &config)
        .await
        .context("preflight failed")?;

    let clock = ServerClock::estimate(exchange.as_ref(), fun::clock::DEFAULT_PROBE_COUNT)
        .await
        .context("failed to estimate server clock offset")?;

    let public = PublicStream::connect(&spec.symbol)
        .await
        .context("failed to connect public market-data stream")?;
    let private = PrivateStream::connect(&creds)
        .await
        .context("failed to connect private account stream")?;
    let trade = TradeChannel::connect(&creds)
        .await
        .context("failed to connect trade-submission channel")?;

    wait_for_public_ready(&public, PUBLIC_STREAM_READY_TIMEOUT_MS).await?;

    let payout_server_ms = next_funding_boundary_ms(clock.now_server_ms(), &config);

    let orchestrator = Orchestrator {
        clock: &clock,
        public: public.clone(),
        private: private.clone(),
        trade: trade.clone(),
        exchange: exchange.as_ref(),
        config: &config,
    };

    let outcome = orchestrator.run(&spec, &preflight_result, payout_server_ms).await?;

    public.stop();
    private.stop();
    trade.stop();

    Ok(summary_line(&spec, &outcome))
}

/// Bybit settles linear-perpetual funding on fixed UTC boundaries (commonly
/// every 8 hours). The funding-opportunity scanner that would normally
/// supply an exact payout instant is an out-of-scope external collaborator
/// (§1), so this picks the next 8-hour boundary that still clears the
/// configured prep lead.
fn next_funding_boundary_ms(now_server_ms: i64, config: &FunConfig) -> i64 {
    const FUNDING_INTERVAL_MS: i64 = 8 * 60 * 60 * 1000;
    let lead_ms = config.fast_prep_lead().as_millis() as i64;

    let mut boundary = ((now_server_ms / FUNDING_INTERVAL_MS) + 1) * FUNDING_INTERVAL_MS;
    if boundary - now_server_ms < lead_ms {
        boundary += FUNDING_INTERVAL_MS;
    }
    boundary
}

fn summary_line(spec: &PayoutSpec, outcome: &fun::orchestrator::PayoutOutcome) -> String {
    let pnl_str = outcome
        .pnl
        .as_ref()
        .map(|p| format!("pnl_usdt={}", p.realised_pnl_usdt))
        .unwrap_or_else(|| "pnl_usdt=n/a".to_string());

    let state_str = match outcome.state {
        PayoutState::SkipStale => "SKIP_STALE",
        PayoutState::SkipDown => "SKIP_DOWN",
        PayoutState::NoFill => "NO_FILL",
        PayoutState::Closed => "CLOSED",
        PayoutState::ResidualOpen => "RESIDUAL_OPEN",
    };

    format!(
        "fun_summary symbol={} state={} opened_qty={} closed_qty={} {}{}",
        spec.symbol,
        state_str,
        outcome.opened_qty,
        outcome.closed_qty,
        pnl_str,
        outcome
            .note
            .as_ref()
            .map(|n| format!(" note={n:?}"))
            .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_boundary_lands_on_an_8_hour_multiple() {
        let config = FunConfig::default();
        let now = 1_000; // just after epoch
        let boundary = next_funding_boundary_ms(now, &config);
        assert_eq!(boundary % (8 * 60 * 60 * 1000), 0);
        assert!(boundary > now);
    }

    #[test]
    fn funding_boundary_skips_ahead_when_too_close() {
        let config = FunConfig::default();
        let interval = 8 * 60 * 60 * 1000;
        let near_boundary = interval - 500; // 500ms before next boundary
        let boundary = next_funding_boundary_ms(near_boundary, &config);
        assert!(boundary - near_boundary >= config.fast_prep_lead().as_millis() as i64);
    }
}

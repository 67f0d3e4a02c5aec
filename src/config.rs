//! Runtime configuration, assembled from environment variables.
//!
//! Every field has a sane default, overridden by a `FUN_*`-prefixed env var
//! with parse-or-default semantics.

use std::env;
use std::time::Duration;

use crate::error::FunError;

#[derive(Debug, Clone)]
pub struct FunConfig {
    // Timing
    pub fast_prep_lead_sec: f64,
    pub fast_close_delay_sec: f64,
    pub fast_close_max_attempts: u32,
    pub open_early_ms: i64,
    pub ws_fix_lead_ms: i64,
    pub late_tol_ms: i64,

    // Admission
    pub entry_base_bps: f64,
    pub entry_funding_mult: f64,
    pub entry_min_bps: f64,
    pub entry_max_bps: f64,

    // Pricing
    pub open_limit_ticks: u32,
    pub open_safety_ticks: u32,
    pub open_safety_min_ticks: u32,

    // Safety
    pub open_max_staleness_ms: i64,
    pub balance_buffer_usdt: f64,
    pub balance_fee_safety_bps: f64,

    // Channels
    pub use_trade_ws: bool,
}

impl Default for FunConfig {
    fn default() -> Self {
        Self {
            fast_prep_lead_sec: 2.0,
            fast_close_delay_sec: 1.2,
            fast_close_max_attempts: 15,
            open_early_ms: 30,
            ws_fix_lead_ms: 30,
            late_tol_ms: 400,

            entry_base_bps: 40.0,
            entry_funding_mult: 0.9,
            entry_min_bps: 30.0,
            entry_max_bps: 2500.0,

            open_limit_ticks: 1,
            open_safety_ticks: 1,
            open_safety_min_ticks: 3,

            open_max_staleness_ms: 200,
            balance_buffer_usdt: 0.0,
            balance_fee_safety_bps: 20.0,

            use_trade_ws: true,
        }
    }
}

impl FunConfig {
    /// Load from environment, falling back to defaults for anything unset
    /// or unparseable: a bad value never aborts the process, it just keeps
    /// the default.
    pub fn from_env() -> Self {
        let mut c = Self::default();

        read_f64(&mut c.fast_prep_lead_sec, "FUN_FAST_PREP_LEAD_SEC");
        read_f64(&mut c.fast_close_delay_sec, "FUN_FAST_CLOSE_DELAY_SEC");
        read_u32(&mut c.fast_close_max_attempts, "FUN_FAST_CLOSE_MAX_ATTEMPTS");
        read_i64(&mut c.open_early_ms, "FUN_OPEN_EARLY_MS");
        read_i64(&mut c.ws_fix_lead_ms, "FUN_WS_FIX_LEAD_MS");
        read_i64(&mut c.late_tol_ms, "FUN_LATE_TOL_MS");

        read_f64(&mut c.entry_base_bps, "FUN_ENTRY_BASE_BPS");
        read_f64(&mut c.entry_funding_mult, "FUN_ENTRY_FUNDING_MULT");
        read_f64(&mut c.entry_min_bps, "FUN_ENTRY_MIN_BPS");
        read_f64(&mut c.entry_max_bps, "FUN_ENTRY_MAX_BPS");

        read_u32(&mut c.open_limit_ticks, "FUN_OPEN_LIMIT_TICKS");
        read_u32(&mut c.open_safety_ticks, "FUN_OPEN_SAFETY_TICKS");
        read_u32(&mut c.open_safety_min_ticks, "FUN_OPEN_SAFETY_MIN_TICKS");

        read_i64(&mut c.open_max_staleness_ms, "FUN_OPEN_MAX_STALENESS_MS");
        read_f64(&mut c.balance_buffer_usdt, "FUN_BALANCE_BUFFER_USDT");
        read_f64(&mut c.balance_fee_safety_bps, "FUN_BALANCE_FEE_SAFETY_BPS");

        if let Ok(v) = env::var("FUN_USE_TRADE_WS") {
            c.use_trade_ws = v != "0";
        }

        c
    }

    #[inline]
    pub fn fast_prep_lead(&self) -> Duration {
        Duration::from_secs_f64(self.fast_prep_lead_sec.max(0.0))
    }

    #[inline]
    pub fn fast_close_delay_ms(&self) -> i64 {
        (self.fast_close_delay_sec * 1000.0).round() as i64
    }

    #[inline]
    pub fn entry_ticks(&self) -> u32 {
        self.open_limit_ticks
            .max(self.open_safety_ticks)
            .max(self.open_safety_min_ticks)
            .max(1)
    }
}

fn read_f64(field: &mut f64, var: &str) {
    if let Ok(v) = env::var(var) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

fn read_i64(field: &mut i64, var: &str) {
    if let Ok(v) = env::var(var) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

fn read_u32(field: &mut u32, var: &str) {
    if let Ok(v) = env::var(var) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

/// Bybit REST/WS credentials, required before any network activity starts.
#[derive(Clone)]
pub struct BybitCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub recv_window_ms: u64,
}

impl std::fmt::Debug for BybitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitCredentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("testnet", &self.testnet)
            .field("recv_window_ms", &self.recv_window_ms)
            .finish()
    }
}

impl BybitCredentials {
    pub fn from_env() -> Result<Self, FunError> {
        let api_key = env::var("BYBIT_API_KEY")
            .map_err(|_| FunError::config("BYBIT_API_KEY is not set"))?;
        let api_secret = env::var("BYBIT_API_SECRET")
            .map_err(|_| FunError::config("BYBIT_API_SECRET is not set"))?;

        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(FunError::config("BYBIT_API_KEY/BYBIT_API_SECRET must not be empty"));
        }

        let testnet = env::var("BYBIT_TESTNET")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(false);

        let recv_window_ms = env::var("BYBIT_RECV_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        Ok(Self {
            api_key,
            api_secret,
            testnet,
            recv_window_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = FunConfig::default();
        assert_eq!(c.entry_base_bps, 40.0);
        assert_eq!(c.entry_min_bps, 30.0);
        assert_eq!(c.entry_max_bps, 2500.0);
        assert_eq!(c.fast_close_max_attempts, 15);
        assert!(c.use_trade_ws);
    }

    #[test]
    fn entry_ticks_takes_the_max() {
        let mut c = FunConfig::default();
        c.open_limit_ticks = 1;
        c.open_safety_ticks = 1;
        c.open_safety_min_ticks = 3;
        assert_eq!(c.entry_ticks(), 3);
    }
}

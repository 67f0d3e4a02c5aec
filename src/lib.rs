//! Funding-payout harvesting engine (the `fun` pipeline).
//!
//! Exposes the components as a library so the integration tests under
//! `tests/` and the `fun` binary share one implementation.

pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod pnl;
pub mod preflight;
pub mod quantize;
pub mod stream;

//! Clock & Server-Time Estimator (component A).
//!
//! Takes N round-trip probes of the exchange's server-time endpoint and
//! fixes a single offset for the remainder of the run: one CLI invocation
//! covers one payout and finishes in well under a minute, so periodic
//! resampling buys nothing here.
//!
//! `sleep_until_server_ms` anchors the offset to a `tokio::time::Instant`
//! captured once at estimation time — capture a mono anchor, derive
//! everything from elapsed time since, landing on absolute wall-clock
//! payout instants rather than just measuring round-trip latency.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::error::{FunError, FunResult};
use crate::exchange::ExchangeRest;
use crate::model::ServerTimeOffset;

pub const DEFAULT_PROBE_COUNT: usize = 5;

fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

pub struct ServerClock {
    offset: ServerTimeOffset,
    anchor_local_ms: i64,
    anchor_instant: Instant,
}

impl ServerClock {
    /// Probe `exchange.server_time_ms()` `probe_count` times and fix the
    /// offset as the median of `server_ms - (send_ms + recv_ms)/2`.
    pub async fn estimate(exchange: &dyn ExchangeRest, probe_count: usize) -> FunResult<Self> {
        if probe_count == 0 {
            return Err(FunError::config("probe_count must be >= 1"));
        }

        let mut samples = Vec::with_capacity(probe_count);
        for i in 0..probe_count {
            let send_ms = local_now_ms();
            let server_ms = exchange.server_time_ms().await?;
            let recv_ms = local_now_ms();
            let mid_local = (send_ms + recv_ms) / 2;
            let offset = server_ms - mid_local;
            debug!(probe = i, send_ms, recv_ms, server_ms, offset, "clock_probe");
            samples.push(offset);
        }

        samples.sort_unstable();
        let median = samples[samples.len() / 2];

        info!(offset_ms = median, probes = probe_count, "server_time_offset_fixed");

        Ok(Self {
            offset: ServerTimeOffset(median),
            anchor_local_ms: local_now_ms(),
            anchor_instant: Instant::now(),
        })
    }

    #[inline]
    pub fn offset(&self) -> ServerTimeOffset {
        self.offset
    }

    #[inline]
    pub fn now_server_ms(&self) -> i64 {
        let elapsed_ms = self.anchor_instant.elapsed().as_millis() as i64;
        self.offset.to_server_ms(self.anchor_local_ms + elapsed_ms)
    }

    /// Suspend until `deadline_server_ms` in server time. The caller decides
    /// whether overshoot or undershoot is preferable (see the orchestrator's
    /// open/close deadlines); this just computes the local instant and waits.
    pub async fn sleep_until_server_ms(&self, deadline_server_ms: i64) {
        let deadline_local_ms = self.offset.to_local_ms(deadline_server_ms);
        let delta_ms = deadline_local_ms - self.anchor_local_ms;
        let target = self.anchor_instant + std::time::Duration::from_millis(delta_ms.max(0) as u64);
        if target > Instant::now() {
            sleep_until(target).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeRest;

    #[tokio::test]
    async fn offset_is_median_of_probes() {
        let mock = MockExchangeRest::new();
        // Each call to server_time_ms returns local_now_ms() + 100 in the mock,
        // so the offset should land close to +100ms regardless of probe count.
        mock.set_server_time_offset_ms(100);
        let clock = ServerClock::estimate(&mock, 5).await.unwrap();
        assert!((clock.offset().0 - 100).abs() <= 5);
    }

    #[tokio::test]
    async fn sleep_until_server_ms_does_not_undershoot_for_future_deadline() {
        let mock = MockExchangeRest::new();
        mock.set_server_time_offset_ms(0);
        let clock = ServerClock::estimate(&mock, 1).await.unwrap();

        let start = std::time::Instant::now();
        let deadline = clock.now_server_ms() + 50;
        clock.sleep_until_server_ms(deadline).await;
        assert!(start.elapsed().as_millis() as i64 >= 40);
    }
}

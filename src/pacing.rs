//! Sub-millisecond waits for pin timing.
//!
//! Tokio's timer wheel resolves to one millisecond, which is too coarse for
//! pulse widths and illumination holds given in microseconds. A [`Pacer`]
//! sleeps on the timer until `spin` before the deadline and busy-waits the
//! rest on the blocking pool, so the async worker threads stay free.
//!
//! A zero `spin` leaves everything to the timer. Tests that run under a paused
//! Tokio clock use that, since the virtual clock does not move while a
//! blocking task spins.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::error::AppResult;

/// Deadline-based waiting with a busy-wait tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    spin: Duration,
}

impl Pacer {
    /// Busy-wait the final `spin` before every deadline.
    pub fn new(spin: Duration) -> Self {
        Self { spin }
    }

    /// Timer-only pacing, one millisecond resolution.
    pub fn coarse() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Length of the busy-wait tail.
    pub fn spin(&self) -> Duration {
        self.spin
    }

    /// Wait until `deadline`.
    ///
    /// Returns immediately if the deadline has already passed.
    pub async fn wait_until(&self, deadline: Instant) -> AppResult<()> {
        if self.spin.is_zero() {
            sleep_until(deadline).await;
            return Ok(());
        }

        if let Some(coarse_end) = deadline.checked_sub(self.spin) {
            if coarse_end > Instant::now() {
                sleep_until(coarse_end).await;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        let target = std::time::Instant::now() + remaining;
        tokio::task::spawn_blocking(move || spin_until(target)).await?;
        Ok(())
    }

    /// Wait for `duration` from now.
    pub async fn wait(&self, duration: Duration) -> AppResult<()> {
        self.wait_until(Instant::now() + duration).await
    }
}

#[inline(always)]
fn spin_until(target: std::time::Instant) {
    while std::time::Instant::now() < target {
        std::hint::spin_loop();
    }
}

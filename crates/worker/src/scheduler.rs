//! Daily token lifecycle driver.
//!
//! On each tick the scheduler makes sure today's pool and allocations exist
//! and, once the local clock passes the rotation hour, rotates today's
//! unused free-tier tokens. Every step is idempotent, so a missed or
//! repeated tick is harmless and failures are simply retried on the next
//! one.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::clock::Clock;
use chorus_core::day_key::{DayCalendar, DayKey};
use chorus_economy::{EconomyError, TokenEconomy};
use tokio_util::sync::CancellationToken;

pub struct DailyScheduler {
    economy: Arc<TokenEconomy>,
    clock: Arc<dyn Clock>,
    calendar: DayCalendar,
    rotation_hour: u32,
    interval: Duration,
    /// Last day whose pool and allocations were set up by this process.
    prepared: Option<DayKey>,
    /// Last day this process saw rotated.
    rotated: Option<DayKey>,
}

impl DailyScheduler {
    pub fn new(
        economy: Arc<TokenEconomy>,
        clock: Arc<dyn Clock>,
        calendar: DayCalendar,
        rotation_hour: u32,
        interval: Duration,
    ) -> Self {
        Self {
            economy,
            clock,
            calendar,
            rotation_hour,
            interval,
            prepared: None,
            rotated: None,
        }
    }

    /// Run the scheduler loop until `cancel` is triggered.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            rotation_hour = self.rotation_hour,
            interval_secs = self.interval.as_secs(),
            "Daily scheduler started",
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Daily scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(
                            error = %e,
                            retryable = e.is_retryable(),
                            "Daily scheduler tick failed",
                        );
                    }
                }
            }
        }
    }

    /// One pass: prepare today if needed, then rotate if due.
    pub async fn tick(&mut self) -> Result<(), EconomyError> {
        let now = self.clock.now();
        let today = self.calendar.day_key(now);

        if self.prepared != Some(today) {
            let pool = self.economy.ensure_daily_pool(today).await?;
            self.economy.allocate_daily(today).await?;
            if pool.is_rotated() {
                self.rotated = Some(today);
            }
            self.prepared = Some(today);
        }

        let due = now >= self.calendar.at_hour(today, self.rotation_hour);
        if due && self.rotated != Some(today) {
            self.economy.rotate_unused(today).await?;
            self.rotated = Some(today);
        }
        Ok(())
    }
}

//! Repeats backup runs on a fixed period until shutdown.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::orchestrator::{RunError, RunReport};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Fixed-period schedule. The first run starts immediately.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Schedule {
    period: Duration,
}

impl Schedule {
    /// Runs every `period`.
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Runs every `days` days.
    #[must_use]
    pub fn every_days(days: NonZeroU32) -> Self {
        Self::new(Duration::from_secs(u64::from(days.get()) * SECONDS_PER_DAY))
    }

    /// Time between the start of two runs.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Calls `job` once per period until `shutdown` completes and returns how
    /// many runs were started.
    ///
    /// A failed run is logged and the schedule carries on. A run in progress
    /// when `shutdown` fires is allowed to finish.
    pub async fn run<F, Fut, S>(&self, mut job: F, shutdown: S) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RunReport, RunError>>,
        S: Future<Output = ()>,
    {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut runs = 0;
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!(runs, "shutdown requested, stopping schedule");
                    return runs;
                }
                _ = ticker.tick() => {}
            }

            runs += 1;
            match job().await {
                Ok(report) => info!(
                    run = runs,
                    completed = report.completed,
                    failed = report.failed,
                    "scheduled run finished"
                ),
                Err(err) => error!(run = runs, err = %err, "scheduled run failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[test]
    fn every_days_scales_to_seconds() {
        let days = NonZeroU32::new(3).expect("non-zero");
        assert_eq!(
            Schedule::every_days(days).period(),
            Duration::from_secs(3 * 86_400)
        );
    }

    #[tokio::test]
    async fn runs_until_shutdown_and_survives_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(Notify::new());
        let schedule = Schedule::new(Duration::from_millis(5));

        let job = {
            let calls = Arc::clone(&calls);
            let stop = Arc::clone(&stop);
            move || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call == 3 {
                    stop.notify_one();
                }
                async move {
                    if call == 1 {
                        Err(RunError::Validation(ValidationError::SingleHostMissing))
                    } else {
                        Ok(RunReport::default())
                    }
                }
            }
        };
        let shutdown = {
            let stop = Arc::clone(&stop);
            async move { stop.notified().await }
        };

        let runs = schedule.run(job, shutdown).await;

        assert_eq!(runs, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn immediate_shutdown_skips_every_run() {
        let schedule = Schedule::new(Duration::from_secs(3600));

        let runs = schedule
            .run(|| async { Ok(RunReport::default()) }, async {})
            .await;

        assert_eq!(runs, 0);
    }
}

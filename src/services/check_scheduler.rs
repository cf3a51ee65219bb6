//! Periodic check + publish loop

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info, instrument};

use crate::proxy::health::{BatchReport, ProxyChecker};
use crate::services::publisher::SubscriptionPublisher;

pub struct CheckScheduler {
    checker: Arc<ProxyChecker>,
    publisher: Arc<SubscriptionPublisher>,
    check_interval: Duration,
}

impl CheckScheduler {
    pub fn new(
        checker: Arc<ProxyChecker>,
        publisher: Arc<SubscriptionPublisher>,
        check_interval: Duration,
    ) -> Self {
        Self {
            checker,
            publisher,
            check_interval,
        }
    }

    /// Run until shutdown (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting check scheduler with {}s interval",
            self.check_interval.as_secs()
        );

        let mut ticker = check_ticker(self.check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_iteration().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Check scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One check batch followed by a publish
    ///
    /// A skipped batch still publishes so the selector can age its state.
    pub async fn run_iteration(&self) -> Option<BatchReport> {
        let report = self.checker.check_all_proxies().await.ok();

        if let Err(e) = self.publisher.publish(Utc::now()).await {
            error!("Publishing failed: {}", e);
        }

        report
    }
}

/// First tick fires immediately; an overrunning batch pushes the schedule
/// back instead of triggering catch-up batches.
fn check_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

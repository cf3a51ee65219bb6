//! Descriptor source loading and refresh
//!
//! The descriptor list is produced by an external collaborator as a JSON
//! array. The refresh loop swaps it into the checker only when it actually
//! changed, so unrelated rewrites of the file do not reset check state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::ProxyDescriptor;
use crate::proxy::health::ProxyChecker;

/// Read a JSON descriptor list
pub async fn load_descriptors(path: &Path) -> Result<Vec<ProxyDescriptor>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let proxies: Vec<ProxyDescriptor> = serde_json::from_str(&raw)?;
    Ok(proxies)
}

/// Same descriptors, same order, same published representation
pub fn same_descriptor_set<A, B>(current: &[A], next: &[B]) -> bool
where
    A: AsRef<ProxyDescriptor>,
    B: AsRef<ProxyDescriptor>,
{
    current.len() == next.len()
        && current
            .iter()
            .zip(next)
            .all(|(a, b)| a.as_ref().same_as(b.as_ref()))
}

pub struct SourceRefreshService {
    checker: Arc<ProxyChecker>,
    path: PathBuf,
    refresh_interval: Duration,
}

impl SourceRefreshService {
    pub fn new(checker: Arc<ProxyChecker>, path: PathBuf, refresh_interval: Duration) -> Self {
        Self {
            checker,
            path,
            refresh_interval,
        }
    }

    /// Run until shutdown (call in a spawned task)
    #[instrument(skip(self, shutdown), fields(path = %self.path.display()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting source refresh with {}s interval",
            self.refresh_interval.as_secs()
        );

        let mut ticker = interval(self.refresh_interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Failed to refresh proxy source: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Source refresh shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reload the source; returns whether the checker's set was replaced
    pub async fn refresh(&self) -> Result<bool> {
        let next = load_descriptors(&self.path).await?;
        let current = self.checker.get_proxies();

        if same_descriptor_set(&current, &next) {
            debug!(count = next.len(), "Proxy source unchanged");
            return Ok(false);
        }

        self.checker.update_proxies(next);
        Ok(true)
    }
}

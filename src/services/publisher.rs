//! Meta-subscription publisher
//!
//! Recomputes the selector output from the checker's current state, keeps the
//! latest list in a lock-free snapshot and mirrors it (plus the exported
//! gauges) to files for external consumers.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, instrument};

use crate::config::PublishConfig;
use crate::error::Result;
use crate::metrics::ProxyMetrics;
use crate::proxy::health::ProxyChecker;
use crate::proxy::ranking::StableSelector;

pub struct SubscriptionPublisher {
    checker: Arc<ProxyChecker>,
    selector: StableSelector,
    config: PublishConfig,
    metrics: Option<Arc<ProxyMetrics>>,
    latest: ArcSwap<Vec<String>>,
}

impl SubscriptionPublisher {
    pub fn new(checker: Arc<ProxyChecker>, selector: StableSelector, config: PublishConfig) -> Self {
        Self {
            checker,
            selector,
            config,
            metrics: None,
            latest: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Mirror these gauges to the metrics file on every publish
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the selector and write its output
    #[instrument(skip(self))]
    pub async fn publish(&self, now: DateTime<Utc>) -> Result<Arc<Vec<String>>> {
        let proxies = self.checker.get_proxies();
        let links = self.selector.next(
            &proxies,
            |id| self.checker.get_proxy_status_by_stable_id(id),
            now,
        );
        let links = Arc::new(links);
        self.latest.store(links.clone());

        if let Some(path) = &self.config.output_file {
            write_atomic(path, &render(&links)).await?;
            debug!(path = %path.display(), count = links.len(), "Wrote published list");
        }
        if let (Some(path), Some(metrics)) = (&self.config.metrics_file, &self.metrics) {
            write_atomic(path, &metrics.encode()?).await?;
        }

        Ok(links)
    }

    /// Most recent selector output
    pub fn latest(&self) -> Arc<Vec<String>> {
        self.latest.load_full()
    }

    /// Most recent output, newline-joined
    pub fn render_latest(&self) -> String {
        render(&self.latest.load())
    }
}

fn render(links: &[String]) -> String {
    if links.is_empty() {
        return String::new();
    }
    let mut out = links.join("\n");
    out.push('\n');
    out
}

/// Write via a sibling temp file and rename so readers never see a torn file
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::error::VigilError;
    use crate::models::ProxyDescriptor;
    use crate::proxy::probe::{ProbeSuccess, Prober};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(&self, proxy: &ProxyDescriptor) -> Result<ProbeSuccess> {
            if proxy.name.contains("down") {
                return Err(VigilError::Protocol("Status: 503".into()));
            }
            Ok(ProbeSuccess {
                latency: Duration::from_millis(100 + u64::from(proxy.index)),
                detail: "ok".to_string(),
            })
        }
    }

    fn descriptor(name: &str, index: u16) -> ProxyDescriptor {
        let mut proxy = ProxyDescriptor::new("trojan", &format!("10.0.0.{}", index), 443);
        proxy.name = name.to_string();
        proxy.password = format!("pw{}", index);
        proxy.index = index;
        proxy.source_line = format!("trojan://pw{}@10.0.0.{}:443#{}", index, index, name);
        proxy
    }

    #[tokio::test]
    async fn test_publish_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sub.txt");
        let metrics_path = dir.path().join("proxies.prom");

        let metrics = Arc::new(ProxyMetrics::new("").unwrap());
        let checker = Arc::new(
            ProxyChecker::with_prober(
                Arc::new(AlwaysUp),
                4,
                vec![descriptor("BL a", 1), descriptor("CIDR b", 2), descriptor("BL down", 3)],
            )
            .with_metrics(metrics.clone()),
        );
        checker.check_all_proxies().await.unwrap();

        let publisher = SubscriptionPublisher::new(
            checker,
            StableSelector::new(SelectorConfig::default()),
            PublishConfig {
                output_file: Some(output.clone()),
                metrics_file: Some(metrics_path.clone()),
                ..Default::default()
            },
        )
        .with_metrics(metrics);

        let links = publisher.publish(Utc::now()).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links[0].ends_with("#BL a"));

        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(written, publisher.render_latest());
        assert_eq!(written.lines().count(), 2);

        let exported = std::fs::read_to_string(&metrics_path).unwrap();
        assert!(exported.contains("proxy_latency_ms"));
        assert!(exported.contains("name=\"BL down\""));
    }

    #[tokio::test]
    async fn test_latest_without_files() {
        let checker = Arc::new(ProxyChecker::with_prober(Arc::new(AlwaysUp), 1, Vec::new()));
        let publisher = SubscriptionPublisher::new(
            checker,
            StableSelector::new(SelectorConfig::default()),
            PublishConfig::default(),
        );
        assert!(publisher.latest().is_empty());

        let links = publisher.publish(Utc::now()).await.unwrap();
        assert!(links.is_empty());
        assert_eq!(publisher.render_latest(), "");
    }

    #[tokio::test]
    async fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_atomic(&path, "one\n").await.unwrap();
        write_atomic(&path, "two\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two\n");
        assert!(!dir.path().join("out.txt.tmp").exists());
    }
}

//! Batch reachability checking
//!
//! The checker owns the live descriptor set and the per-identity results.
//! Every batch snapshots the set together with its generation; results are
//! applied only while that generation is still current, so a swap in the
//! middle of a batch never leaks stale results into the new set.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{CheckerConfig, DEFAULT_CHECK_CONCURRENCY};
use crate::error::{Result, VigilError};
use crate::metrics::ProxyMetrics;
use crate::models::{ProxyDescriptor, ProxyStatus};
use crate::proxy::probe::{HttpProber, ProbeSuccess, Prober};
use crate::proxy::state::StatusStore;

/// Summary of one check batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Probes started
    pub checked: usize,
    pub online: usize,
    pub offline: usize,
    /// Results discarded because the proxy set changed mid-batch
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct LiveSet {
    proxies: Vec<Arc<ProxyDescriptor>>,
    generation: u64,
}

enum Applied {
    Online,
    Offline,
    Discarded,
}

/// Reachability checker for the current proxy set
pub struct ProxyChecker {
    live: RwLock<LiveSet>,
    store: StatusStore,
    prober: Arc<dyn Prober>,
    concurrency: usize,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ProxyChecker {
    /// Create a checker probing over HTTP through the local tunnels
    pub fn new(config: &CheckerConfig, proxies: Vec<ProxyDescriptor>) -> Result<Self> {
        let prober = HttpProber::new(config.clone())?;
        Ok(Self::with_prober(Arc::new(prober), config.concurrency, proxies))
    }

    /// Create a checker with a custom probe strategy
    pub fn with_prober(
        prober: Arc<dyn Prober>,
        concurrency: usize,
        proxies: Vec<ProxyDescriptor>,
    ) -> Self {
        let concurrency = if concurrency == 0 {
            DEFAULT_CHECK_CONCURRENCY
        } else {
            concurrency
        };

        Self {
            live: RwLock::new(LiveSet {
                proxies: proxies.into_iter().map(Arc::new).collect(),
                generation: 0,
            }),
            store: StatusStore::new(),
            prober,
            concurrency,
            metrics: None,
        }
    }

    /// Export every applied result through these gauges
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Probe every proxy in the current set
    ///
    /// Fails only when the batch could not start (e.g. own IP unknown in
    /// `ip` mode); individual probe failures are recorded as offline.
    #[instrument(skip(self), fields(concurrency = self.concurrency))]
    pub async fn check_all_proxies(&self) -> Result<BatchReport> {
        if let Err(e) = self.prober.prepare().await {
            warn!("Skipping check batch: {}", e);
            return Err(e);
        }

        let (proxies, generation) = {
            let live = self.live.read();
            (live.proxies.clone(), live.generation)
        };

        if proxies.is_empty() {
            debug!("No proxies to check");
            return Ok(BatchReport::default());
        }

        info!(count = proxies.len(), generation, "Checking proxies");

        let results: Vec<Applied> = futures::stream::iter(proxies)
            .map(|proxy| async move { self.check_proxy(&proxy, generation).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BatchReport {
            checked: results.len(),
            ..Default::default()
        };
        for result in &results {
            match result {
                Applied::Online => report.online += 1,
                Applied::Offline => report.offline += 1,
                Applied::Discarded => report.skipped += 1,
            }
        }

        if report.skipped > 0 {
            debug!(
                skipped = report.skipped,
                "Discarded results from a replaced proxy set"
            );
        }
        info!(
            online = report.online,
            offline = report.offline,
            "Check batch completed"
        );

        Ok(report)
    }

    async fn check_proxy(&self, proxy: &ProxyDescriptor, generation: u64) -> Applied {
        let outcome = self.prober.probe(proxy).await;

        match &outcome {
            Ok(success) => info!(
                proxy = %proxy.name,
                latency_ms = success.latency.as_millis() as u64,
                "Check passed | {}",
                success.detail
            ),
            Err(e) if e.is_configuration() => {
                error!(proxy = %proxy.name, "Check misconfigured: {}", e)
            }
            Err(e) => warn!(proxy = %proxy.name, "Check failed: {}", e),
        }

        self.apply(proxy, generation, &outcome)
    }

    fn apply(
        &self,
        proxy: &ProxyDescriptor,
        generation: u64,
        outcome: &Result<ProbeSuccess>,
    ) -> Applied {
        // Held across the write so update_proxies cannot interleave.
        let live = self.live.read();
        if live.generation != generation {
            return Applied::Discarded;
        }

        let now = Utc::now();
        let id = proxy.stable_id();
        let (applied, latency) = match outcome {
            Ok(success) => {
                self.store.record_success(id, success.latency, now);
                (Applied::Online, success.latency)
            }
            Err(_) => {
                self.store.record_failure(id, now);
                (Applied::Offline, Duration::ZERO)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record(proxy, matches!(applied, Applied::Online), latency);
        }

        applied
    }

    /// Replace the whole proxy set
    ///
    /// Every recorded status is dropped; in-flight results of older batches
    /// are discarded.
    pub fn update_proxies(&self, proxies: Vec<ProxyDescriptor>) {
        let mut live = self.live.write();
        live.generation += 1;
        live.proxies = proxies.into_iter().map(Arc::new).collect();
        self.store.clear();
        if let Some(metrics) = &self.metrics {
            metrics.clear();
        }

        info!(
            count = live.proxies.len(),
            generation = live.generation,
            "Proxy set replaced"
        );
    }

    /// Status of the first proxy with this display name
    pub fn get_proxy_status(&self, name: &str) -> Result<ProxyStatus> {
        let id = self
            .live
            .read()
            .proxies
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.stable_id().to_string())
            .ok_or_else(|| VigilError::NotFound(format!("proxy {}", name)))?;
        self.recorded_status(&id)
    }

    /// Status of the proxy with this stable identity
    pub fn get_proxy_status_by_stable_id(&self, id: &str) -> Result<ProxyStatus> {
        if self.get_proxy_by_stable_id(id).is_none() {
            return Err(VigilError::NotFound(format!("proxy with identity {}", id)));
        }
        self.recorded_status(id)
    }

    fn recorded_status(&self, id: &str) -> Result<ProxyStatus> {
        self.store
            .get(id)
            .ok_or_else(|| VigilError::NotFound(format!("no check recorded for {}", id)))
    }

    /// Start of the proxy's current bad period, if any
    pub fn get_bad_since(&self, proxy: &ProxyDescriptor) -> Option<DateTime<Utc>> {
        self.store.bad_since(proxy.stable_id())
    }

    pub fn get_proxies(&self) -> Vec<Arc<ProxyDescriptor>> {
        self.live.read().proxies.clone()
    }

    pub fn get_proxy_by_stable_id(&self, id: &str) -> Option<Arc<ProxyDescriptor>> {
        self.live
            .read()
            .proxies
            .iter()
            .find(|p| p.stable_id() == id)
            .cloned()
    }

    /// Incremented on every proxy set swap
    pub fn generation(&self) -> u64 {
        self.live.read().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckMethod;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Answers from a fixed table keyed by proxy name
    struct TableProber {
        latencies: HashMap<String, Option<u64>>,
    }

    impl TableProber {
        fn new(entries: &[(&str, Option<u64>)]) -> Self {
            Self {
                latencies: entries
                    .iter()
                    .map(|(name, ms)| (name.to_string(), *ms))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Prober for TableProber {
        async fn probe(&self, proxy: &ProxyDescriptor) -> Result<ProbeSuccess> {
            match self.latencies.get(&proxy.name).copied().flatten() {
                Some(ms) => Ok(ProbeSuccess {
                    latency: Duration::from_millis(ms),
                    detail: "ok".to_string(),
                }),
                None => Err(VigilError::Transport("connection refused".into())),
            }
        }
    }

    /// Blocks every probe until released
    struct GatedProber {
        gate: Semaphore,
        started: AtomicUsize,
    }

    #[async_trait]
    impl Prober for GatedProber {
        async fn probe(&self, _proxy: &ProxyDescriptor) -> Result<ProbeSuccess> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| VigilError::Internal(e.to_string()))?;
            Ok(ProbeSuccess {
                latency: Duration::from_millis(10),
                detail: "ok".to_string(),
            })
        }
    }

    struct FailingPrepare;

    #[async_trait]
    impl Prober for FailingPrepare {
        async fn prepare(&self) -> Result<()> {
            Err(VigilError::EgressIpUnavailable("unreachable".into()))
        }

        async fn probe(&self, _proxy: &ProxyDescriptor) -> Result<ProbeSuccess> {
            unreachable!("batch must not start")
        }
    }

    fn proxy(name: &str, server: &str) -> ProxyDescriptor {
        let mut proxy = ProxyDescriptor::new("vless", server, 443);
        proxy.name = name.to_string();
        proxy.uuid = format!("uuid-{}", server);
        proxy
    }

    #[tokio::test]
    async fn test_check_all_records_results() {
        let prober = TableProber::new(&[("fast", Some(80)), ("slow", Some(1500)), ("dead", None)]);
        let checker = ProxyChecker::with_prober(
            Arc::new(prober),
            4,
            vec![
                proxy("fast", "1.1.1.1"),
                proxy("slow", "2.2.2.2"),
                proxy("dead", "3.3.3.3"),
            ],
        );

        let report = checker.check_all_proxies().await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                checked: 3,
                online: 2,
                offline: 1,
                skipped: 0
            }
        );

        let fast = checker.get_proxy_status("fast").unwrap();
        assert!(fast.online);
        assert_eq!(fast.latency, Duration::from_millis(80));

        let dead = checker.get_proxy_status("dead").unwrap();
        assert!(!dead.online);
        assert_eq!(dead.latency, Duration::ZERO);

        let proxies = checker.get_proxies();
        assert!(checker.get_bad_since(&proxies[0]).is_none());
        assert!(checker.get_bad_since(&proxies[1]).is_some());
        assert!(checker.get_bad_since(&proxies[2]).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_names_are_tracked_by_identity() {
        let prober = TableProber::new(&[("dup", Some(100))]);
        let checker = ProxyChecker::with_prober(
            Arc::new(prober),
            2,
            vec![proxy("dup", "1.1.1.1"), proxy("dup", "2.2.2.2")],
        );
        checker.check_all_proxies().await.unwrap();

        let proxies = checker.get_proxies();
        assert_ne!(proxies[0].stable_id(), proxies[1].stable_id());
        for p in &proxies {
            assert!(checker
                .get_proxy_status_by_stable_id(p.stable_id())
                .unwrap()
                .online);
        }
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let checker = ProxyChecker::with_prober(
            Arc::new(TableProber::new(&[])),
            1,
            vec![proxy("a", "1.1.1.1")],
        );

        // Known proxy, nothing recorded yet
        assert!(matches!(
            checker.get_proxy_status("a"),
            Err(VigilError::NotFound(_))
        ));
        assert!(matches!(
            checker.get_proxy_status("missing"),
            Err(VigilError::NotFound(_))
        ));
        assert!(matches!(
            checker.get_proxy_status_by_stable_id("deadbeef"),
            Err(VigilError::NotFound(_))
        ));
        assert!(checker.get_proxy_by_stable_id("deadbeef").is_none());
    }

    #[tokio::test]
    async fn test_update_proxies_clears_state() {
        let prober = TableProber::new(&[("a", Some(50)), ("b", Some(60))]);
        let checker = ProxyChecker::with_prober(Arc::new(prober), 2, vec![proxy("a", "1.1.1.1")]);
        checker.check_all_proxies().await.unwrap();
        assert!(checker.get_proxy_status("a").is_ok());
        assert_eq!(checker.generation(), 0);

        checker.update_proxies(vec![proxy("a", "1.1.1.1"), proxy("b", "2.2.2.2")]);
        assert_eq!(checker.generation(), 1);
        assert_eq!(checker.get_proxies().len(), 2);
        assert!(matches!(
            checker.get_proxy_status("a"),
            Err(VigilError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_swap_mid_batch_discards_results() {
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        });
        let checker = Arc::new(ProxyChecker::with_prober(
            prober.clone(),
            8,
            vec![proxy("a", "1.1.1.1"), proxy("b", "2.2.2.2")],
        ));

        let batch = tokio::spawn({
            let checker = checker.clone();
            async move { checker.check_all_proxies().await }
        });

        while prober.started.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let replacement = proxy("c", "3.3.3.3");
        let replacement_id = replacement.stable_id().to_string();
        checker.update_proxies(vec![replacement]);
        prober.gate.add_permits(2);

        let report = batch.await.unwrap().unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.online, 0);
        assert!(matches!(
            checker.get_proxy_status_by_stable_id(&replacement_id),
            Err(VigilError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_prepare_skips_batch() {
        let checker = ProxyChecker::with_prober(Arc::new(FailingPrepare), 1, vec![proxy("a", "1.1.1.1")]);
        let err = checker.check_all_proxies().await.unwrap_err();
        assert!(matches!(err, VigilError::EgressIpUnavailable(_)));
        assert!(checker.get_proxy_status("a").is_err());
    }

    #[tokio::test]
    async fn test_results_feed_metrics() {
        let metrics = Arc::new(ProxyMetrics::new("").unwrap());
        let prober = TableProber::new(&[("a", Some(42))]);
        let checker = ProxyChecker::with_prober(Arc::new(prober), 1, vec![proxy("a", "1.1.1.1")])
            .with_metrics(metrics.clone());

        checker.check_all_proxies().await.unwrap();
        let text = metrics.encode().unwrap();
        assert!(text.contains("name=\"a\""));

        checker.update_proxies(Vec::new());
        assert!(!metrics.encode().unwrap().contains("name=\"a\""));
    }

    #[tokio::test]
    async fn test_status_mode_unreachable_tunnel_is_offline() {
        let config = CheckerConfig {
            method: CheckMethod::Status,
            ip_check_url: "http://127.0.0.1:1/ip".to_string(),
            status_check_url: "http://example.com/generate_204".to_string(),
            timeout: Duration::from_secs(2),
            base_port: 1,
            ..Default::default()
        };
        let checker = ProxyChecker::new(&config, vec![proxy("a", "1.1.1.1")]).unwrap();

        let report = checker.check_all_proxies().await.unwrap();
        assert_eq!(report.offline, 1);
        assert!(!checker.get_proxy_status("a").unwrap().online);
    }
}

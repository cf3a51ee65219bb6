//! Probe strategies
//!
//! Every probe is an HTTP request sent through the proxy's local SOCKS tunnel.
//! Latency is always time to first response byte, never total transfer time.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use url::Url;

pub use crate::config::CheckMethod;
use crate::config::CheckerConfig;
use crate::error::{error_chain, Result, VigilError};
use crate::models::ProxyDescriptor;

/// Delay before retrying a request that hit a stale tunnel connection
const IDLE_RACE_RETRY_DELAY: Duration = Duration::from_millis(120);

/// A successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSuccess {
    pub latency: Duration,
    pub detail: String,
}

/// Trait for probe strategies
///
/// Implementations decide whether a single proxy is usable right now. Any
/// error marks the proxy offline for the current cycle.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Runs once before every batch. An error skips the whole batch.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Probe one proxy through its tunnel
    async fn probe(&self, proxy: &ProxyDescriptor) -> Result<ProbeSuccess>;
}

/// Probes proxies with real HTTP requests through their local tunnels
pub struct HttpProber {
    config: CheckerConfig,
    direct: reqwest::Client,
    own_ip: OnceCell<String>,
}

impl HttpProber {
    pub fn new(config: CheckerConfig) -> Result<Self> {
        let direct = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            config,
            direct,
            own_ip: OnceCell::new(),
        })
    }

    /// Our own public IP, once resolved
    pub fn own_ip(&self) -> Option<&str> {
        self.own_ip.get().map(String::as_str)
    }

    /// Resolve our own public IP; cached after the first success
    async fn resolve_own_ip(&self) -> Result<&str> {
        let ip = self
            .own_ip
            .get_or_try_init(|| async {
                let url = Url::parse(&self.config.ip_check_url)?;
                let body = self
                    .direct
                    .get(url)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| VigilError::EgressIpUnavailable(error_chain(&e)))?
                    .text()
                    .await
                    .map_err(|e| VigilError::EgressIpUnavailable(error_chain(&e)))?;
                let ip = body.trim().to_string();
                info!(ip = %ip, "Resolved own egress IP");
                Ok::<_, VigilError>(ip)
            })
            .await?;
        Ok(ip.as_str())
    }

    /// Client whose every request goes through the proxy's tunnel
    fn tunnel_client(&self, proxy: &ProxyDescriptor, timeout: Duration) -> Result<reqwest::Client> {
        let tunnel = self.config.tunnel_url(proxy.index)?;
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(&tunnel)?)
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()?;
        Ok(client)
    }

    async fn check_by_ip(&self, client: &reqwest::Client) -> Result<ProbeSuccess> {
        let own_ip = self
            .own_ip()
            .ok_or_else(|| VigilError::EgressIpUnavailable("own IP not resolved".into()))?;
        let url = Url::parse(&self.config.ip_check_url)?;

        let start = Instant::now();
        let response = client.get(url).send().await?;
        let ttfb = start.elapsed();

        let body = response.text().await?;
        let detail = judge_egress_ip(own_ip, &body)?;
        Ok(ProbeSuccess {
            latency: ttfb,
            detail,
        })
    }

    async fn check_by_status(&self, client: &reqwest::Client) -> Result<ProbeSuccess> {
        let url = Url::parse(&self.config.status_check_url)?;

        let (response, ttfb) = retry_on_idle_race(|| {
            let request = client.get(url.clone());
            async move {
                let start = Instant::now();
                request.send().await.map(|response| (response, start.elapsed()))
            }
        })
        .await?;

        let detail = judge_status(response.status().as_u16())?;
        Ok(ProbeSuccess {
            latency: ttfb,
            detail,
        })
    }

    async fn check_by_download(&self, proxy: &ProxyDescriptor) -> Result<ProbeSuccess> {
        if self.config.download_url.is_empty() {
            return Err(VigilError::InvalidConfig("download URL not configured".into()));
        }
        let url = Url::parse(&self.config.download_url)?;
        let client = self.tunnel_client(proxy, self.config.download_timeout)?;

        let start = Instant::now();
        let mut response = client.get(url).send().await?;
        let ttfb = start.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(VigilError::Protocol(format!("HTTP status: {}", status.as_u16())));
        }

        let mut progress = DownloadProgress::new(self.config.download_min_size);
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if progress.push(chunk.len()) {
                        break;
                    }
                }
                Ok(None) => break,
                // Timeout or reset mid-body; judged by what arrived so far.
                Err(e) => {
                    debug!(
                        "Download stopped after {} bytes: {}",
                        progress.received(),
                        e
                    );
                    break;
                }
            }
        }

        let detail = format!(
            "Downloaded: {} bytes (min: {})",
            progress.received(),
            self.config.download_min_size
        );
        if !progress.is_complete() {
            return Err(VigilError::Protocol(detail));
        }

        Ok(ProbeSuccess {
            latency: ttfb,
            detail,
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn prepare(&self) -> Result<()> {
        if self.config.method == CheckMethod::Ip {
            self.resolve_own_ip().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, proxy), fields(proxy = %proxy.name, index = proxy.index))]
    async fn probe(&self, proxy: &ProxyDescriptor) -> Result<ProbeSuccess> {
        match self.config.method {
            CheckMethod::Ip => {
                let client = self.tunnel_client(proxy, self.config.timeout)?;
                self.check_by_ip(&client).await
            }
            CheckMethod::Status => {
                let client = self.tunnel_client(proxy, self.config.timeout)?;
                self.check_by_status(&client).await
            }
            CheckMethod::Download => self.check_by_download(proxy).await,
        }
    }
}

/// Healthy only if the tunnel changes our egress IP
pub fn judge_egress_ip(own_ip: &str, body: &str) -> Result<String> {
    let own_ip = own_ip.trim();
    let proxy_ip = body.trim();
    let detail = format!("Source IP: {} | Proxy IP: {}", own_ip, proxy_ip);
    if proxy_ip == own_ip {
        return Err(VigilError::Protocol(format!("egress IP not changed | {}", detail)));
    }
    Ok(detail)
}

/// Healthy only for 2xx
pub fn judge_status(code: u16) -> Result<String> {
    let detail = format!("Status: {}", code);
    if (200..300).contains(&code) {
        Ok(detail)
    } else {
        Err(VigilError::Protocol(detail))
    }
}

/// An error from a connection the tunnel closed under us
pub fn looks_like_idle_race(error_text: &str) -> bool {
    error_text.to_uppercase().contains("EOF")
}

/// Run `attempt`, and once more after a short delay if it failed on a
/// connection the tunnel had already closed
pub async fn retry_on_idle_race<T, E, F, Fut>(mut attempt: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + 'static,
{
    match attempt().await {
        Err(e) if looks_like_idle_race(&error_chain(&e)) => {
            debug!("Request hit a closed connection, retrying: {}", e);
            tokio::time::sleep(IDLE_RACE_RETRY_DELAY).await;
            attempt().await
        }
        other => other,
    }
}

/// Byte counter for download probes
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    received: u64,
    min_size: u64,
}

impl DownloadProgress {
    pub fn new(min_size: u64) -> Self {
        Self {
            received: 0,
            min_size,
        }
    }

    /// Account for a chunk; returns true once the minimum is reached
    pub fn push(&mut self, len: usize) -> bool {
        self.received = self
            .received
            .saturating_add(u64::try_from(len).unwrap_or(u64::MAX));
        self.is_complete()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.min_size
    }
}

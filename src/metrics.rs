//! Exported proxy status and latency gauges
//!
//! The checker pushes every applied probe result here; the publisher renders
//! the registry in the Prometheus text format for external collectors.

use std::time::Duration;

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;
use crate::models::ProxyDescriptor;

const LABELS: &[&str] = &["protocol", "address", "name", "sub_name"];

/// Per-proxy status/latency gauges backed by their own registry
pub struct ProxyMetrics {
    registry: Registry,
    status: IntGaugeVec,
    latency: IntGaugeVec,
}

impl ProxyMetrics {
    pub fn new(instance: &str) -> Result<Self> {
        let registry = Registry::new();

        let mut status_opts = Opts::new("proxy_status", "Proxy status (1: online, 0: offline)");
        let mut latency_opts = Opts::new("proxy_latency_ms", "Proxy latency in milliseconds");
        if !instance.is_empty() {
            status_opts = status_opts.const_label("instance", instance);
            latency_opts = latency_opts.const_label("instance", instance);
        }

        let status = IntGaugeVec::new(status_opts, LABELS)?;
        let latency = IntGaugeVec::new(latency_opts, LABELS)?;
        registry.register(Box::new(status.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            status,
            latency,
        })
    }

    pub fn record(&self, proxy: &ProxyDescriptor, online: bool, latency: Duration) {
        let address = proxy.address();
        let labels = [
            proxy.protocol.as_str(),
            address.as_str(),
            proxy.name.as_str(),
            proxy.sub_name.as_str(),
        ];
        self.status
            .with_label_values(&labels)
            .set(i64::from(online));
        self.latency
            .with_label_values(&labels)
            .set(i64::try_from(latency.as_millis()).unwrap_or(i64::MAX));
    }

    /// Drop every exported series
    pub fn clear(&self) {
        self.status.reset();
        self.latency.reset();
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

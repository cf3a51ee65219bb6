//! Vigil - Proxy Reachability Checker
//!
//! Probes a fleet of proxies through local SOCKS tunnels and publishes a
//! slowly changing, latency-ranked meta-subscription.
//!
//! ## Features
//!
//! - Egress-IP, HTTP status and download probe strategies
//! - Stable proxy identities that survive renames and reordering
//! - Safe live swaps of the proxy set during an in-flight batch
//! - Quota-partitioned top-K selection with EMA smoothing and hysteresis
//! - Prometheus text export of per-proxy status and latency

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{Result, VigilError};

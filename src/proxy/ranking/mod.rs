//! Ranked meta-subscription selection
//!
//! Candidates are proxies whose display name carries one of two bucket
//! markers. They are ranked by latency with deterministic tie-breaks and
//! published through a hysteretic top-K selector.

mod candidates;
mod stable;

pub use candidates::{collect_candidates, KeyStatus, Selection};
pub use stable::StableSelector;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SelectorConfig;
use crate::models::ProxyDescriptor;

/// A deduplicated online candidate
#[derive(Debug, Clone)]
pub struct RankedProxy {
    pub proxy: Arc<ProxyDescriptor>,
    /// Raw latency during candidate collection, smoothed once ranked
    pub latency: Duration,
    pub key: String,
}

/// Total order used for ranking, tie-breaks and eviction
///
/// Latency ascending, then trimmed lowercase name, then stable identity.
pub fn compare_ranked(a: &RankedProxy, b: &RankedProxy) -> Ordering {
    a.latency
        .cmp(&b.latency)
        .then_with(|| normalized_name(&a.proxy.name).cmp(&normalized_name(&b.proxy.name)))
        .then_with(|| a.proxy.stable_id().cmp(b.proxy.stable_id()))
}

fn normalized_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Grouping key merging descriptors of the same logical endpoint
///
/// Falls back from stable identity to user id, password and finally name.
pub fn dedup_key(proxy: &ProxyDescriptor) -> String {
    let protocol = proxy.protocol.trim().to_lowercase();

    let sid = proxy.stable_id().trim();
    if !sid.is_empty() {
        return format!("{}|stable|{}", protocol, sid);
    }
    let uuid = proxy.uuid.trim();
    if !uuid.is_empty() {
        return format!("{}|uuid|{}", protocol, uuid);
    }
    let password = proxy.password.trim();
    if !password.is_empty() {
        return format!("{}|password|{}", protocol, password);
    }
    format!("{}|name|{}", protocol, normalized_name(&proxy.name))
}

/// Which quota buckets a display name belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketTags {
    pub a: bool,
    pub b: bool,
}

impl BucketTags {
    pub fn classify(name: &str, config: &SelectorConfig) -> Self {
        let upper = name.to_uppercase();
        Self {
            a: has_marker(&upper, &config.bucket_a),
            b: has_marker(&upper, &config.bucket_b),
        }
    }

    pub fn is_tagged(&self) -> bool {
        self.a || self.b
    }
}

fn has_marker(upper_name: &str, marker: &str) -> bool {
    !marker.is_empty() && upper_name.contains(&marker.to_uppercase())
}

/// Source line as it goes into the published list
///
/// Trimmed, control characters removed. Empty means "skip".
pub fn sanitize_source_line(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

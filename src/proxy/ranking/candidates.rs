//! Candidate collection: filter, classify, dedupe, order, apply quotas

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SelectorConfig;
use crate::error::Result;
use crate::models::{ProxyDescriptor, ProxyStatus};

use super::{compare_ranked, dedup_key, BucketTags, RankedProxy};

/// Observations for one dedup key in the current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStatus {
    pub online: usize,
    pub offline: usize,
    pub unavailable: usize,
}

/// Outcome of one collection pass
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Quota-limited candidates in rank order
    pub ranked: Vec<RankedProxy>,
    pub tagged: usize,
    pub online: usize,
    pub offline: usize,
    pub unavailable: usize,
    pub key_states: HashMap<String, KeyStatus>,
}

impl Selection {
    /// Every tagged candidate failed its status lookup
    pub fn all_unavailable(&self) -> bool {
        self.tagged > 0 && self.unavailable == self.tagged
    }
}

pub fn collect_candidates<F>(
    proxies: &[Arc<ProxyDescriptor>],
    status_fn: F,
    config: &SelectorConfig,
) -> Selection
where
    F: Fn(&str) -> Result<ProxyStatus>,
{
    let mut selection = Selection::default();
    let mut best_by_key: HashMap<String, RankedProxy> = HashMap::with_capacity(proxies.len());

    for proxy in proxies {
        if proxy.source_line.trim().is_empty() {
            continue;
        }
        if !BucketTags::classify(&proxy.name, config).is_tagged() {
            continue;
        }

        selection.tagged += 1;
        let key = dedup_key(proxy);
        let state = selection.key_states.entry(key.clone()).or_default();

        let status = match status_fn(proxy.stable_id()) {
            Ok(status) => status,
            Err(_) => {
                state.unavailable += 1;
                selection.unavailable += 1;
                continue;
            }
        };
        if !status.online {
            state.offline += 1;
            selection.offline += 1;
            continue;
        }
        state.online += 1;
        selection.online += 1;

        let candidate = RankedProxy {
            proxy: proxy.clone(),
            latency: status.latency,
            key: key.clone(),
        };
        match best_by_key.get(&key) {
            Some(existing) if compare_ranked(&candidate, existing).is_ge() => {}
            _ => {
                best_by_key.insert(key, candidate);
            }
        }
    }

    let mut ordered: Vec<RankedProxy> = best_by_key.into_values().collect();
    ordered.sort_by(compare_ranked);
    selection.ranked = apply_quotas(ordered, config);
    selection
}

/// Single walk over the ordered list admitting up to the per-bucket quotas
///
/// A name carrying both markers counts against whichever bucket has more
/// unmet quota, bucket A on ties.
fn apply_quotas(ordered: Vec<RankedProxy>, config: &SelectorConfig) -> Vec<RankedProxy> {
    let (quota_a, quota_b) = (config.quota_a, config.quota_b);
    let mut selected = Vec::with_capacity(quota_a + quota_b);
    let (mut count_a, mut count_b) = (0usize, 0usize);

    for item in ordered {
        if count_a >= quota_a && count_b >= quota_b {
            break;
        }

        let tags = BucketTags::classify(&item.proxy.name, config);
        match (tags.a, tags.b) {
            (true, true) => {
                let need_a = quota_a.saturating_sub(count_a);
                let need_b = quota_b.saturating_sub(count_b);
                if need_a == 0 && need_b == 0 {
                    continue;
                }
                if need_b > need_a {
                    count_b += 1;
                } else {
                    count_a += 1;
                }
            }
            (true, false) => {
                if count_a >= quota_a {
                    continue;
                }
                count_a += 1;
            }
            (false, true) => {
                if count_b >= quota_b {
                    continue;
                }
                count_b += 1;
            }
            (false, false) => continue,
        }

        selected.push(item);
    }

    selected
}

//! Hysteretic top-K selector
//!
//! Keeps a persistent active set of candidates and republishes it on a slow
//! cadence. Latencies are smoothed with an EMA; incumbents are protected for a
//! minimum hold time and only replaced by significantly faster challengers.
//! Members that stop answering are evicted after two consecutive bad cycles,
//! which forces an immediate publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::error::Result;
use crate::models::{ProxyDescriptor, ProxyStatus};

use super::{collect_candidates, compare_ranked, sanitize_source_line, KeyStatus, RankedProxy};

/// Minimum time between regular publishes
pub const BATCH_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
/// Minimum time an active member is protected from replacement
pub const MIN_HOLD: Duration = Duration::from_secs(2 * 60 * 60);
/// Weight of the newest sample
pub const EMA_ALPHA: f64 = 0.3;
pub const REPLACE_MIN_GAIN: Duration = Duration::from_millis(50);
pub const REPLACE_MIN_RATIO: f64 = 0.20;
/// Consecutive cycles without an online observation before eviction
pub const BAD_STREAK_LIMIT: u32 = 2;

const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
struct ActiveEntry {
    item: RankedProxy,
    added_at: DateTime<Utc>,
    bad_streak: u32,
}

#[derive(Debug, Default)]
struct SelectorState {
    ema_by_key: HashMap<String, Duration>,
    active: HashMap<String, ActiveEntry>,
    published: Vec<String>,
    last_published: Option<DateTime<Utc>>,
    had_emergency: bool,
}

/// Publishes a slowly changing ranked shortlist
pub struct StableSelector {
    config: SelectorConfig,
    capacity: usize,
    state: Mutex<SelectorState>,
}

impl StableSelector {
    /// Selector holding up to `quota_a + quota_b` members
    pub fn new(config: SelectorConfig) -> Self {
        let capacity = config.quota_a + config.quota_b;
        Self::with_capacity(config, capacity)
    }

    pub fn with_capacity(config: SelectorConfig, capacity: usize) -> Self {
        Self {
            config,
            capacity: if capacity == 0 {
                DEFAULT_CAPACITY
            } else {
                capacity
            },
            state: Mutex::new(SelectorState::default()),
        }
    }

    /// Recompute the published list
    ///
    /// Never fails; degraded input keeps the previous list.
    pub fn next<F>(
        &self,
        proxies: &[Arc<ProxyDescriptor>],
        status_fn: F,
        now: DateTime<Utc>,
    ) -> Vec<String>
    where
        F: Fn(&str) -> Result<ProxyStatus>,
    {
        let selection = collect_candidates(proxies, status_fn, &self.config);
        let mut state = self.state.lock();

        if selection.all_unavailable() && !state.published.is_empty() {
            debug!(
                tagged = selection.tagged,
                "All candidates unavailable, keeping published list"
            );
            return state.published.clone();
        }

        let ranked = state.apply_ema(selection.ranked);
        state.reconcile_active(&ranked, &selection.key_states, now, self.capacity);
        state.prune_ema(&selection.key_states);

        let proposed: Vec<String> = state
            .active_ranked(self.capacity)
            .iter()
            .map(|item| sanitize_source_line(&item.proxy.source_line))
            .filter(|line| !line.is_empty())
            .collect();
        let emergency = std::mem::take(&mut state.had_emergency);

        if proposed.is_empty() && !state.published.is_empty() {
            debug!("No active candidates, keeping published list");
            return state.published.clone();
        }

        let interval_elapsed = state
            .last_published
            .map_or(true, |last| elapsed(last, now) >= BATCH_INTERVAL);
        if state.published.is_empty() || interval_elapsed || emergency {
            info!(
                count = proposed.len(),
                emergency,
                online = selection.online,
                offline = selection.offline,
                "Publishing selection"
            );
            state.published = proposed;
            state.last_published = Some(now);
        }

        state.published.clone()
    }

    /// Currently published list
    pub fn published(&self) -> Vec<String> {
        self.state.lock().published.clone()
    }

    pub fn last_published(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_published
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Smoothed latency for a dedup key
    pub fn ema(&self, key: &str) -> Option<Duration> {
        self.state.lock().ema_by_key.get(key).copied()
    }
}

impl SelectorState {
    /// Replace raw latencies with per-key EMAs and re-sort
    fn apply_ema(&mut self, ranked: Vec<RankedProxy>) -> Vec<RankedProxy> {
        let mut smoothed: Vec<RankedProxy> = ranked
            .into_iter()
            .map(|mut item| {
                let ema = match self.ema_by_key.get(&item.key) {
                    Some(prev) if !prev.is_zero() => smooth(*prev, item.latency),
                    _ => item.latency,
                };
                self.ema_by_key.insert(item.key.clone(), ema);
                item.latency = ema;
                item
            })
            .collect();
        smoothed.sort_by(compare_ranked);
        smoothed
    }

    fn reconcile_active(
        &mut self,
        ranked: &[RankedProxy],
        key_states: &HashMap<String, KeyStatus>,
        now: DateTime<Utc>,
        capacity: usize,
    ) {
        let mut fresh: HashMap<&str, &RankedProxy> = HashMap::with_capacity(ranked.len());
        for item in ranked {
            fresh.entry(item.key.as_str()).or_insert(item);
        }

        let mut emergency = false;
        self.active.retain(|key, entry| {
            let online = key_states.get(key).map_or(0, |s| s.online);
            if online > 0 {
                entry.bad_streak = 0;
            } else {
                entry.bad_streak += 1;
            }
            if let Some(item) = fresh.get(key.as_str()) {
                entry.item = (*item).clone();
            }
            if entry.bad_streak >= BAD_STREAK_LIMIT {
                warn!(
                    proxy = %entry.item.proxy.name,
                    bad_streak = entry.bad_streak,
                    "Evicting unhealthy active proxy"
                );
                emergency = true;
                return false;
            }
            true
        });
        if emergency {
            self.had_emergency = true;
        }

        for item in ranked {
            if self.active.len() >= capacity {
                break;
            }
            if self.active.contains_key(&item.key) {
                continue;
            }
            self.activate(item, now);
        }

        for item in ranked {
            if self.active.contains_key(&item.key) {
                continue;
            }
            let Some((worst_key, worst_latency)) = self.find_worst_replaceable(now) else {
                break;
            };
            if !is_significant_improvement(item.latency, worst_latency) {
                continue;
            }
            if let Some(replaced) = self.active.remove(&worst_key) {
                info!(
                    old = %replaced.item.proxy.name,
                    new = %item.proxy.name,
                    old_ms = worst_latency.as_millis() as u64,
                    new_ms = item.latency.as_millis() as u64,
                    "Replacing active proxy"
                );
            }
            self.activate(item, now);
        }
    }

    /// Forget keys that left both the population and the active set
    fn prune_ema(&mut self, key_states: &HashMap<String, KeyStatus>) {
        let active = &self.active;
        self.ema_by_key
            .retain(|key, _| key_states.contains_key(key) || active.contains_key(key));
    }

    fn activate(&mut self, item: &RankedProxy, now: DateTime<Utc>) {
        self.active.insert(
            item.key.clone(),
            ActiveEntry {
                item: item.clone(),
                added_at: now,
                bad_streak: 0,
            },
        );
    }

    /// Worst member past its hold time or already on a bad streak
    fn find_worst_replaceable(&self, now: DateTime<Utc>) -> Option<(String, Duration)> {
        self.active
            .iter()
            .filter(|(_, entry)| {
                elapsed(entry.added_at, now) >= MIN_HOLD || entry.bad_streak >= BAD_STREAK_LIMIT
            })
            .max_by(|(_, a), (_, b)| compare_ranked(&a.item, &b.item))
            .map(|(key, entry)| (key.clone(), entry.item.latency))
    }

    fn active_ranked(&self, capacity: usize) -> Vec<RankedProxy> {
        let mut items: Vec<RankedProxy> =
            self.active.values().map(|entry| entry.item.clone()).collect();
        items.sort_by(compare_ranked);
        items.truncate(capacity);
        items
    }
}

fn smooth(prev: Duration, raw: Duration) -> Duration {
    let nanos = prev.as_nanos() as f64 * (1.0 - EMA_ALPHA) + raw.as_nanos() as f64 * EMA_ALPHA;
    Duration::from_nanos(nanos.round() as u64)
}

fn is_significant_improvement(candidate: Duration, current: Duration) -> bool {
    if candidate >= current {
        return false;
    }
    let gain = current - candidate;
    if gain >= REPLACE_MIN_GAIN {
        return true;
    }
    !current.is_zero() && gain.as_secs_f64() / current.as_secs_f64() >= REPLACE_MIN_RATIO
}

// Negative spans (clock moved back) count as nothing elapsed.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

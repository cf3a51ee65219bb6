//! Per-identity probe results
//!
//! Status writes go to a sharded map so concurrent probes for unrelated
//! proxies never contend. Bad-since tracking sits behind its own lock to keep
//! it off the hot status path.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::models::ProxyStatus;

/// Latency above which an online proxy still counts as bad
pub const BAD_LATENCY_THRESHOLD: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
pub struct StatusStore {
    statuses: DashMap<String, ProxyStatus>,
    bad_since: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, id: &str, latency: Duration, now: DateTime<Utc>) {
        self.statuses
            .insert(id.to_string(), ProxyStatus::online(latency));
        if latency > BAD_LATENCY_THRESHOLD {
            self.mark_bad(id, now);
        } else {
            self.clear_bad(id);
        }
    }

    pub fn record_failure(&self, id: &str, now: DateTime<Utc>) {
        self.statuses.insert(id.to_string(), ProxyStatus::offline());
        self.mark_bad(id, now);
    }

    pub fn get(&self, id: &str) -> Option<ProxyStatus> {
        self.statuses.get(id).map(|entry| *entry)
    }

    pub fn bad_since(&self, id: &str) -> Option<DateTime<Utc>> {
        self.bad_since.read().get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn clear(&self) {
        self.statuses.clear();
        self.bad_since.write().clear();
    }

    // Keeps the first timestamp of an ongoing bad period.
    fn mark_bad(&self, id: &str, now: DateTime<Utc>) {
        self.bad_since
            .write()
            .entry(id.to_string())
            .or_insert(now);
    }

    fn clear_bad(&self, id: &str) {
        self.bad_since.write().remove(id);
    }
}

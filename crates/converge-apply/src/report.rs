//! Status reporting while waiting
//!
//! The watcher hands every evaluated verdict to a [`StatusObserver`]. The
//! observers here print each distinct status once; the record of what has
//! been reported lives in a [`StatusCache`] owned by the caller.

use std::collections::HashMap;

use tracing::{info, warn};

use converge_common::ResourceRef;

use crate::readiness::Verdict;

/// Receives every verdict the watcher evaluates
pub trait StatusObserver: Send {
    /// Called once per evaluated snapshot
    fn observe(&mut self, key: &ResourceRef, verdict: &Verdict);
}

/// Remembers the last status description reported per resource
#[derive(Debug, Default)]
pub struct StatusCache {
    reported: HashMap<ResourceRef, String>,
}

impl StatusCache {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `description` for `key`; true when it differs from the last one
    pub fn should_report(&mut self, key: &ResourceRef, description: &str) -> bool {
        if self.reported.get(key).is_some_and(|last| last == description) {
            return false;
        }
        self.reported.insert(key.clone(), description.to_string());
        true
    }

    /// Forget everything reported so far
    pub fn clear(&mut self) {
        self.reported.clear();
    }
}

/// Logs each distinct verdict through `tracing`
#[derive(Debug, Default)]
pub struct TracingObserver {
    cache: StatusCache,
}

impl TracingObserver {
    /// Observer with a fresh cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer reusing an existing cache
    pub fn with_cache(cache: StatusCache) -> Self {
        Self { cache }
    }
}

impl StatusObserver for TracingObserver {
    fn observe(&mut self, key: &ResourceRef, verdict: &Verdict) {
        let description = verdict.to_string();
        if !self.cache.should_report(key, &description) {
            return;
        }
        match verdict {
            Verdict::Warning(_) | Verdict::Error(_) => {
                warn!(resource = %key, status = %description, "status changed")
            }
            Verdict::Ready | Verdict::NotReady => {
                info!(resource = %key, status = %description, "status changed")
            }
        }
    }
}

/// Discards every verdict
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl StatusObserver for SilentObserver {
    fn observe(&mut self, _key: &ResourceRef, _verdict: &Verdict) {}
}

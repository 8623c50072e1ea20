use std::sync::{Arc, RwLock};

/// Counters for the live-subscription registry
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub opened: u64,
    pub closed: u64,
    /// Opens skipped because the registry was full
    pub capacity_skips: u64,
    /// Teardowns aborted by a re-entry inside the debounce window
    pub debounce_cancels: u64,
    pub open_failures: u64,
    pub channel_failures: u64,
    pub updates_applied: u64,
    /// Updates dropped because their channel was already closed
    pub stale_updates: u64,
    /// Largest registry size seen this session
    pub peak_active: usize,
}

impl SubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> u64 {
        self.opened - self.closed
    }
}

/// Thread-safe wrapper for subscription stats
#[derive(Debug, Clone)]
pub struct SharedSubscriptionStats {
    inner: Arc<RwLock<SubscriptionStats>>,
}

impl Default for SharedSubscriptionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSubscriptionStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SubscriptionStats::new())),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut SubscriptionStats)) {
        if let Ok(mut stats) = self.inner.write() {
            f(&mut stats);
        }
    }

    pub fn record_open(&self, active: usize) {
        self.update(|s| {
            s.opened += 1;
            s.peak_active = s.peak_active.max(active);
        });
    }

    pub fn snapshot(&self) -> SubscriptionStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}

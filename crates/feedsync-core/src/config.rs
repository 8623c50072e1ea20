use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    COMMENT_MAX_LEN, FETCH_TIMEOUT_MS, LOAD_MORE_STEP, MAX_CONCURRENT_SUBSCRIPTIONS,
    MUTATION_TIMEOUT_MS, PER_OWNER_CAP, TARGET_PAGE_SIZE, TEARDOWN_DEBOUNCE_MS,
    VISIBILITY_ROOT_MARGIN_PX,
};

/// Feed session configuration that can be loaded from a JSON file.
/// Every field is optional in the file; missing fields take the defaults in `constants`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedConfig {
    /// Hard ceiling on open live channels
    pub max_concurrent: usize,
    pub debounce_ms: u64,
    pub per_owner_cap: usize,
    pub target_size: usize,
    pub load_more_step: usize,
    pub fetch_timeout_ms: u64,
    pub mutation_timeout_ms: u64,
    pub comment_max_len: usize,
    pub visibility: VisibilityConfig,
}

/// Viewport settings. The core only compares ratios against `threshold`;
/// `root_margin_px` is forwarded to whoever computes the intersections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisibilityConfig {
    pub root_margin_px: u32,
    pub threshold: f32,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            root_margin_px: VISIBILITY_ROOT_MARGIN_PX,
            threshold: 0.0,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_SUBSCRIPTIONS,
            debounce_ms: TEARDOWN_DEBOUNCE_MS,
            per_owner_cap: PER_OWNER_CAP,
            target_size: TARGET_PAGE_SIZE,
            load_more_step: LOAD_MORE_STEP,
            fetch_timeout_ms: FETCH_TIMEOUT_MS,
            mutation_timeout_ms: MUTATION_TIMEOUT_MS,
            comment_max_len: COMMENT_MAX_LEN,
            visibility: VisibilityConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: FeedConfig =
            serde_json::from_str(json).context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("maxConcurrent must be at least 1");
        }
        if self.target_size == 0 {
            bail!("targetSize must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.visibility.threshold) {
            bail!(
                "visibility.threshold must be within 0.0..=1.0, got {}",
                self.visibility.threshold
            );
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }
}

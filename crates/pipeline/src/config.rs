use std::time::Duration;

use kindex_search::IndexLimits;
use serde::{Deserialize, Serialize};

/// Runtime configuration for one indexing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Revisions kept per resource key.
    pub history_limit: usize,
    /// Annotation prefix carrying provenance (`<prefix>origin-name`, ...).
    pub origin_prefix: String,
    /// How long callers wait for bootstrap before giving up.
    pub ready_timeout: Duration,
    /// Deleted uids remembered by the version guard (and deleted keys kept in
    /// history); the oldest are forgotten first.
    pub tombstone_limit: usize,
    pub limits: IndexLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_limit: 16,
            origin_prefix: "kindex.io/".to_string(),
            ready_timeout: Duration::from_secs(30),
            tombstone_limit: 10_000,
            limits: IndexLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `KINDEX_HISTORY_LIMIT`, `KINDEX_ORIGIN_PREFIX`,
    /// `KINDEX_WAIT_SECS`, `KINDEX_TOMBSTONE_LIMIT`, `KINDEX_MAX_DOCS` and
    /// `KINDEX_MAX_PAYLOAD_BYTES`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = std::env::var("KINDEX_HISTORY_LIMIT").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.history_limit = n;
        }
        if let Ok(p) = std::env::var("KINDEX_ORIGIN_PREFIX") {
            cfg.origin_prefix = p;
        }
        if let Some(secs) = std::env::var("KINDEX_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = std::env::var("KINDEX_TOMBSTONE_LIMIT").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.tombstone_limit = n;
        }
        cfg.limits = IndexLimits::from_env();
        cfg
    }

    pub fn with_history_limit(mut self, n: usize) -> Self {
        self.history_limit = n;
        self
    }

    pub fn with_origin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.origin_prefix = prefix.into();
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_tombstone_limit(mut self, n: usize) -> Self {
        self.tombstone_limit = n;
        self
    }

    pub fn with_limits(mut self, limits: IndexLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let vars = [
            ("KINDEX_HISTORY_LIMIT", "3"),
            ("KINDEX_ORIGIN_PREFIX", "example.com/"),
            ("KINDEX_WAIT_SECS", "5"),
            ("KINDEX_TOMBSTONE_LIMIT", "7"),
            ("KINDEX_MAX_DOCS", "100"),
            ("KINDEX_MAX_PAYLOAD_BYTES", "not-a-number"),
        ];
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let cfg = PipelineConfig::from_env();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        assert_eq!(cfg.history_limit, 3);
        assert_eq!(cfg.origin_prefix, "example.com/");
        assert_eq!(cfg.ready_timeout, Duration::from_secs(5));
        assert_eq!(cfg.tombstone_limit, 7);
        assert_eq!(cfg.limits, IndexLimits { max_docs: Some(100), max_payload_bytes: None });
    }
}

//! Startup-only cache configuration.
//!
//! Loaded once by the host process (typically from its TOML config) and
//! passed by value into [`MdCache::new`](crate::MdCache::new). Nothing in
//! here is mutable at runtime; there are deliberately no admin knobs for
//! the cache.

use std::time::Duration;

use serde::Deserialize;

/// Tunables fixed at cache construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Number of LRU lanes. Entries hash to a lane at creation and never
    /// migrate.
    pub lanes: usize,

    /// Process-wide entry count above which the reaper applies pressure.
    pub entries_hiwat: usize,

    /// Maximum reclaims attempted per lane per reaper pass.
    pub reap_batch: usize,

    /// How often the reaper wakes without being kicked.
    #[serde(with = "secs")]
    pub lru_run_interval: Duration,

    /// How long cached attributes stay authoritative.
    #[serde(with = "secs")]
    pub attr_ttl: Duration,

    /// Fractional uniform jitter added to each attribute expiry so a mass
    /// create does not expire as a thundering herd.
    pub attr_ttl_jitter: f64,

    /// Quadratic-probe bound for the dirent index. One global constant,
    /// uniform across all call sites.
    pub dirent_probe_bound: u32,

    /// Dirents fetched from the backend per directory chunk.
    pub chunk_size: usize,

    /// Lane-local operations between LRU hot-queue demotion passes.
    pub demote_period: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lanes: 7,
            entries_hiwat: 100_000,
            reap_batch: 32,
            lru_run_interval: Duration::from_secs(90),
            attr_ttl: Duration::from_secs(60),
            attr_ttl_jitter: 0.10,
            dirent_probe_bound: 64,
            chunk_size: 128,
            demote_period: 64,
        }
    }
}

impl CacheConfig {
    /// Clamp obviously unusable values instead of failing construction.
    pub(crate) fn sanitized(mut self) -> Self {
        self.lanes = self.lanes.max(1);
        self.reap_batch = self.reap_batch.max(1);
        self.dirent_probe_bound = self.dirent_probe_bound.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self.demote_period = self.demote_period.max(1);
        self.attr_ttl_jitter = self.attr_ttl_jitter.clamp(0.0, 1.0);
        self
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

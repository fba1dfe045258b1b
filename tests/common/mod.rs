#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod memfs;

use std::sync::Arc;
use std::time::Duration;

use mdcache::fsal::{Export, ObjectHandle};
use mdcache::{CacheConfig, MdCache, MdcExport};

use memfs::MemFs;

/// A config sized for tests: few lanes, tiny pressure threshold, small
/// chunks, and a TTL long enough that tests control expiry explicitly.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        lanes: 3,
        entries_hiwat: 1000,
        reap_batch: 16,
        lru_run_interval: Duration::from_secs(3600),
        attr_ttl: Duration::from_secs(600),
        attr_ttl_jitter: 0.0,
        dirent_probe_bound: 64,
        chunk_size: 4,
        demote_period: 2,
    }
}

/// Cache + backend + wrapped export, ready to exercise.
pub struct Rig {
    pub mem: MemFs,
    pub cache: MdCache,
    pub export: MdcExport,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(cfg: CacheConfig) -> Self {
        let mem = MemFs::new("MEM");
        let cache = MdCache::new(cfg);
        let export = cache
            .wrap_export(Arc::new(mem.clone()), None)
            .expect("wrap export");
        Self { mem, cache, export }
    }

    pub fn root(&self) -> Box<dyn ObjectHandle> {
        self.export.lookup_path("/").expect("root handle")
    }
}

/// Collect `(name, cookie)` pairs from a full enumeration starting at
/// `whence`.
pub fn list_dir(
    dir: &dyn ObjectHandle,
    whence: Option<u64>,
) -> Result<(Vec<(Vec<u8>, u64)>, bool), mdcache::Status> {
    let mut out = Vec::new();
    let eof = dir.readdir(whence, &mut |di| {
        out.push((di.name.to_vec(), di.cookie));
        true
    })?;
    Ok((out, eof))
}

pub fn names_of(listing: &[(Vec<u8>, u64)]) -> Vec<Vec<u8>> {
    listing.iter().map(|(n, _)| n.clone()).collect()
}

//! Hashed dirent index with quadratic probing.
//!
//! Each directory owns one [`DirentIndex`]: an ordered tree keyed by a
//! 64-bit hash of the child name. Distinct names can collide, so quadratic
//! probing is layered on top of the tree: the candidate slot for the
//! *j*-th colliding name is `k + j + j²` (mod 2⁶⁴), up to
//! [`CacheConfig::dirent_probe_bound`](crate::CacheConfig) slots. Because
//! deletions only tombstone (they never unlink), probe chains are never
//! broken mid-walk: the first truly vacant slot in a walk proves the name
//! is absent, and a tombstone carrying the searched name always appears
//! before any vacancy its own insertion would have used.
//!
//! The tree is swept only when the whole directory is invalidated or
//! reindexed.

use std::collections::BTreeMap;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

use crate::fsal::FsKey;

/// Fixed seeds so the name hash is stable for the life of the process.
/// Any well-distributed non-cryptographic 64-bit hash works here.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x6c62_272e_07bb_0142,
    0x62b8_2175_6295_c58d,
    0x2f16_7f61_8f9a_8091,
    0x1b87_3bef_9e2b_34c1,
);

/// Hash a child name to its base index key.
#[must_use]
pub fn name_key(name: &[u8]) -> u64 {
    let state = ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    state.hash_one(name)
}

/// The candidate slot for probe step `j` of base key `k`.
#[inline]
fn probe(k: u64, j: u64) -> u64 {
    k.wrapping_add(j).wrapping_add(j.wrapping_mul(j))
}

bitflags! {
    /// Visibility flags for [`DirentIndex::lookup_slot`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Tombstoned dirents are visible to the lookup.
        const TOMBSTONES = 1 << 0;
    }
}

/// A child name within a directory.
#[derive(Debug, Clone)]
pub struct Dirent {
    /// The name bytes.
    pub name: Bytes,
    /// Identity key of the child this name resolved to.
    ///
    /// A weak reference by design: holding a key keeps nothing alive, and
    /// readers materialize the child with a fresh entry-store lookup.
    pub child: FsKey,
    /// Deletion tombstone. A tombstoned dirent is invisible to positive
    /// lookups but keeps occupying its slot until the directory is swept.
    pub deleted: bool,
}

/// Insertion failed because the probe walk was exhausted.
///
/// The caller must fall back to an uncached backend lookup and queue the
/// directory for reindexing; this error never crosses the facade boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dirent insertion exhausted the probe bound")]
pub struct TooManyCollisions;

/// What [`DirentIndex::insert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new (or tombstone-revived) live dirent now sits at `slot`.
    Inserted {
        /// The tree key the dirent occupies.
        slot: u64,
    },
    /// A live dirent with this name already existed at `slot`; its child
    /// key was left untouched.
    Existed {
        /// The tree key the dirent occupies.
        slot: u64,
    },
}

impl InsertOutcome {
    /// The slot either way.
    #[must_use]
    pub fn slot(self) -> u64 {
        match self {
            Self::Inserted { slot } | Self::Existed { slot } => slot,
        }
    }
}

/// Per-directory name→child index.
#[derive(Debug)]
pub struct DirentIndex {
    tree: BTreeMap<u64, Dirent>,
    probe_bound: u32,
    live: usize,
}

impl DirentIndex {
    /// Create an empty index with the given probe bound.
    #[must_use]
    pub fn new(probe_bound: u32) -> Self {
        Self {
            tree: BTreeMap::new(),
            probe_bound,
            live: 0,
        }
    }

    /// Insert `name` resolving to `child`.
    ///
    /// Reuses a tombstoned slot whose name equals `name` rather than
    /// creating a duplicate further down the probe sequence. A live
    /// duplicate is reported as [`InsertOutcome::Existed`] and left alone.
    pub fn insert(&mut self, name: &[u8], child: FsKey) -> Result<InsertOutcome, TooManyCollisions> {
        self.insert_with_key(name_key(name), name, child)
    }

    /// [`insert`](Self::insert) with a caller-chosen base key. Exists so
    /// collision behavior is exercisable without reversing the hash.
    #[doc(hidden)]
    pub fn insert_with_key(
        &mut self,
        k: u64,
        name: &[u8],
        child: FsKey,
    ) -> Result<InsertOutcome, TooManyCollisions> {
        for j in 0..u64::from(self.probe_bound) {
            let slot = probe(k, j);
            match self.tree.get_mut(&slot) {
                None => {
                    self.tree.insert(
                        slot,
                        Dirent {
                            name: Bytes::copy_from_slice(name),
                            child,
                            deleted: false,
                        },
                    );
                    self.live += 1;
                    return Ok(InsertOutcome::Inserted { slot });
                }
                Some(d) if d.name == name => {
                    if d.deleted {
                        d.deleted = false;
                        d.child = child;
                        self.live += 1;
                        return Ok(InsertOutcome::Inserted { slot });
                    }
                    return Ok(InsertOutcome::Existed { slot });
                }
                Some(_) => {}
            }
        }
        Err(TooManyCollisions)
    }

    /// Find the live dirent for `name`, if any. Tombstones are invisible.
    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<&Dirent> {
        self.lookup_with_key(name_key(name), name)
    }

    /// [`lookup`](Self::lookup) with a caller-chosen base key.
    #[doc(hidden)]
    #[must_use]
    pub fn lookup_with_key(&self, k: u64, name: &[u8]) -> Option<&Dirent> {
        for j in 0..u64::from(self.probe_bound) {
            let slot = probe(k, j);
            match self.tree.get(&slot) {
                None => return None,
                Some(d) if d.name == name => return (!d.deleted).then_some(d),
                Some(_) => {}
            }
        }
        None
    }

    /// Whether a tombstone for `name` is present.
    #[must_use]
    pub fn has_tombstone(&self, name: &[u8]) -> bool {
        let k = name_key(name);
        for j in 0..u64::from(self.probe_bound) {
            let slot = probe(k, j);
            match self.tree.get(&slot) {
                None => return false,
                Some(d) if d.name == name => return d.deleted,
                Some(_) => {}
            }
        }
        false
    }

    /// Direct slot lookup, used by cookie-based readdir restart.
    #[must_use]
    pub fn lookup_slot(&self, slot: u64, flags: LookupFlags) -> Option<&Dirent> {
        let d = self.tree.get(&slot)?;
        if d.deleted && !flags.contains(LookupFlags::TOMBSTONES) {
            return None;
        }
        Some(d)
    }

    /// Tombstone the dirent for `name`. Returns `true` if a live dirent
    /// was found. The slot is not unlinked.
    pub fn tombstone(&mut self, name: &[u8]) -> bool {
        let k = name_key(name);
        for j in 0..u64::from(self.probe_bound) {
            let slot = probe(k, j);
            match self.tree.get_mut(&slot) {
                None => return false,
                Some(d) if d.name == name => {
                    if d.deleted {
                        return false;
                    }
                    d.deleted = true;
                    self.live -= 1;
                    return true;
                }
                Some(_) => {}
            }
        }
        false
    }

    /// Unlink and free everything. Only valid while the directory is being
    /// torn down or fully reindexed.
    pub fn clean(&mut self) {
        self.tree.clear();
        self.live = 0;
    }

    /// Iterate all dirents (live and tombstoned) in slot-key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Dirent)> {
        self.tree.iter().map(|(k, d)| (*k, d))
    }

    /// Number of live (non-tombstoned) dirents.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.live
    }

    /// Total slots occupied, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the index holds no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

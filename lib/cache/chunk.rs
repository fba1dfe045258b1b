//! Directory chunks and the cache-owned cookie space.
//!
//! Directory contents may be held partially: runs of consecutive dirents
//! ("chunks"), each remembering the backend continuation cookie that
//! produced it. Cookies handed to clients are the cache's own (dense,
//! monotonic, assigned at population time), never the backend's, so a
//! backend is free to use whatever cookie scheme it likes. Invariants:
//! cookies are monotonic within a chunk, chunks partition the populated
//! cookie space without overlap, and the `complete` bit on the owning
//! directory is set only once chunks cover the backend's full enumeration.

use std::collections::BTreeMap;

/// First cookie the cache ever hands out. 0 means "from the start" on the
/// wire, and the two cookies after it are conventionally reserved for the
/// dot entries, which the protocol engine synthesizes itself.
pub(crate) const FIRST_COOKIE: u64 = 3;

/// One populated run of dirents.
#[derive(Debug)]
struct Chunk {
    /// Cookie of the first entry in this chunk.
    first_cookie: u64,
    /// Index slot keys of the member dirents, in enumeration order. The
    /// entry at position `i` owns cookie `first_cookie + i`.
    slots: Vec<u64>,
    /// The backend cookie to resume from after this chunk; `None` when
    /// the enumeration ended here.
    backend_next: Option<u64>,
}

/// The populated portion of one directory's cookie space.
#[derive(Debug, Default)]
pub(crate) struct ChunkSpace {
    chunks: BTreeMap<u64, Chunk>,
    next_cookie: u64,
}

impl ChunkSpace {
    pub(crate) fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            next_cookie: FIRST_COOKIE,
        }
    }

    /// Append a freshly fetched run of dirent slots, assigning their
    /// cookies. A `backend_next` of `None` marks the end of the backend's
    /// enumeration.
    pub(crate) fn append(&mut self, slots: Vec<u64>, backend_next: Option<u64>) {
        let first = self.next_cookie;
        self.next_cookie += slots.len() as u64;
        self.chunks.insert(
            first,
            Chunk {
                first_cookie: first,
                slots,
                backend_next,
            },
        );
    }

    /// The backend cookie to resume population from, or `None` to start a
    /// fresh enumeration.
    pub(crate) fn continuation(&self) -> Option<u64> {
        self.chunks.values().next_back().and_then(|c| c.backend_next)
    }

    /// Iterate `(cookie, slot)` pairs in cookie order starting at
    /// `cookie`, across chunk boundaries.
    pub(crate) fn iter_from(&self, cookie: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        let start = cookie.max(FIRST_COOKIE);
        self.chunks
            .range(..=start)
            .next_back()
            .into_iter()
            .chain(self.chunks.range((
                std::ops::Bound::Excluded(start),
                std::ops::Bound::Unbounded,
            )))
            .map(|(_, c)| c)
            .flat_map(move |c| {
                c.slots
                    .iter()
                    .enumerate()
                    .map(move |(i, slot)| (c.first_cookie + i as u64, *slot))
                    .filter(move |(ck, _)| *ck >= start)
            })
    }

    /// Drop every chunk and restart the cookie space. Cookies already
    /// handed out become invalid; callers bump the directory epoch so
    /// clients notice.
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.next_cookie = FIRST_COOKIE;
    }
}

//! Cached directory enumeration.
//!
//! Cookies returned to clients are the cache's own chunk cookies, never
//! the backend's. The directory's enumeration epoch acts as the cookie
//! verifier and is packed into the cookie's top bits: a client resuming
//! with a cookie minted under an older epoch gets `BadCookie` and must
//! restart from the beginning. An epoch bump *during* an enumeration ends
//! that pass early with a consistent prefix (no error; the entries
//! already delivered were true as of the pass's start).

use bytes::Bytes;
use tracing::{trace, trace_span, warn};

use crate::fsal::{DirentInfo, FsKey, ReaddirCb, Status, StatusResult};

use super::super::avl::LookupFlags;
use super::super::chunk::FIRST_COOKIE;
use super::handle::MdcHandle;
use super::{adopt_entry, on_stale};

const POS_BITS: u32 = 40;
const POS_MASK: u64 = (1 << POS_BITS) - 1;
const EPOCH_MASK: u64 = (1 << 24) - 1;

fn pack(epoch: u64, pos: u64) -> u64 {
    ((epoch & EPOCH_MASK) << POS_BITS) | (pos & POS_MASK)
}

fn unpack(cookie: u64) -> (u64, u64) {
    (cookie >> POS_BITS, cookie & POS_MASK)
}

enum Step {
    /// Enumeration covered the whole directory.
    Eof,
    /// The callback asked to stop, or the epoch moved mid-pass.
    Stopped,
    /// More chunks needed, resuming the backend at this cookie.
    Populate(Option<u64>),
    /// A served dirent's child is no longer in the store; re-observe it.
    Missing(Bytes),
}

pub(super) fn run(h: &MdcHandle, whence: Option<u64>, cb: &mut ReaddirCb<'_>) -> StatusResult<bool> {
    h.shared().check_live()?;
    if h.core().is_dead() {
        return Err(Status::Stale);
    }
    let verify_tag = whence.map(|c| unpack(c).0);
    let mut pos = whence.map_or(FIRST_COOKIE, |c| unpack(c).1.max(FIRST_COOKIE));
    let mut expect_epoch: Option<u64> = None;

    loop {
        let step = {
            let content = h.entry().content.read();
            let dir = content.dir().ok_or(Status::NotDir)?;

            match expect_epoch {
                None => {
                    if let Some(tag) = verify_tag {
                        if tag != dir.epoch & EPOCH_MASK {
                            return Err(Status::BadCookie);
                        }
                    }
                    expect_epoch = Some(dir.epoch);
                }
                Some(e) if e != dir.epoch => {
                    // The namespace moved while we were populating. The
                    // prefix already delivered is consistent; stop here.
                    return Ok(false);
                }
                Some(_) => {}
            }

            let mut step = None;
            for (ck, slot) in dir.chunks.iter_from(pos) {
                // Tombstoned slots stay in the cookie space but are not
                // listed.
                let Some(d) = dir.index.lookup_slot(slot, LookupFlags::empty()) else {
                    pos = ck + 1;
                    continue;
                };
                let child = match h.shared().store.lookup(&d.child) {
                    Some(c) if c.ref_get().is_ok() => c,
                    // Reclaimed (or mid-reclaim) under a live dirent:
                    // materialize it again via the backend.
                    _ => {
                        step = Some(Step::Missing(d.name.clone()));
                        break;
                    }
                };
                let attrs = child.attr.read().attrs.clone();
                let handle = MdcHandle::new(
                    std::sync::Arc::clone(h.shared()),
                    std::sync::Arc::clone(h.core()),
                    child,
                );
                let keep_going = cb(DirentInfo {
                    name: d.name.clone(),
                    handle: Box::new(handle),
                    attrs,
                    cookie: pack(dir.epoch, ck + 1),
                });
                pos = ck + 1;
                if !keep_going {
                    step = Some(Step::Stopped);
                    break;
                }
            }

            step.unwrap_or(if dir.complete {
                Step::Eof
            } else {
                Step::Populate(dir.chunks.continuation())
            })
        };

        match step {
            Step::Eof => return Ok(true),
            Step::Stopped => return Ok(false),
            Step::Populate(cont) => {
                let epoch0 = expect_epoch.unwrap_or(0);
                populate(h, epoch0, cont)?;
            }
            Step::Missing(name) => rematerialize(h, &name)?,
        }
    }
}

/// Fetch one chunk from the backend and install it. No directory lock is
/// held across the subcall; the install re-validates that nobody else
/// populated or invalidated in the meantime and quietly discards the
/// batch if someone did (the outer loop re-reads either way).
fn populate(h: &MdcHandle, epoch0: u64, cont: Option<u64>) -> StatusResult<()> {
    let chunk_size = h.shared().cfg.chunk_size;
    let mut batch: Vec<DirentInfo> = Vec::with_capacity(chunk_size);
    let eof = {
        let _span = trace_span!("subcall", serial = h.entry().serial, op = "readdir").entered();
        h.entry().sub.readdir(cont, &mut |di| {
            batch.push(di);
            batch.len() < chunk_size
        })
    }
    .map_err(|e| on_stale(h.shared(), h.entry(), e))?;

    if batch.is_empty() && !eof {
        // A backend that reports neither progress nor eof would spin us.
        warn!(serial = h.entry().serial, "backend readdir made no progress; treating as eof");
    }
    let backend_next = batch.last().map(|d| d.cookie);

    // Children enter the store before the parent lock is taken: entry
    // creation takes lane mutexes, which order before content locks.
    let mut adopted: Vec<(Bytes, FsKey)> = Vec::with_capacity(batch.len());
    for di in batch {
        let DirentInfo {
            name,
            handle,
            attrs,
            ..
        } = di;
        let key = handle.key();
        adopt_entry(h.shared(), h.core(), handle, attrs);
        adopted.push((name, key));
    }

    let mut queue_reindex = false;
    {
        let mut content = h.entry().content.write();
        let Some(dir) = content.dir_mut() else {
            return Ok(());
        };
        if dir.epoch != epoch0 || dir.complete || dir.chunks.continuation() != cont {
            trace!(serial = h.entry().serial, "discarding raced readdir chunk");
            return Ok(());
        }
        let mut slots = Vec::with_capacity(adopted.len());
        for (name, key) in &adopted {
            match dir.index.insert(name, key.clone()) {
                Ok(outcome) => slots.push(outcome.slot()),
                Err(_) => {
                    // Degraded: the name is unenumerable until the reaper
                    // reindexes this directory.
                    warn!(serial = h.entry().serial, "probe bound hit during population");
                    dir.needs_reindex = true;
                    queue_reindex = true;
                }
            }
        }
        let at_eof = eof || adopted.is_empty();
        dir.chunks
            .append(slots, if at_eof { None } else { backend_next });
        if at_eof {
            dir.complete = true;
        }
    }
    if queue_reindex {
        h.shared().lru.queue_reindex(h.entry());
    }
    Ok(())
}

/// A dirent's weak child reference failed to materialize from the store;
/// re-observe the child through the backend, or tombstone the name if it
/// is gone.
fn rematerialize(h: &MdcHandle, name: &Bytes) -> StatusResult<()> {
    let r = {
        let _span = trace_span!("subcall", serial = h.entry().serial, op = "lookup").entered();
        h.entry().sub.lookup(name)
    };
    match r {
        Ok((sub, attrs)) => {
            adopt_entry(h.shared(), h.core(), sub, attrs);
            Ok(())
        }
        Err(Status::NoEnt) => {
            let mut content = h.entry().content.write();
            if let Some(dir) = content.dir_mut() {
                dir.index.tombstone(name);
                dir.invalidate(false);
            }
            Ok(())
        }
        Err(e) => Err(on_stale(h.shared(), h.entry(), e)),
    }
}

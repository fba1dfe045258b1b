//! Cache object handles: the per-object half of the facade.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, trace_span, warn};

use crate::fsal::{
    Attributes, FsKey, ObjectHandle, ObjectType, OpenFlags, ReaddirCb, SetAttrs, Status,
    StatusResult, WriteVerifier,
};

use super::super::CacheShared;
use super::super::entry::{ContentState, Entry};
use super::super::export_map::{self, ExportCore};
use super::{adopt, current_attrs, new_expiry, on_stale, readdir};

/// A referenced handle to a cache entry, presented to the protocol engine
/// as an ordinary [`ObjectHandle`].
///
/// Holding one pins the entry: the reference is taken at construction and
/// dropped with the handle, which is what lets the reaper run without
/// invalidating handles held by in-flight requests.
pub struct MdcHandle {
    shared: Arc<CacheShared>,
    core: Arc<ExportCore>,
    entry: Arc<Entry>,
}

impl MdcHandle {
    /// Wrap an entry whose reference the caller has already taken.
    pub(super) fn new(shared: Arc<CacheShared>, core: Arc<ExportCore>, entry: Arc<Entry>) -> Self {
        Self {
            shared,
            core,
            entry,
        }
    }

    pub(super) fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    pub(super) fn core(&self) -> &Arc<ExportCore> {
        &self.core
    }

    pub(super) fn shared(&self) -> &Arc<CacheShared> {
        &self.shared
    }

    /// Run an object subcall under a trace span.
    fn subcall<T>(&self, op: &'static str, f: impl FnOnce(&dyn ObjectHandle) -> T) -> T {
        let _span = trace_span!("subcall", serial = self.entry.serial, op).entered();
        f(self.entry.sub.as_ref())
    }

    /// Gate every operation on process liveness and export liveness. A
    /// handle whose export was unexported answers Stale from here on.
    fn check(&self) -> StatusResult<()> {
        self.shared.check_live()?;
        if self.core.is_dead() {
            return Err(Status::Stale);
        }
        Ok(())
    }

    fn require_dir(&self) -> StatusResult<()> {
        if self.entry.obj_type == ObjectType::Directory {
            Ok(())
        } else {
            Err(Status::NotDir)
        }
    }

    /// Install backend-refreshed attributes.
    fn store_attrs(&self, fresh: &Attributes) {
        let mut attr = self.entry.attr.write();
        attr.attrs = fresh.clone();
        attr.fetched = true;
        attr.expires_at = Some(new_expiry(&self.core));
    }

    /// Expire our own cached attributes (something changed them).
    fn dirty_attrs(&self) {
        self.entry.attr.write().expire();
    }

    /// Namespace changed under this directory: bump the enumeration
    /// epoch, drop chunks, expire our attributes. The dirent index itself
    /// is adjusted by the caller.
    fn dirty_namespace(&self) {
        {
            let mut content = self.entry.content.write();
            if let Some(dir) = content.dir_mut() {
                dir.invalidate(false);
            }
        }
        self.dirty_attrs();
    }

    /// Record a freshly observed child name in our dirent index. Probe
    /// overflow degrades the directory to uncached lookups and queues it
    /// for reindexing; the observation itself still succeeds.
    fn note_child(&self, name: &[u8], child_key: &FsKey) {
        let mut content = self.entry.content.write();
        let Some(dir) = content.dir_mut() else { return };
        match dir.index.insert(name, child_key.clone()) {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    serial = self.entry.serial,
                    "dirent probe bound exhausted; directory queued for reindex"
                );
                dir.needs_reindex = true;
                drop(content);
                self.shared.lru.queue_reindex(&self.entry);
            }
        }
    }

    /// Resolve another handle (by identity key) to its cache entry. Every
    /// handle the protocol holds came through this cache, so a miss means
    /// the object got reclaimed out from under a live handle, surfaced
    /// as Stale.
    fn resolve_peer(&self, other: &dyn ObjectHandle) -> StatusResult<Arc<Entry>> {
        let key = other.key();
        self.shared.store.lookup(&key).ok_or(Status::Stale)
    }
}

impl Drop for MdcHandle {
    fn drop(&mut self) {
        self.shared.release_ref(&self.entry);
    }
}

impl ObjectHandle for MdcHandle {
    fn key(&self) -> FsKey {
        self.entry.key.clone()
    }

    fn object_type(&self) -> ObjectType {
        self.entry.obj_type
    }

    fn getattrs(&self) -> StatusResult<Attributes> {
        self.check()?;
        let out = current_attrs(&self.shared, &self.core, &self.entry)?;
        self.shared.lru.touch(&self.entry);
        Ok(out)
    }

    fn setattrs(&self, set: &SetAttrs) -> StatusResult<Attributes> {
        self.check()?;
        let fresh = self
            .subcall("setattrs", |s| s.setattrs(set))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        self.store_attrs(&fresh);
        self.shared.lru.touch(&self.entry);
        Ok(fresh)
    }

    fn lookup(&self, name: &[u8]) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)> {
        self.check()?;
        self.require_dir()?;

        // Cache-first: a live dirent plus a reachable child answers
        // without touching the backend; a complete directory answers
        // negatives authoritatively.
        let cached: Result<Option<FsKey>, Status> = {
            let content = self.entry.content.read();
            let dir = content.dir().ok_or(Status::NotDir)?;
            match dir.index.lookup(name) {
                Some(d) => Ok(Some(d.child.clone())),
                None if dir.complete && !dir.index.has_tombstone(name) => Err(Status::NoEnt),
                None => Ok(None),
            }
        };

        if let Some(child_key) = cached? {
            if let Some(child) = self.shared.store.lookup(&child_key) {
                if child.ref_get().is_ok() {
                    export_map::ensure_mapping(&self.core, &child);
                    self.shared.lru.touch(&self.entry);
                    self.shared.lru.touch(&child);
                    let h = MdcHandle::new(
                        Arc::clone(&self.shared),
                        Arc::clone(&self.core),
                        child,
                    );
                    match current_attrs(&self.shared, &self.core, h.entry()) {
                        Ok(attrs) => {
                            trace!(serial = self.entry.serial, "lookup served from cache");
                            return Ok((Box::new(h), attrs));
                        }
                        // Child went stale under the dirent: drop the
                        // handle (releasing the ref) and re-observe.
                        Err(_) => drop(h),
                    }
                }
            }
            // Child reclaimed or stale under a live dirent: fall through
            // to the backend and re-observe.
        }

        let (sub, attrs) = self
            .subcall("lookup", |s| s.lookup(name))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        let child_key = sub.key();
        let h = adopt(&self.shared, &self.core, sub, attrs.clone())?;
        self.note_child(name, &child_key);
        self.shared.lru.touch(&self.entry);
        Ok((Box::new(h), attrs))
    }

    fn readdir(&self, whence: Option<u64>, cb: &mut ReaddirCb<'_>) -> StatusResult<bool> {
        readdir::run(self, whence, cb)
    }

    fn create(
        &self,
        name: &[u8],
        kind: ObjectType,
        attrs: &SetAttrs,
    ) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)> {
        self.check()?;
        self.require_dir()?;
        let (sub, fresh) = self
            .subcall("create", |s| s.create(name, kind, attrs))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        let child_key = sub.key();
        let h = adopt(&self.shared, &self.core, sub, fresh.clone())?;
        self.note_child(name, &child_key);
        self.dirty_namespace();
        Ok((Box::new(h), fresh))
    }

    fn unlink(&self, name: &[u8]) -> StatusResult<()> {
        self.check()?;
        self.require_dir()?;
        self.subcall("unlink", |s| s.unlink(name))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;

        let child_key = {
            let mut content = self.entry.content.write();
            match content.dir_mut() {
                Some(dir) => {
                    let key = dir.index.lookup(name).map(|d| d.child.clone());
                    dir.index.tombstone(name);
                    key
                }
                None => None,
            }
        };
        self.dirty_namespace();
        // The child lost a link; its nlink/ctime are no longer ours to
        // serve.
        if let Some(key) = child_key {
            if let Some(child) = self.shared.store.lookup(&key) {
                child.attr.write().expire();
            }
        }
        Ok(())
    }

    fn rename(
        &self,
        old_name: &[u8],
        new_parent: &dyn ObjectHandle,
        new_name: &[u8],
    ) -> StatusResult<()> {
        self.check()?;
        self.require_dir()?;
        let target = self.resolve_peer(new_parent)?;
        if target.obj_type != ObjectType::Directory {
            return Err(Status::NotDir);
        }

        // One internal retry when the backend reports a race with an
        // upcall; after that the conflict surfaces.
        let mut attempt = 0;
        loop {
            let r = self.subcall("rename", |s| {
                s.rename(old_name, target.sub.as_ref(), new_name)
            });
            match r {
                Ok(()) => break,
                Err(Status::Conflict) if attempt == 0 => {
                    attempt += 1;
                    trace!(serial = self.entry.serial, "rename conflict, retrying once");
                }
                Err(e) => return Err(on_stale(&self.shared, &self.entry, e)),
            }
        }

        // Both parents' content locks, lower address first, so two
        // concurrent renames on the same pair cannot deadlock.
        let src = &self.entry;
        let dst = &target;
        let same = Arc::ptr_eq(src, dst);
        if same {
            let mut content = src.content.write();
            if let Some(dir) = content.dir_mut() {
                let child_key = dir.index.lookup(old_name).map(|d| d.child.clone());
                dir.index.tombstone(old_name);
                dir.index.tombstone(new_name);
                if let Some(key) = &child_key {
                    let _ = dir.index.insert(new_name, key.clone());
                }
                dir.invalidate(false);
            }
        } else {
            let (first, second) = if Arc::as_ptr(src) < Arc::as_ptr(dst) {
                (src, dst)
            } else {
                (dst, src)
            };
            let mut c1 = first.content.write();
            let mut c2 = second.content.write();
            let (src_c, dst_c) = if Arc::ptr_eq(first, src) {
                (&mut c1, &mut c2)
            } else {
                (&mut c2, &mut c1)
            };
            let child_key = src_c.dir_mut().and_then(|dir| {
                let key = dir.index.lookup(old_name).map(|d| d.child.clone());
                dir.index.tombstone(old_name);
                dir.invalidate(false);
                key
            });
            if let Some(dir) = dst_c.dir_mut() {
                dir.index.tombstone(new_name);
                if let Some(key) = &child_key {
                    let _ = dir.index.insert(new_name, key.clone());
                }
                dir.invalidate(false);
            }
        }
        self.dirty_attrs();
        if !same {
            target.attr.write().expire();
        }
        Ok(())
    }

    fn link(&self, new_parent: &dyn ObjectHandle, name: &[u8]) -> StatusResult<()> {
        self.check()?;
        let parent = self.resolve_peer(new_parent)?;
        self.subcall("link", |s| s.link(parent.sub.as_ref(), name))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        {
            let mut content = parent.content.write();
            if let Some(dir) = content.dir_mut() {
                let _ = dir.index.insert(name, self.entry.key.clone());
                dir.invalidate(false);
            }
        }
        parent.attr.write().expire();
        // Our nlink changed.
        self.dirty_attrs();
        Ok(())
    }

    fn symlink(
        &self,
        name: &[u8],
        target: &[u8],
        attrs: &SetAttrs,
    ) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)> {
        self.check()?;
        self.require_dir()?;
        let (sub, fresh) = self
            .subcall("symlink", |s| s.symlink(name, target, attrs))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        let child_key = sub.key();
        let h = adopt(&self.shared, &self.core, sub, fresh.clone())?;
        // We know the content we just created.
        if let ContentState::Link(cached) = &mut *h.entry().content.write() {
            *cached = Some(Bytes::copy_from_slice(target));
        }
        self.note_child(name, &child_key);
        self.dirty_namespace();
        Ok((Box::new(h), fresh))
    }

    fn readlink(&self) -> StatusResult<Bytes> {
        self.check()?;
        {
            let content = self.entry.content.read();
            if let ContentState::Link(Some(target)) = &*content {
                let out = target.clone();
                drop(content);
                self.shared.lru.touch(&self.entry);
                return Ok(out);
            }
        }
        let target = self
            .subcall("readlink", |s| s.readlink())
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        if let ContentState::Link(cached) = &mut *self.entry.content.write() {
            *cached = Some(target.clone());
        }
        self.shared.lru.touch(&self.entry);
        Ok(target)
    }

    fn open(&self, flags: OpenFlags) -> StatusResult<()> {
        self.check()?;
        self.subcall("open", |s| s.open(flags))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        if let ContentState::File(f) = &mut *self.entry.content.write() {
            f.opens += 1;
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            self.dirty_attrs();
        }
        self.shared.lru.touch(&self.entry);
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> StatusResult<Bytes> {
        self.check()?;
        // Data is never cached; only the access recency is.
        let out = self
            .subcall("read", |s| s.read(offset, len))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        self.shared.lru.touch(&self.entry);
        Ok(out)
    }

    fn write(&self, offset: u64, data: &[u8]) -> StatusResult<u64> {
        self.check()?;
        let n = self
            .subcall("write", |s| s.write(offset, data))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))?;
        // Size/mtime moved under us.
        self.dirty_attrs();
        self.shared.lru.touch(&self.entry);
        Ok(n)
    }

    fn commit(&self, offset: u64, len: u64) -> StatusResult<WriteVerifier> {
        self.check()?;
        self.subcall("commit", |s| s.commit(offset, len))
            .map_err(|e| on_stale(&self.shared, &self.entry, e))
    }

    fn close(&self) -> StatusResult<()> {
        self.subcall("close", |s| s.close())?;
        if let ContentState::File(f) = &mut *self.entry.content.write() {
            f.opens = f.opens.saturating_sub(1);
        }
        Ok(())
    }

    fn handle_digest(&self) -> Bytes {
        // Wire formats are the backend's concern, digest included.
        self.entry.sub.handle_digest()
    }
}

//! The stacking facade.
//!
//! [`MdcExport`] and its object handles implement the same
//! [`Export`]/[`ObjectHandle`] contract they consume, so the protocol
//! engine cannot tell the cache from a plain backend. Reads are answered
//! from cache when the cache is authoritative (unexpired attributes, a
//! live dirent, populated chunks) and the LRU is touched; everything else
//! is a *subcall*, a traced delegation to the sub-export, whose result
//! populates the cache on the way back out. Writes invalidate the minimal
//! set they affect.
//!
//! Export-level queries are forwarded unchanged: the cache only caches
//! metadata and imposes no limits of its own.

mod handle;
mod readdir;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{trace, trace_span, warn};

use crate::fsal::{
    AclSupport, AttrMask, Attributes, DynamicFsInfo, Export, FsKey, FsOption, LayoutType,
    ObjectHandle, Quota, QuotaType, StateHandle, StateKind, Status, StatusResult, UpcallOps,
};

use super::CacheShared;
use super::entry::Entry;
use super::export_map::{self, ExportCore};
use super::upcall::UpcallHandler;

pub(crate) use handle::MdcHandle;

/// A cache export stacked over a sub-export.
pub struct MdcExport {
    shared: Arc<CacheShared>,
    core: Arc<ExportCore>,
    upcalls: Arc<UpcallHandler>,
}

impl MdcExport {
    pub(crate) fn create(
        shared: Arc<CacheShared>,
        sub: Arc<dyn Export>,
        super_ops: Option<Arc<dyn UpcallOps>>,
    ) -> Self {
        let core = Arc::new(ExportCore {
            id: shared.next_export_id(),
            name: format!("{}/MDC", sub.name()),
            sub,
            attr_ttl: shared.cfg.attr_ttl,
            attr_jitter: shared.cfg.attr_ttl_jitter,
            dead: std::sync::atomic::AtomicBool::new(false),
            exp_lock: RwLock::new(FxHashMap::default()),
        });
        // The cache's upcall vector sits between the backend and the
        // host's: hand `upcall_ops()` to the sub-backend when wiring it.
        let upcalls = Arc::new(UpcallHandler::new(Arc::clone(&shared), super_ops));
        trace!(export = core.id, name = %core.name, "export wrapped");
        Self {
            shared,
            core,
            upcalls,
        }
    }

    /// The upcall vector the sub-backend under this export must be given.
    #[must_use]
    pub fn upcall_ops(&self) -> Arc<dyn UpcallOps> {
        Arc::clone(&self.upcalls) as Arc<dyn UpcallOps>
    }

    /// Entries currently associated with this export. Zero after a
    /// completed unexport.
    #[must_use]
    pub fn associated_entries(&self) -> usize {
        self.core.exp_lock.read().len()
    }

    fn sub(&self) -> &dyn Export {
        self.core.sub.as_ref()
    }

    /// Obtain a cache handle for a backend object just observed through
    /// `sub`, together with the attributes the backend reported.
    fn adopt(&self, sub: Box<dyn ObjectHandle>, attrs: Attributes) -> StatusResult<MdcHandle> {
        adopt(&self.shared, &self.core, sub, attrs)
    }
}

/// Jittered attribute expiry: TTL plus a uniform fraction so a mass
/// create does not expire as a thundering herd.
pub(super) fn new_expiry(core: &ExportCore) -> Instant {
    let jitter = core.attr_ttl.mul_f64(core.attr_jitter * rand::random::<f64>());
    Instant::now() + core.attr_ttl + jitter
}

/// Run an export-level subcall under a trace span.
fn subcall<T>(core: &ExportCore, op: &'static str, f: impl FnOnce(&dyn Export) -> T) -> T {
    let _span = trace_span!("subcall", export = core.id, op).entered();
    f(core.sub.as_ref())
}

/// First-observation path shared by lookup, create, readdir population
/// and handle revival: get-or-create the entry, seed its attributes, put
/// it on the LRU, associate it with `core`'s export, and hand back a
/// referenced handle.
pub(super) fn adopt(
    shared: &Arc<CacheShared>,
    core: &Arc<ExportCore>,
    sub: Box<dyn ObjectHandle>,
    attrs: Attributes,
) -> StatusResult<MdcHandle> {
    let entry = adopt_entry(shared, core, sub, attrs);
    entry.ref_get()?;
    shared.lru.touch(&entry);
    Ok(MdcHandle::new(
        Arc::clone(shared),
        Arc::clone(core),
        entry,
    ))
}

/// [`adopt`] without taking a caller reference; used where only the cache
/// state matters (readdir population).
pub(super) fn adopt_entry(
    shared: &Arc<CacheShared>,
    core: &Arc<ExportCore>,
    sub: Box<dyn ObjectHandle>,
    attrs: Attributes,
) -> Arc<Entry> {
    let key = sub.key();
    let obj_type = attrs.obj_type;
    let (entry, created) = shared.store.get_or_create(
        key,
        sub,
        obj_type,
        shared.lru.lane_count(),
        shared.cfg.dirent_probe_bound,
    );
    if created {
        shared.lru.insert(&entry);
    }
    export_map::ensure_mapping(core, &entry);
    {
        let now = Instant::now();
        let mut attr = entry.attr.write();
        if !attr.current(now) {
            attr.attrs = attrs;
            attr.fetched = true;
            attr.expires_at = Some(new_expiry(core));
        }
    }
    entry
}

impl Export for MdcExport {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn lookup_path(&self, path: &str) -> StatusResult<Box<dyn ObjectHandle>> {
        self.shared.check_live()?;
        if self.core.is_dead() {
            return Err(Status::Stale);
        }
        let sub = subcall(&self.core, "lookup_path", |s| s.lookup_path(path))?;
        let attrs = sub.getattrs()?;
        Ok(Box::new(self.adopt(sub, attrs)?))
    }

    fn extract_handle(&self, wire: &[u8]) -> StatusResult<FsKey> {
        subcall(&self.core, "extract_handle", |s| s.extract_handle(wire))
    }

    fn create_handle(&self, key: &FsKey) -> StatusResult<Box<dyn ObjectHandle>> {
        self.shared.check_live()?;
        if self.core.is_dead() {
            return Err(Status::Stale);
        }
        // Wire-handle revival: prefer the cached entry.
        if let Some(entry) = self.shared.store.lookup(key) {
            if entry.ref_get().is_ok() {
                export_map::ensure_mapping(&self.core, &entry);
                self.shared.lru.touch(&entry);
                return Ok(Box::new(MdcHandle::new(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.core),
                    entry,
                )));
            }
        }
        let sub = subcall(&self.core, "create_handle", |s| s.create_handle(key))?;
        let attrs = sub.getattrs()?;
        Ok(Box::new(self.adopt(sub, attrs)?))
    }

    fn unexport(&self) {
        // Stop new associations, unexport the sub-export, then drain our
        // association list.
        self.core
            .dead
            .store(true, std::sync::atomic::Ordering::SeqCst);
        subcall(&self.core, "unexport", |e| e.unexport());
        export_map::unexport_walk(&self.shared, &self.core);
        let leftover = self.core.exp_lock.read().len();
        if leftover != 0 {
            warn!(export = self.core.id, leftover, "unexport left associations behind");
        }
    }

    fn release(&self) {
        subcall(&self.core, "release", |e| e.release());
        trace!(export = self.core.id, "export released");
    }

    fn maxfilesize(&self) -> u64 {
        self.sub().maxfilesize()
    }

    fn maxread(&self) -> u64 {
        self.sub().maxread()
    }

    fn maxwrite(&self) -> u64 {
        self.sub().maxwrite()
    }

    fn maxlink(&self) -> u32 {
        self.sub().maxlink()
    }

    fn maxnamelen(&self) -> u32 {
        self.sub().maxnamelen()
    }

    fn maxpathlen(&self) -> u32 {
        self.sub().maxpathlen()
    }

    fn lease_time(&self) -> Duration {
        self.sub().lease_time()
    }

    fn acl_support(&self) -> AclSupport {
        self.sub().acl_support()
    }

    fn supported_attrs(&self) -> AttrMask {
        self.sub().supported_attrs()
    }

    fn umask(&self) -> u32 {
        self.sub().umask()
    }

    fn xattr_access_rights(&self) -> u32 {
        self.sub().xattr_access_rights()
    }

    fn fs_supports(&self, opt: FsOption) -> bool {
        self.sub().fs_supports(opt)
    }

    fn dynamic_info(&self) -> StatusResult<DynamicFsInfo> {
        subcall(&self.core, "dynamic_info", |e| e.dynamic_info())
    }

    fn layout_types(&self) -> Vec<LayoutType> {
        self.sub().layout_types()
    }

    fn layout_blocksize(&self) -> u32 {
        self.sub().layout_blocksize()
    }

    fn maximum_segments(&self) -> u32 {
        self.sub().maximum_segments()
    }

    fn loc_body_size(&self) -> usize {
        self.sub().loc_body_size()
    }

    fn device_list(&self, layout: LayoutType) -> StatusResult<Vec<u64>> {
        subcall(&self.core, "device_list", |s| s.device_list(layout))
    }

    fn write_verifier(&self) -> Bytes {
        self.sub().write_verifier()
    }

    fn check_quota(&self, path: &str, quota_type: QuotaType) -> StatusResult<()> {
        subcall(&self.core, "check_quota", |s| s.check_quota(path, quota_type))
    }

    fn get_quota(&self, path: &str, quota_type: QuotaType, id: u32) -> StatusResult<Quota> {
        subcall(&self.core, "get_quota", |s| s.get_quota(path, quota_type, id))
    }

    fn set_quota(
        &self,
        path: &str,
        quota_type: QuotaType,
        id: u32,
        quota: &Quota,
    ) -> StatusResult<Quota> {
        subcall(&self.core, "set_quota", |s| {
            s.set_quota(path, quota_type, id, quota)
        })
    }

    fn alloc_state(&self, kind: StateKind) -> StatusResult<StateHandle> {
        subcall(&self.core, "alloc_state", |s| s.alloc_state(kind))
    }

    fn free_state(&self, state: StateHandle) {
        subcall(&self.core, "free_state", |s| s.free_state(state));
    }
}

/// Used by the handle side to report lost Stale races without recursing
/// into facade internals.
pub(super) fn on_stale(shared: &Arc<CacheShared>, entry: &Arc<Entry>, status: Status) -> Status {
    if status == Status::Stale {
        shared.mark_unreachable(entry);
    }
    status
}

/// Serve `entry`'s attributes, refreshing from the backend when the
/// cached copy has expired.
pub(super) fn current_attrs(
    shared: &Arc<CacheShared>,
    core: &Arc<ExportCore>,
    entry: &Arc<Entry>,
) -> StatusResult<Attributes> {
    {
        let attr = entry.attr.read();
        if attr.current(Instant::now()) {
            return Ok(attr.attrs.clone());
        }
    }
    let fresh = {
        let _span = trace_span!("subcall", serial = entry.serial, op = "getattrs").entered();
        entry.sub.getattrs()
    }
    .map_err(|e| on_stale(shared, entry, e))?;
    let mut attr = entry.attr.write();
    attr.attrs = fresh.clone();
    attr.fetched = true;
    attr.expires_at = Some(new_expiry(core));
    Ok(fresh)
}

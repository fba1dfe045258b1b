//! `MemFs`: a deterministic in-memory sub-backend for exercising the
//! cache. Supports failure injection, an unexported latch, and operation
//! counters so tests can assert exactly when the cache went to the
//! backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;

use mdcache::fsal::{
    AclSupport, AttrMask, Attributes, DirentInfo, DynamicFsInfo, Export, FsKey, FsOption,
    LayoutType, ObjectHandle, ObjectType, OpenFlags, Quota, QuotaType, ReaddirCb, SetAttrs,
    StateHandle, StateKind, Status, StatusResult, WriteVerifier,
};

pub struct Node {
    pub kind: ObjectType,
    pub children: BTreeMap<Vec<u8>, u64>,
    pub data: Vec<u8>,
    pub target: Vec<u8>,
    pub nlink: u32,
    pub mode: u32,
    pub change: u64,
    pub opens: u32,
}

impl Node {
    fn new(kind: ObjectType) -> Self {
        Self {
            kind,
            children: BTreeMap::new(),
            data: Vec::new(),
            target: Vec::new(),
            nlink: if kind == ObjectType::Directory { 2 } else { 1 },
            mode: 0o755,
            change: 1,
            opens: 0,
        }
    }
}

#[derive(Default)]
pub struct OpCounters {
    pub lookups: AtomicU64,
    pub getattrs: AtomicU64,
    pub readdirs: AtomicU64,
    pub creates: AtomicU64,
    pub renames: AtomicU64,
}

pub struct MemInner {
    name: String,
    root: u64,
    nodes: Mutex<HashMap<u64, Node>>,
    next_id: AtomicU64,
    next_state: AtomicU64,
    unexported: AtomicBool,
    fail_object_ops: Mutex<Option<Status>>,
    pub counters: OpCounters,
    /// Live backend handles; decremented on drop, so reclaim of a cache
    /// entry is observable here.
    pub handles_alive: AtomicI64,
}

/// The in-memory backend export.
#[derive(Clone)]
pub struct MemFs {
    inner: Arc<MemInner>,
}

impl MemFs {
    pub fn new(name: &str) -> Self {
        let mut nodes = HashMap::new();
        let root = 1;
        nodes.insert(root, Node::new(ObjectType::Directory));
        Self {
            inner: Arc::new(MemInner {
                name: name.to_owned(),
                root,
                nodes: Mutex::new(nodes),
                next_id: AtomicU64::new(2),
                next_state: AtomicU64::new(1),
                unexported: AtomicBool::new(false),
                fail_object_ops: Mutex::new(None),
                counters: OpCounters::default(),
                handles_alive: AtomicI64::new(0),
            }),
        }
    }

    pub fn inner(&self) -> &Arc<MemInner> {
        &self.inner
    }

    pub fn root_id(&self) -> u64 {
        self.inner.root
    }

    /// Seed a node directly, bypassing the cache.
    pub fn add_node(&self, parent: u64, name: &[u8], kind: ObjectType) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut nodes = self.inner.nodes.lock();
        nodes.insert(id, Node::new(kind));
        nodes
            .get_mut(&parent)
            .expect("seed parent exists")
            .children
            .insert(name.to_vec(), id);
        id
    }

    pub fn add_file(&self, parent: u64, name: &[u8]) -> u64 {
        self.add_node(parent, name, ObjectType::Regular)
    }

    pub fn add_dir(&self, parent: u64, name: &[u8]) -> u64 {
        self.add_node(parent, name, ObjectType::Directory)
    }

    /// Remove a node behind the cache's back (for staleness tests).
    pub fn drop_node(&self, id: u64) {
        self.inner.nodes.lock().remove(&id);
    }

    /// Rebind a name inside a directory behind the cache's back, the way
    /// another cluster node would before a rename upcall arrives.
    pub fn relink(&self, parent: u64, old: &[u8], new: &[u8]) {
        let mut nodes = self.inner.nodes.lock();
        let dir = nodes.get_mut(&parent).expect("relink parent exists");
        if let Some(id) = dir.children.remove(old) {
            dir.children.insert(new.to_vec(), id);
            dir.change += 1;
        }
    }

    /// Make every object operation fail with `status` (or clear with
    /// `None`).
    pub fn set_failure(&self, status: Option<Status>) {
        *self.inner.fail_object_ops.lock() = status;
    }

    pub fn lookup_count(&self) -> u64 {
        self.inner.counters.lookups.load(Ordering::Relaxed)
    }

    pub fn getattr_count(&self) -> u64 {
        self.inner.counters.getattrs.load(Ordering::Relaxed)
    }

    pub fn readdir_count(&self) -> u64 {
        self.inner.counters.readdirs.load(Ordering::Relaxed)
    }

    pub fn handles_alive(&self) -> i64 {
        self.inner.handles_alive.load(Ordering::Relaxed)
    }

    fn handle(&self, id: u64, kind: ObjectType) -> MemHandle {
        MemHandle::new(Arc::clone(&self.inner), id, kind)
    }
}

fn key_of(id: u64) -> FsKey {
    FsKey::new(id.to_be_bytes().to_vec())
}

fn id_of(key: &FsKey) -> Option<u64> {
    key.as_bytes().try_into().ok().map(u64::from_be_bytes)
}

impl MemInner {
    fn check(&self) -> StatusResult<()> {
        if self.unexported.load(Ordering::Acquire) {
            return Err(Status::Stale);
        }
        if let Some(s) = *self.fail_object_ops.lock() {
            return Err(s);
        }
        Ok(())
    }

    fn attrs_of(&self, id: u64, node: &Node) -> Attributes {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + node.change);
        Attributes {
            valid: AttrMask::ALL,
            obj_type: node.kind,
            filesize: node.data.len() as u64,
            mode: node.mode,
            uid: 0,
            gid: 0,
            nlink: node.nlink,
            fileid: id,
            atime: t,
            mtime: t,
            ctime: t,
            change: node.change,
            spaceused: node.data.len() as u64,
            rawdev: (0, 0),
        }
    }
}

pub struct MemHandle {
    inner: Arc<MemInner>,
    id: u64,
    kind: ObjectType,
}

impl MemHandle {
    fn new(inner: Arc<MemInner>, id: u64, kind: ObjectType) -> Self {
        inner.handles_alive.fetch_add(1, Ordering::Relaxed);
        Self { inner, id, kind }
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        self.inner.handles_alive.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ObjectHandle for MemHandle {
    fn key(&self) -> FsKey {
        key_of(self.id)
    }

    fn object_type(&self) -> ObjectType {
        self.kind
    }

    fn getattrs(&self) -> StatusResult<Attributes> {
        self.inner.check()?;
        self.inner.counters.getattrs.fetch_add(1, Ordering::Relaxed);
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&self.id).ok_or(Status::Stale)?;
        Ok(self.inner.attrs_of(self.id, node))
    }

    fn setattrs(&self, set: &SetAttrs) -> StatusResult<Attributes> {
        self.inner.check()?;
        let mut nodes = self.inner.nodes.lock();
        let node = nodes.get_mut(&self.id).ok_or(Status::Stale)?;
        if let Some(size) = set.size {
            node.data.resize(size as usize, 0);
        }
        if let Some(mode) = set.mode {
            node.mode = mode;
        }
        node.change += 1;
        let out = self.inner.attrs_of(self.id, node);
        Ok(out)
    }

    fn lookup(&self, name: &[u8]) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)> {
        self.inner.check()?;
        self.inner.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let nodes = self.inner.nodes.lock();
        let dir = nodes.get(&self.id).ok_or(Status::Stale)?;
        if dir.kind != ObjectType::Directory {
            return Err(Status::NotDir);
        }
        let child_id = *dir.children.get(name).ok_or(Status::NoEnt)?;
        let child = nodes.get(&child_id).ok_or(Status::NoEnt)?;
        let attrs = self.inner.attrs_of(child_id, child);
        let kind = child.kind;
        drop(nodes);
        Ok((
            Box::new(MemHandle::new(Arc::clone(&self.inner), child_id, kind)),
            attrs,
        ))
    }

    fn readdir(&self, whence: Option<u64>, cb: &mut ReaddirCb<'_>) -> StatusResult<bool> {
        self.inner.check()?;
        self.inner.counters.readdirs.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<(Vec<u8>, u64, ObjectType, Attributes)> = {
            let nodes = self.inner.nodes.lock();
            let dir = nodes.get(&self.id).ok_or(Status::Stale)?;
            if dir.kind != ObjectType::Directory {
                return Err(Status::NotDir);
            }
            dir.children
                .iter()
                .filter_map(|(name, id)| {
                    nodes
                        .get(id)
                        .map(|n| (name.clone(), *id, n.kind, self.inner.attrs_of(*id, n)))
                })
                .collect()
        };
        let start = whence.unwrap_or(0) as usize;
        for (i, (name, id, kind, attrs)) in snapshot.iter().enumerate().skip(start) {
            let di = DirentInfo {
                name: Bytes::copy_from_slice(name),
                handle: Box::new(MemHandle::new(Arc::clone(&self.inner), *id, *kind)),
                attrs: attrs.clone(),
                cookie: i as u64 + 1,
            };
            if !cb(di) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn create(
        &self,
        name: &[u8],
        kind: ObjectType,
        _attrs: &SetAttrs,
    ) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)> {
        self.inner.check()?;
        self.inner.counters.creates.fetch_add(1, Ordering::Relaxed);
        let child_id = {
            let mut nodes = self.inner.nodes.lock();
            let dir = nodes.get(&self.id).ok_or(Status::Stale)?;
            if dir.kind != ObjectType::Directory {
                return Err(Status::NotDir);
            }
            if dir.children.contains_key(name) {
                return Err(Status::Exists);
            }
            let child_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            nodes.insert(child_id, Node::new(kind));
            let dir = nodes.get_mut(&self.id).expect("checked above");
            dir.children.insert(name.to_vec(), child_id);
            dir.change += 1;
            child_id
        };
        let attrs = {
            let nodes = self.inner.nodes.lock();
            let node = nodes.get(&child_id).expect("just inserted");
            self.inner.attrs_of(child_id, node)
        };
        Ok((
            Box::new(MemHandle::new(Arc::clone(&self.inner), child_id, kind)),
            attrs,
        ))
    }

    fn unlink(&self, name: &[u8]) -> StatusResult<()> {
        self.inner.check()?;
        let mut nodes = self.inner.nodes.lock();
        let dir = nodes.get(&self.id).ok_or(Status::Stale)?;
        let child_id = *dir.children.get(name).ok_or(Status::NoEnt)?;
        let child_shape = nodes
            .get(&child_id)
            .map(|c| (c.kind == ObjectType::Directory, c.children.is_empty()));
        if let Some((true, false)) = child_shape {
            return Err(Status::NotEmpty);
        }
        let dir = nodes.get_mut(&self.id).expect("checked above");
        dir.children.remove(name);
        dir.change += 1;
        match child_shape {
            Some((true, _)) => {
                nodes.remove(&child_id);
            }
            Some((false, _)) => {
                let child = nodes.get_mut(&child_id).expect("checked above");
                child.nlink = child.nlink.saturating_sub(1);
                if child.nlink == 0 {
                    nodes.remove(&child_id);
                }
            }
            None => {}
        }
        Ok(())
    }

    fn rename(
        &self,
        old_name: &[u8],
        new_parent: &dyn ObjectHandle,
        new_name: &[u8],
    ) -> StatusResult<()> {
        self.inner.check()?;
        self.inner.counters.renames.fetch_add(1, Ordering::Relaxed);
        let dst_id = id_of(&new_parent.key()).ok_or(Status::Backend(22))?;
        let mut nodes = self.inner.nodes.lock();
        let src = nodes.get_mut(&self.id).ok_or(Status::Stale)?;
        let child_id = src.children.remove(old_name).ok_or(Status::NoEnt)?;
        src.change += 1;
        let dst = nodes.get_mut(&dst_id).ok_or(Status::Stale)?;
        if let Some(displaced) = dst.children.insert(new_name.to_vec(), child_id) {
            if displaced != child_id {
                dst.change += 1;
                nodes.remove(&displaced);
                return Ok(());
            }
        }
        nodes.get_mut(&dst_id).expect("checked above").change += 1;
        Ok(())
    }

    fn link(&self, new_parent: &dyn ObjectHandle, name: &[u8]) -> StatusResult<()> {
        self.inner.check()?;
        let dst_id = id_of(&new_parent.key()).ok_or(Status::Backend(22))?;
        let mut nodes = self.inner.nodes.lock();
        if !nodes.contains_key(&self.id) {
            return Err(Status::Stale);
        }
        let dst = nodes.get_mut(&dst_id).ok_or(Status::Stale)?;
        if dst.children.contains_key(name) {
            return Err(Status::Exists);
        }
        dst.children.insert(name.to_vec(), self.id);
        dst.change += 1;
        nodes.get_mut(&self.id).expect("checked above").nlink += 1;
        Ok(())
    }

    fn symlink(
        &self,
        name: &[u8],
        target: &[u8],
        _attrs: &SetAttrs,
    ) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)> {
        self.inner.check()?;
        let child_id = {
            let mut nodes = self.inner.nodes.lock();
            let dir = nodes.get(&self.id).ok_or(Status::Stale)?;
            if dir.children.contains_key(name) {
                return Err(Status::Exists);
            }
            let child_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let mut node = Node::new(ObjectType::Symlink);
            node.target = target.to_vec();
            nodes.insert(child_id, node);
            let dir = nodes.get_mut(&self.id).expect("checked above");
            dir.children.insert(name.to_vec(), child_id);
            dir.change += 1;
            child_id
        };
        let attrs = {
            let nodes = self.inner.nodes.lock();
            self.inner
                .attrs_of(child_id, nodes.get(&child_id).expect("just inserted"))
        };
        Ok((
            Box::new(MemHandle::new(
                Arc::clone(&self.inner),
                child_id,
                ObjectType::Symlink,
            )),
            attrs,
        ))
    }

    fn readlink(&self) -> StatusResult<Bytes> {
        self.inner.check()?;
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&self.id).ok_or(Status::Stale)?;
        Ok(Bytes::copy_from_slice(&node.target))
    }

    fn open(&self, _flags: OpenFlags) -> StatusResult<()> {
        self.inner.check()?;
        let mut nodes = self.inner.nodes.lock();
        let node = nodes.get_mut(&self.id).ok_or(Status::Stale)?;
        node.opens += 1;
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> StatusResult<Bytes> {
        self.inner.check()?;
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&self.id).ok_or(Status::Stale)?;
        let start = (offset as usize).min(node.data.len());
        let end = (start + len).min(node.data.len());
        Ok(Bytes::copy_from_slice(&node.data[start..end]))
    }

    fn write(&self, offset: u64, data: &[u8]) -> StatusResult<u64> {
        self.inner.check()?;
        let mut nodes = self.inner.nodes.lock();
        let node = nodes.get_mut(&self.id).ok_or(Status::Stale)?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.change += 1;
        Ok(data.len() as u64)
    }

    fn commit(&self, _offset: u64, _len: u64) -> StatusResult<WriteVerifier> {
        self.inner.check()?;
        Ok(*b"memfsvrf")
    }

    fn close(&self) -> StatusResult<()> {
        let mut nodes = self.inner.nodes.lock();
        if let Some(node) = nodes.get_mut(&self.id) {
            node.opens = node.opens.saturating_sub(1);
        }
        Ok(())
    }

    fn handle_digest(&self) -> Bytes {
        Bytes::copy_from_slice(&self.id.to_be_bytes())
    }
}

impl Export for MemFs {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn lookup_path(&self, _path: &str) -> StatusResult<Box<dyn ObjectHandle>> {
        self.inner.check()?;
        Ok(Box::new(self.handle(self.inner.root, ObjectType::Directory)))
    }

    fn extract_handle(&self, wire: &[u8]) -> StatusResult<FsKey> {
        if wire.len() == 8 {
            Ok(FsKey::new(wire.to_vec()))
        } else {
            Err(Status::Backend(22))
        }
    }

    fn create_handle(&self, key: &FsKey) -> StatusResult<Box<dyn ObjectHandle>> {
        self.inner.check()?;
        let id = id_of(key).ok_or(Status::Backend(22))?;
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&id).ok_or(Status::Stale)?;
        let kind = node.kind;
        drop(nodes);
        Ok(Box::new(self.handle(id, kind)))
    }

    fn unexport(&self) {
        self.inner.unexported.store(true, Ordering::Release);
    }

    fn release(&self) {}

    fn maxfilesize(&self) -> u64 {
        u64::MAX
    }

    fn maxread(&self) -> u64 {
        1 << 20
    }

    fn maxwrite(&self) -> u64 {
        1 << 20
    }

    fn maxlink(&self) -> u32 {
        1024
    }

    fn maxnamelen(&self) -> u32 {
        255
    }

    fn maxpathlen(&self) -> u32 {
        4096
    }

    fn lease_time(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn acl_support(&self) -> AclSupport {
        AclSupport::empty()
    }

    fn supported_attrs(&self) -> AttrMask {
        AttrMask::ALL
    }

    fn umask(&self) -> u32 {
        0o022
    }

    fn xattr_access_rights(&self) -> u32 {
        0
    }

    fn fs_supports(&self, opt: FsOption) -> bool {
        matches!(opt, FsOption::Symlinks | FsOption::Hardlinks)
    }

    fn dynamic_info(&self) -> StatusResult<DynamicFsInfo> {
        Ok(DynamicFsInfo {
            total_bytes: 1 << 30,
            free_bytes: 1 << 29,
            avail_bytes: 1 << 29,
            total_files: 1 << 20,
            free_files: 1 << 19,
            avail_files: 1 << 19,
            time_delta: Duration::from_nanos(1),
        })
    }

    fn layout_types(&self) -> Vec<LayoutType> {
        Vec::new()
    }

    fn layout_blocksize(&self) -> u32 {
        0
    }

    fn maximum_segments(&self) -> u32 {
        0
    }

    fn loc_body_size(&self) -> usize {
        0
    }

    fn device_list(&self, _layout: LayoutType) -> StatusResult<Vec<u64>> {
        Ok(Vec::new())
    }

    fn write_verifier(&self) -> Bytes {
        Bytes::from_static(b"memfsvrf")
    }

    fn check_quota(&self, _path: &str, _quota_type: QuotaType) -> StatusResult<()> {
        Ok(())
    }

    fn get_quota(&self, _path: &str, _quota_type: QuotaType, _id: u32) -> StatusResult<Quota> {
        Ok(Quota::default())
    }

    fn set_quota(
        &self,
        _path: &str,
        _quota_type: QuotaType,
        _id: u32,
        quota: &Quota,
    ) -> StatusResult<Quota> {
        Ok(*quota)
    }

    fn alloc_state(&self, kind: StateKind) -> StatusResult<StateHandle> {
        Ok(StateHandle {
            id: self.inner.next_state.fetch_add(1, Ordering::Relaxed),
            kind,
        })
    }

    fn free_state(&self, _state: StateHandle) {}
}

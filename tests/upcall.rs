#![allow(missing_docs, clippy::unwrap_used)]

//! Upcall invalidation delivered by the backend.

mod common;

use mdcache::fsal::ObjectHandle as _;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{Rig, list_dir};
use mdcache::Status;
use mdcache::fsal::{DelegationKind, FsKey, InvalidateKind, UpcallOps};

fn key_of(id: u64) -> FsKey {
    FsKey::new(id.to_be_bytes().to_vec())
}

/// Records what the cache re-raises to the host's upcall vector.
#[derive(Clone, Default)]
struct SinkInner {
    recalls: Vec<FsKey>,
    grants: Vec<(FsKey, DelegationKind)>,
}

#[derive(Clone, Default)]
struct UpcallSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl UpcallOps for UpcallSink {
    fn invalidate(&self, _key: &FsKey, _what: InvalidateKind) {}

    fn rename(&self, _op: &FsKey, _on: &[u8], _np: &FsKey, _nn: &[u8]) {}

    fn delegation_recall(&self, key: &FsKey) {
        self.inner.lock().unwrap().recalls.push(key.clone());
    }

    fn grant(&self, key: &FsKey, kind: DelegationKind) {
        self.inner.lock().unwrap().grants.push((key.clone(), kind));
    }
}

#[test]
fn invalidate_attrs_forces_refetch_and_is_idempotent() {
    let rig = Rig::new();
    let id = rig.mem.add_file(rig.mem.root_id(), b"f");
    let root = rig.root();
    let (h, _) = root.lookup(b"f").unwrap();
    let ups = rig.cache.upcalls(None);

    h.getattrs().unwrap();
    let baseline = rig.mem.getattr_count();

    // Two identical invalidations must have the observable effect of
    // one: exactly one refetch on the next read.
    ups.invalidate(&key_of(id), InvalidateKind::ATTRS);
    ups.invalidate(&key_of(id), InvalidateKind::ATTRS);

    h.getattrs().unwrap();
    h.getattrs().unwrap();
    assert_eq!(rig.mem.getattr_count(), baseline + 1);
}

#[test]
fn invalidate_for_uncached_key_is_dropped() {
    let rig = Rig::new();
    let ups = rig.cache.upcalls(None);
    // Nothing cached for this key; must be a silent no-op.
    ups.invalidate(&key_of(9999), InvalidateKind::ATTRS | InvalidateKind::CONTENT);
    assert_eq!(rig.cache.stats().entries, 0);
}

/// S5: an enumeration cursor outstanding across a content invalidation
/// observes a verifier mismatch and restarts; the pass that raced the
/// invalidation still delivered a consistent prefix.
#[test]
fn content_invalidation_breaks_outstanding_cursors() {
    let rig = Rig::new();
    for i in 0..9u32 {
        rig.mem
            .add_file(rig.mem.root_id(), format!("e{i}").as_bytes());
    }
    let root = rig.root();
    let root_key = root.key();
    let ups = rig.cache.upcalls(None);

    let (listing, eof) = list_dir(root.as_ref(), None).unwrap();
    assert!(eof);
    let mid_cookie = listing[4].1;

    ups.invalidate(&root_key, InvalidateKind::CONTENT);

    assert_eq!(
        list_dir(root.as_ref(), Some(mid_cookie)).unwrap_err(),
        Status::BadCookie,
        "a cursor minted before the invalidation must restart"
    );
    let (fresh, eof) = list_dir(root.as_ref(), None).unwrap();
    assert!(eof);
    assert_eq!(fresh.len(), 9, "restart re-enumerates everything");
}

#[test]
fn dirent_invalidation_drops_cached_names() {
    let rig = Rig::new();
    rig.mem.add_file(rig.mem.root_id(), b"x");
    let root = rig.root();
    let root_key = root.key();
    let ups = rig.cache.upcalls(None);

    let _ = root.lookup(b"x").unwrap();
    let hits = rig.mem.lookup_count();
    let _ = root.lookup(b"x").unwrap();
    assert_eq!(rig.mem.lookup_count(), hits, "warm");

    ups.invalidate(&root_key, InvalidateKind::DIRENT);

    let _ = root.lookup(b"x").unwrap();
    assert_eq!(
        rig.mem.lookup_count(),
        hits + 1,
        "swept dirents force a backend lookup"
    );
}

#[test]
fn rename_upcall_invalidates_the_stale_binding() {
    let rig = Rig::new();
    let id = rig.mem.add_file(rig.mem.root_id(), b"old");
    let root = rig.root();
    let root_key = root.key();
    let ups = rig.cache.upcalls(None);

    let _ = root.lookup(b"old").unwrap();

    // The backend renamed old → new behind the cache's back (e.g.
    // another node did it) and tells us via upcall.
    rig.mem.relink(rig.mem.root_id(), b"old", b"new");
    ups.rename(&root_key, b"old", &root_key, b"new");

    assert_eq!(root.lookup(b"old").unwrap_err(), Status::NoEnt);
    let (h, _) = root.lookup(b"new").unwrap();
    assert_eq!(h.key(), key_of(id));
}

#[test]
fn delegation_upcalls_are_reraised_off_thread() {
    let rig = Rig::new();
    let id = rig.mem.add_file(rig.mem.root_id(), b"d");
    let root = rig.root();
    let _h = root.lookup(b"d").unwrap();

    let sink = UpcallSink::default();
    let ups = rig.cache.upcalls(Some(Arc::new(sink.clone())));

    ups.grant(&key_of(id), DelegationKind::Read);
    ups.delegation_recall(&key_of(id));

    // Re-raising happens on the delayed executor, not inline.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        {
            let inner = sink.inner.lock().unwrap();
            if inner.recalls.len() == 1 && inner.grants.len() == 1 {
                assert_eq!(inner.recalls[0], key_of(id));
                assert_eq!(inner.grants[0], (key_of(id), DelegationKind::Read));
                break;
            }
        }
        assert!(Instant::now() < deadline, "re-raise never arrived");
        std::thread::sleep(Duration::from_millis(5));
    }
}

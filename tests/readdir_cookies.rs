#![allow(missing_docs, clippy::unwrap_used)]

//! Readdir chunking, cache-owned cookies, and verifier semantics.

mod common;

use mdcache::fsal::ObjectHandle as _;

use common::{Rig, list_dir, names_of};
use mdcache::Status;

fn seed(rig: &Rig, n: usize) -> Vec<Vec<u8>> {
    let mut names = Vec::new();
    for i in 0..n {
        let name = format!("file-{i:03}").into_bytes();
        rig.mem.add_file(rig.mem.root_id(), &name);
        names.push(name);
    }
    names
}

#[test]
fn full_enumeration_is_chunked_and_ordered() {
    let rig = Rig::new(); // chunk_size = 4
    let names = seed(&rig, 9);
    let root = rig.root();

    let (listing, eof) = list_dir(root.as_ref(), None).unwrap();
    assert!(eof);
    assert_eq!(names_of(&listing), names, "backend order is preserved");
    assert!(
        rig.mem.readdir_count() >= 3,
        "nine entries at chunk size four need at least three fetches"
    );

    // Cookies are strictly monotonic.
    let cookies: Vec<u64> = listing.iter().map(|(_, c)| *c).collect();
    let mut sorted = cookies.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(cookies, sorted);
}

#[test]
fn second_enumeration_serves_from_chunks() {
    let rig = Rig::new();
    seed(&rig, 9);
    let root = rig.root();

    list_dir(root.as_ref(), None).unwrap();
    let fetches = rig.mem.readdir_count();
    let (listing, eof) = list_dir(root.as_ref(), None).unwrap();
    assert!(eof);
    assert_eq!(listing.len(), 9);
    assert_eq!(
        rig.mem.readdir_count(),
        fetches,
        "complete directory re-enumerates without the backend"
    );
}

#[test]
fn resume_from_cookie_yields_the_suffix() {
    let rig = Rig::new();
    let names = seed(&rig, 9);
    let root = rig.root();

    let (listing, _) = list_dir(root.as_ref(), None).unwrap();
    let resume_at = listing[3].1;
    let (tail, eof) = list_dir(root.as_ref(), Some(resume_at)).unwrap();
    assert!(eof);
    assert_eq!(names_of(&tail), names[4..].to_vec());
}

#[test]
fn early_stop_reports_not_eof() {
    let rig = Rig::new();
    seed(&rig, 9);
    let root = rig.root();

    let mut seen = 0;
    let eof = root
        .readdir(None, &mut |_| {
            seen += 1;
            seen < 3
        })
        .unwrap();
    assert!(!eof);
    assert_eq!(seen, 3);
}

#[test]
fn namespace_change_invalidates_outstanding_cookies() {
    let rig = Rig::new();
    seed(&rig, 9);
    let root = rig.root();

    let (listing, _) = list_dir(root.as_ref(), None).unwrap();
    let old_cookie = listing[4].1;

    root.unlink(b"file-000").unwrap();

    // The epoch moved: a cursor minted before the change must restart.
    assert_eq!(
        list_dir(root.as_ref(), Some(old_cookie)).unwrap_err(),
        Status::BadCookie
    );

    // A fresh pass works and omits the unlinked name.
    let (fresh, eof) = list_dir(root.as_ref(), None).unwrap();
    assert!(eof);
    assert_eq!(fresh.len(), 8);
    assert!(!names_of(&fresh).contains(&b"file-000".to_vec()));
}

#[test]
fn tombstoned_names_are_skipped_not_listed() {
    let rig = Rig::new();
    seed(&rig, 5);
    let root = rig.root();
    list_dir(root.as_ref(), None).unwrap();

    root.unlink(b"file-002").unwrap();
    let (fresh, _) = list_dir(root.as_ref(), None).unwrap();
    assert_eq!(fresh.len(), 4);
    assert!(!names_of(&fresh).contains(&b"file-002".to_vec()));
}

#[test]
fn readdir_on_a_file_is_notdir() {
    let rig = Rig::new();
    rig.mem.add_file(rig.mem.root_id(), b"plain");
    let root = rig.root();
    let (h, _) = root.lookup(b"plain").unwrap();
    assert_eq!(list_dir(h.as_ref(), None).unwrap_err(), Status::NotDir);
}

#[test]
fn empty_directory_enumerates_to_eof() {
    let rig = Rig::new();
    let root = rig.root();
    let (listing, eof) = list_dir(root.as_ref(), None).unwrap();
    assert!(eof);
    assert!(listing.is_empty());
}

//! Recovery ledger across server restarts

use std::path::Path;

use warp_nfs4_state::{ClientRecoveryStore, NfsError, SledClientStore};

fn reboot(store: SledClientStore, dir: &Path) -> SledClientStore {
    store.close().unwrap();
    drop(store);
    SledClientStore::open(dir).unwrap()
}

#[test]
fn test_no_wait_on_first_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    assert!(!store.waiting_for_reclaim());
}

#[test]
fn test_reclaim_window_closes_on_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    store.add_client(b"client1").unwrap();
    let store = reboot(store, dir.path());
    assert!(store.waiting_for_reclaim());

    store.reclaim_complete().unwrap();
    assert!(!store.waiting_for_reclaim());
}

#[test]
fn test_waits_for_clients_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    store.add_client(b"client1").unwrap();
    let store = reboot(store, dir.path());
    assert!(store.waiting_for_reclaim());
}

#[test]
fn test_new_client_cannot_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    store.add_client(b"client1").unwrap();
    assert!(matches!(
        store.want_reclaim(b"client1"),
        Err(NfsError::ReclaimBad(_))
    ));
}

#[test]
fn test_reclaim_after_reboot() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    store.add_client(b"client1").unwrap();
    let store = reboot(store, dir.path());

    store.add_client(b"client1").unwrap();
    store.want_reclaim(b"client1").unwrap();
}

#[test]
fn test_removed_client_cannot_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    store.add_client(b"client1").unwrap();
    store.remove_client(b"client1").unwrap();
    let store = reboot(store, dir.path());

    assert!(matches!(
        store.want_reclaim(b"client1"),
        Err(NfsError::ReclaimBad(_))
    ));
}

#[test]
fn test_late_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledClientStore::open(dir.path()).unwrap();
    store.reclaim_complete().unwrap();
    assert!(matches!(
        store.want_reclaim(b"client1"),
        Err(NfsError::NoGrace(_))
    ));
}

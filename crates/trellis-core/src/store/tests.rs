//! Tests for the SQLite store.

use crate::error::{ErrorKind, LastError};
use crate::model::{
    Capacities, PendingState, Reservation, ReservationState, ResourceType, Slice, SliceOwner,
};
use crate::time::Term;

use super::{SiteRecord, SqliteStore};

fn term() -> Term {
    Term::new(0, 3_600_000).unwrap()
}

fn owner() -> SliceOwner {
    SliceOwner::new("alice", "proj-1")
}

fn slice() -> Slice {
    Slice::new("demo", owner(), term())
}

fn reservation(slice: &Slice) -> Reservation {
    let mut r = Reservation::new(
        slice.id.clone(),
        ResourceType::Vm,
        "RENC",
        Capacities::compute(4, 64, 500),
        term(),
    );
    r.properties
        .insert("image".to_string(), "default_centos_9".to_string());
    r
}

#[test]
fn test_round_trip_slice_and_reservation() {
    let store = SqliteStore::in_memory().unwrap();
    let mut s = slice();
    let mut r = reservation(&s);
    s.add_reservation(r.id.clone());
    r.state = ReservationState::Ticketed;
    r.pending = PendingState::Redeeming;

    store.commit_batch(&[&s], &[&r]).unwrap();

    let slices = store.load_slices().unwrap();
    assert_eq!(slices.len(), 1);
    assert_eq!(slices[0], s);

    let reservations = store.load_reservations().unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0], r);
}

#[test]
fn test_upsert_is_idempotent() {
    let store = SqliteStore::in_memory().unwrap();
    let s = slice();
    let mut r = reservation(&s);

    store.commit_batch(&[&s], &[&r]).unwrap();
    r.last_error = Some(LastError::new(ErrorKind::Timeout, "broker timed out"));
    r.state = ReservationState::Failed;
    store.commit_batch(&[&s], &[&r]).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.slices, 1);
    assert_eq!(stats.reservations, 1);

    let loaded = store.reservation(&r.id).unwrap().unwrap();
    assert_eq!(loaded.state, ReservationState::Failed);
    assert_eq!(loaded.last_error.unwrap().kind, ErrorKind::Timeout);
}

#[test]
fn test_batch_commit_is_atomic_per_transaction() {
    let store = SqliteStore::in_memory().unwrap();
    let s1 = slice();
    let mut s2 = slice();
    s2.name = "demo-2".to_string();
    let r1 = reservation(&s1);
    let r2 = reservation(&s2);

    store.commit_batch(&[&s1, &s2], &[&r1, &r2]).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.slices, 2);
    assert_eq!(stats.reservations, 2);
}

#[test]
fn test_find_live_slice_skips_dead() {
    let store = SqliteStore::in_memory().unwrap();
    let mut s = slice();
    store.upsert_slice(&s).unwrap();
    assert!(store.find_live_slice(&owner(), "demo").unwrap().is_some());
    assert!(store.find_live_slice(&owner(), "other").unwrap().is_none());

    s.state = crate::model::SliceState::Dead;
    store.upsert_slice(&s).unwrap();
    assert!(store.find_live_slice(&owner(), "demo").unwrap().is_none());
}

#[test]
fn test_remove_slice_cascades_to_reservations() {
    let store = SqliteStore::in_memory().unwrap();
    let s = slice();
    let r = reservation(&s);
    store.commit_batch(&[&s], &[&r]).unwrap();

    store.remove_slice(&s.id).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.slices, 0);
    assert_eq!(stats.reservations, 0);
}

#[test]
fn test_site_records() {
    let store = SqliteStore::in_memory().unwrap();
    let mut site = SiteRecord::new("site-renc", "RENC");
    store.upsert_site(&site).unwrap();

    site.maintenance = true;
    store.upsert_site(&site).unwrap();

    let sites = store.load_sites().unwrap();
    assert_eq!(sites.len(), 1);
    assert!(sites[0].maintenance);
}

#[test]
fn test_link_rows_derive_from_interface_slivers() {
    use crate::model::{InterfaceSliver, ReservationId};

    let store = SqliteStore::in_memory().unwrap();
    let s = slice();
    let mut r = Reservation::new(
        s.id.clone(),
        ResourceType::L2Bridge,
        "RENC",
        Capacities {
            bandwidth_gbps: 10,
            ..Capacities::default()
        },
        term(),
    );
    r.interfaces = vec![InterfaceSliver {
        id: "i1".to_string(),
        parent_reservation: ReservationId::from_string("res-parent"),
        parent_component: "SmartNIC-CX6".to_string(),
        parent_node_id: Some("w1".to_string()),
        peer_ifs: Some("cp-w1-nic1".to_string()),
        peer_ns_id: Some("s1".to_string()),
        bandwidth_gbps: 10,
        burst_mbits: 100,
        vlan: Some(101),
        mac: Some("02:00:00:00:01:00".to_string()),
    }];
    store.commit_batch(&[&s], &[&r]).unwrap();

    let links = store.load_links(&r.id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].node_id, "w1");
    assert_eq!(links[0].layer, "L2");
    assert_eq!(links[0].link_type, "L2Bridge");
    assert_eq!(links[0].bandwidth_gbps, 10);
    assert_eq!(links[0].properties.get("peer_ifs").unwrap(), "cp-w1-nic1");
    assert_eq!(links[0].properties.get("vlan").unwrap(), "101");

    // Recommitting rewrites the rows instead of stacking duplicates.
    r.interfaces[0].bandwidth_gbps = 25;
    store.commit_batch(&[], &[&r]).unwrap();
    let links = store.load_links(&r.id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].bandwidth_gbps, 25);

    // Node slivers leave no link rows behind.
    let vm = reservation(&s);
    store.commit_batch(&[], &[&vm]).unwrap();
    assert!(store.load_links(&vm.id).unwrap().is_empty());
}

#[test]
fn test_slice_count_metrics() {
    let store = SqliteStore::in_memory().unwrap();
    store.bump_slice_count(&owner(), 1).unwrap();
    store.bump_slice_count(&owner(), 1).unwrap();
    assert_eq!(store.slice_count(&owner()).unwrap(), 2);

    store.bump_slice_count(&owner(), -1).unwrap();
    assert_eq!(store.slice_count(&owner()).unwrap(), 1);

    // Counts never go negative.
    store.bump_slice_count(&owner(), -5).unwrap();
    assert_eq!(store.slice_count(&owner()).unwrap(), 0);
}

use opaldb::core::version::{
    CacheVersion, ConflictResolver, OrderWinsResolver, VersionDomain,
};
use std::cmp::Ordering;

fn version(topology: u64, order: u64, node_order: u32, dc: u8) -> CacheVersion {
    CacheVersion {
        topology_version: topology,
        order,
        node_order,
        data_center_id: dc,
    }
}

#[test]
fn test_next_is_strictly_increasing() {
    let domain = VersionDomain::new(0);
    domain.on_topology_change(1, 0);
    let mut previous = domain.next();
    for _ in 0..1000 {
        let next = domain.next();
        assert_eq!(previous.try_compare(&next), Some(Ordering::Less));
        previous = next;
    }
}

#[test]
fn test_lexicographic_ordering() {
    let base = version(2, 10, 1, 0);
    assert_eq!(base.try_compare(&version(3, 1, 0, 0)), Some(Ordering::Less));
    assert_eq!(base.try_compare(&version(2, 11, 0, 0)), Some(Ordering::Less));
    assert_eq!(base.try_compare(&version(2, 10, 2, 0)), Some(Ordering::Less));
    assert_eq!(base.try_compare(&version(2, 10, 1, 0)), Some(Ordering::Equal));
    assert_eq!(
        base.try_compare(&version(1, 99, 9, 0)),
        Some(Ordering::Greater)
    );
}

#[test]
fn test_cross_data_center_versions_are_not_orderable() {
    let a = version(1, 5, 0, 0);
    let b = version(1, 5, 0, 1);
    assert_eq!(a.try_compare(&b), None);
    assert_eq!(b.try_compare(&a), None);
}

#[test]
fn test_order_wins_resolver() {
    let resolver = OrderWinsResolver;
    let current = version(1, 5, 0, 0);
    assert!(resolver.incoming_wins(&current, &version(1, 6, 0, 1)));
    assert!(!resolver.incoming_wins(&current, &version(1, 4, 0, 1)));
    // Equal order falls back to the higher data center id.
    assert!(resolver.incoming_wins(&current, &version(1, 5, 0, 1)));
    assert!(!resolver.incoming_wins(&version(1, 5, 0, 2), &version(1, 5, 0, 1)));
}

#[test]
fn test_topology_change_is_reflected_in_stamps() {
    let domain = VersionDomain::new(3);
    domain.on_topology_change(7, 2);
    let stamp = domain.next();
    assert_eq!(stamp.topology_version, 7);
    assert_eq!(stamp.node_order, 2);
    assert_eq!(stamp.data_center_id, 3);
}

#[test]
fn test_observe_advances_local_order() {
    let domain = VersionDomain::new(0);
    domain.on_topology_change(1, 0);
    domain.observe(&version(1, 500, 0, 0));
    let next = domain.next();
    assert!(next.order > 500);

    // Observing an older version never moves the counter backwards.
    domain.observe(&version(1, 10, 0, 0));
    let after = domain.next();
    assert!(after.order > next.order);
}

#[test]
fn test_zero_version() {
    assert!(CacheVersion::ZERO.is_zero());
    let domain = VersionDomain::new(0);
    assert!(!domain.next().is_zero());
}

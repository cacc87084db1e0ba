use bytes::Bytes;
use opaldb::core::atomic::messages::Transform;
use opaldb::core::cluster::affinity;
use opaldb::core::version::CacheVersion;
use proptest::prelude::*;
use std::cmp::Ordering;

fn arb_version(dc: u8) -> impl Strategy<Value = CacheVersion> {
    (0u64..16, 0u64..256, 0u32..8).prop_map(move |(topology, order, node_order)| CacheVersion {
        topology_version: topology,
        order,
        node_order,
        data_center_id: dc,
    })
}

proptest! {
    #[test]
    fn prop_same_dc_versions_are_totally_ordered(
        a in arb_version(0),
        b in arb_version(0),
    ) {
        let ab = a.try_compare(&b).expect("same dc must be orderable");
        let ba = b.try_compare(&a).expect("same dc must be orderable");
        // Antisymmetry.
        prop_assert_eq!(ab, ba.reverse());
        if ab == Ordering::Equal {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn prop_version_ordering_is_transitive(
        a in arb_version(0),
        b in arb_version(0),
        c in arb_version(0),
    ) {
        let mut versions = [a, b, c];
        versions.sort_by(|x, y| x.try_compare(y).expect("orderable"));
        prop_assert!(versions[0].try_compare(&versions[2]) != Some(Ordering::Greater));
    }

    #[test]
    fn prop_cross_dc_versions_never_compare(
        a in arb_version(0),
        b in arb_version(1),
    ) {
        prop_assert_eq!(a.try_compare(&b), None);
    }

    #[test]
    fn prop_partition_in_range(key in proptest::collection::vec(any::<u8>(), 0..64)) {
        let key = Bytes::from(key);
        prop_assert!(affinity::partition(&key, 1024) < 1024);
        prop_assert!(affinity::partition(&key, 1) == 0);
    }

    #[test]
    fn prop_hash_tagged_keys_collide(tag in "[a-z]{1,8}", a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
        let first = Bytes::from(format!("{a}:{{{tag}}}"));
        let second = Bytes::from(format!("{b}:{{{tag}}}"));
        prop_assert_eq!(
            affinity::partition(&first, 1024),
            affinity::partition(&second, 1024)
        );
    }

    #[test]
    fn prop_incr_by_matches_integer_addition(base in -1_000_000i64..1_000_000, delta in -1_000_000i64..1_000_000) {
        let current = Bytes::from(base.to_string());
        let result = Transform::IncrBy(delta).apply(Some(&current)).expect("incr");
        prop_assert_eq!(result, Some(Bytes::from((base + delta).to_string())));
    }

    #[test]
    fn prop_append_then_prepend_roundtrip(
        head in proptest::collection::vec(any::<u8>(), 0..16),
        middle in proptest::collection::vec(any::<u8>(), 0..16),
        tail in proptest::collection::vec(any::<u8>(), 0..16),
    ) {
        let current = Bytes::from(middle.clone());
        let appended = Transform::Append(tail.clone())
            .apply(Some(&current))
            .expect("append")
            .expect("value");
        let full = Transform::Prepend(head.clone())
            .apply(Some(&appended))
            .expect("prepend")
            .expect("value");
        let mut expected = head;
        expected.extend_from_slice(&middle);
        expected.extend_from_slice(&tail);
        prop_assert_eq!(full, Bytes::from(expected));
    }
}

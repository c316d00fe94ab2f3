//! Keyspace partitioning tests.
//!
//! These tests verify that partitions tile their range exactly and that
//! every identifier is routed to the partition whose extents contain it.

use dbsp_lite::partition::PartitionRange;
use dbsp_lite::DbspError;
use uuid::Uuid;

fn id(v: u128) -> Uuid {
    Uuid::from_u128(v)
}

/// Checks that the partitions of `range` are contiguous, non-empty and
/// cover exactly its extents.
fn assert_tiles_range(range: &PartitionRange) {
    let (start, end) = range.extents();
    let mut expected_from = start;
    for i in 0..range.num_partitions() {
        let (from, to) = range.partition_extents(i).unwrap();
        assert_eq!(from, expected_from, "gap before partition {i}");
        assert!(from < to, "partition {i} is empty");
        expected_from = to;
    }
    assert_eq!(expected_from, end);
}

#[test]
fn test_partitions_tile_full_keyspace() {
    for n in [1, 2, 3, 7, 16, 100, 1024] {
        let range = PartitionRange::new_full_range(n).unwrap();
        assert_eq!(range.num_partitions(), n);
        assert_eq!(range.extents(), (Uuid::nil(), id(u128::MAX)));
        assert_tiles_range(&range);
    }
}

#[test]
fn test_partitions_tile_narrow_ranges() {
    for (start, end, n) in [(0, 15, 4), (3, 10, 2), (100, 1000, 9), (0, 1, 1), (5, 12, 3)] {
        let range = PartitionRange::new(id(start), id(end), n).unwrap();
        assert_tiles_range(&range);
    }
}

#[test]
fn test_every_id_maps_to_its_partition() {
    let range = PartitionRange::new(id(0), id(200), 7).unwrap();
    for v in 0..200 {
        let partition = range.partition_for_id(id(v)).unwrap();
        let (from, to) = range.partition_extents(partition).unwrap();
        assert!(id(v) >= from && id(v) < to, "{v} routed to {partition}");
    }
}

#[test]
fn test_partition_boundaries_belong_to_upper_partition() {
    let range = PartitionRange::new_full_range(4).unwrap();
    for i in 1..4 {
        let (from, _) = range.partition_extents(i).unwrap();
        assert_eq!(range.partition_for_id(from).unwrap(), i);
        assert_eq!(range.partition_for_id(id(from.as_u128() - 1)).unwrap(), i - 1);
    }
}

#[test]
fn test_ids_outside_range_are_rejected() {
    let range = PartitionRange::new(id(10), id(20), 2).unwrap();
    assert!(matches!(
        range.partition_for_id(id(9)),
        Err(DbspError::Partition(_))
    ));
    assert!(matches!(
        range.partition_for_id(id(20)),
        Err(DbspError::Partition(_))
    ));
    assert!(matches!(
        range.partition_extents(2),
        Err(DbspError::Partition(_))
    ));
}

#[test]
fn test_too_many_partitions_is_rejected() {
    assert!(PartitionRange::new(id(0), id(3), 8).is_err());
    assert!(PartitionRange::new_full_range(0).is_err());
}

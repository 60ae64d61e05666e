use std::collections::HashMap;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{TrieMap, INVALID_INDEX, MAX_VALUE};

#[test]
fn set_and_get() {
    let mut map = TrieMap::new();
    assert!(map.put_root(10, 10));
    assert_eq!(map.get_root(10).value, 10);
    assert!(map.put_root(0x10A, 10));
    assert_eq!(map.get_root(10).value, 10);
    assert_eq!(map.get_root(0x10A).value, 10);
    assert!(map.put_root(10, 1000));
    assert_eq!(map.get_root(10).value, 1000);
    assert!(map.put_root(11, 1000));
    assert_eq!(map.get_root(11).value, 1000);

    let next = map.get_next_level_bitmap_entry_index_from_root(10);
    assert_ne!(next, INVALID_INDEX);
    assert!(map.put(9, 9, next));
    assert_eq!(map.get(9, next).value, 9);
    assert!(!map.get(11, next).is_valid);

    assert!(map.put_root(0, MAX_VALUE));
    assert_eq!(map.get_root(0).value, MAX_VALUE);
}

#[test]
fn value_out_of_range_rejected() {
    let mut map = TrieMap::new();
    assert!(!map.put_root(1, MAX_VALUE + 1));
    assert!(!map.get_root(1).is_valid);
}

#[test]
fn miss_is_invalid_node() {
    let map = TrieMap::new();
    let node = map.get_root(42);
    assert!(!node.is_valid);
    assert_eq!(node.next_level_bitmap_entry_index, INVALID_INDEX);
}

#[test]
fn set_and_get_large() {
    const ELEMENT_COUNT: u32 = 50_000;
    let mut map = TrieMap::new();
    for i in 0..ELEMENT_COUNT {
        assert!(map.put_root(i, i as u64));
    }
    for i in 0..ELEMENT_COUNT {
        assert_eq!(map.get_root(i).value, i as u64, "key {i}");
    }
}

#[test]
fn random_set_and_get_large() {
    const ELEMENT_COUNT: usize = 20_000;
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut map = TrieMap::new();
    let mut expected: HashMap<u32, u64> = HashMap::new();

    for _ in 0..ELEMENT_COUNT {
        let key: u32 = rng.gen();
        let value: u64 = rng.gen_range(0..=MAX_VALUE);
        assert!(map.put_root(key, value), "key {key} value {value}");
        expected.insert(key, value);
    }
    for (&key, &value) in &expected {
        assert_eq!(map.get_root(key).value, value, "key {key}");
    }
}

#[test]
fn multi_level() {
    const FIRST_LEVEL_COUNT: usize = 1_000;
    const SECOND_LEVEL_COUNT: usize = 2_000;
    const THIRD_LEVEL_COUNT: usize = 4_000;

    let mut rng = StdRng::seed_from_u64(0xD1C7);
    let mut map = TrieMap::new();

    let mut first_level_keys = Vec::new();
    let mut first_level_entries: HashMap<u32, u64> = HashMap::new();
    let mut second_level_keys = Vec::new();
    let mut two_level: HashMap<u32, HashMap<u32, u64>> = HashMap::new();
    let mut three_level: HashMap<u32, HashMap<u32, HashMap<u32, u64>>> = HashMap::new();

    for _ in 0..FIRST_LEVEL_COUNT {
        let key: u32 = rng.gen();
        let value: u64 = rng.gen_range(0..=MAX_VALUE);
        assert!(map.put_root(key, value));
        first_level_keys.push(key);
        first_level_entries.insert(key, value);
    }

    for _ in 0..SECOND_LEVEL_COUNT {
        let key: u32 = rng.gen();
        let value: u64 = rng.gen_range(0..=MAX_VALUE);
        let first_key = first_level_keys[rng.gen_range(0..first_level_keys.len())];
        let second = map.get_next_level_bitmap_entry_index_from_root(first_key);
        assert_ne!(second, INVALID_INDEX);
        assert!(map.put(key, value, second));
        second_level_keys.push((first_key, key));
        two_level.entry(first_key).or_default().insert(key, value);
    }

    for _ in 0..THIRD_LEVEL_COUNT {
        let key: u32 = rng.gen();
        let value: u64 = rng.gen_range(0..=MAX_VALUE);
        let (first_key, second_key) = second_level_keys[rng.gen_range(0..second_level_keys.len())];
        let second = map.get_next_level_bitmap_entry_index_from_root(first_key);
        assert_ne!(second, INVALID_INDEX);
        let third = map.get_next_level_bitmap_entry_index(second_key, second);
        assert_ne!(third, INVALID_INDEX);
        assert!(map.put(key, value, third));
        three_level
            .entry(first_key)
            .or_default()
            .entry(second_key)
            .or_default()
            .insert(key, value);
    }

    for (&key, &value) in &first_level_entries {
        assert_eq!(map.get_root(key).value, value);
    }

    for (&first_key, entries) in &two_level {
        let second = map.get_next_level_bitmap_entry_index_from_root(first_key);
        assert_ne!(second, INVALID_INDEX);
        for (&key, &value) in entries {
            assert_eq!(map.get(key, second).value, value);
        }
    }

    for (&first_key, second_entries) in &three_level {
        let second = map.get_next_level_bitmap_entry_index_from_root(first_key);
        assert_ne!(second, INVALID_INDEX);
        for (&second_key, entries) in second_entries {
            let third = map.get_next_level_bitmap_entry_index(second_key, second);
            assert_ne!(third, INVALID_INDEX);
            for (&key, &value) in entries {
                assert_eq!(map.get(key, third).value, value);
            }
        }
    }
}

#[test]
fn sibling_levels_are_disjoint() {
    let mut map = TrieMap::new();
    assert!(map.put_root(1, 11));
    assert!(map.put_root(2, 22));
    let level1 = map.get_next_level_bitmap_entry_index_from_root(1);
    let level2 = map.get_next_level_bitmap_entry_index_from_root(2);
    assert_ne!(level1, level2);
    assert!(map.put(7, 100, level1));
    assert!(map.put(7, 200, level2));
    assert_eq!(map.get(7, level1).value, 100);
    assert_eq!(map.get(7, level2).value, 200);
    // Parent values are untouched by child-level writes.
    assert_eq!(map.get_root(1).value, 11);
    assert_eq!(map.get_root(2).value, 22);
}

#[test]
fn next_level_without_value() {
    let mut map = TrieMap::new();
    // Anchoring a child level on an unset key creates an invalid node that
    // still carries the level.
    let level = map.get_next_level_bitmap_entry_index_from_root(5);
    assert_ne!(level, INVALID_INDEX);
    let node = map.get_root(5);
    assert!(!node.is_valid);
    assert_eq!(node.next_level_bitmap_entry_index, level);
    // The allocation is stable across calls.
    assert_eq!(map.get_next_level_bitmap_entry_index_from_root(5), level);
    // Giving the key a value later keeps the level.
    assert!(map.put_root(5, 55));
    let node = map.get_root(5);
    assert!(node.is_valid);
    assert_eq!(node.value, 55);
    assert_eq!(node.next_level_bitmap_entry_index, level);
}

#[test]
fn remove_clears_value_and_keeps_level() {
    let mut map = TrieMap::new();
    assert!(map.put_root(3, 33));
    let level = map.get_next_level_bitmap_entry_index_from_root(3);
    assert!(map.put(4, 44, level));

    assert!(map.remove(3, super::ROOT_BITMAP_ENTRY_INDEX));
    let node = map.get_root(3);
    assert!(!node.is_valid);
    assert_eq!(node.next_level_bitmap_entry_index, level);
    assert_eq!(map.get(4, level).value, 44);

    // Removing again reports absence.
    assert!(!map.remove(3, super::ROOT_BITMAP_ENTRY_INDEX));
}

#[test]
fn iter_level_lists_valid_entries_once() {
    let mut map = TrieMap::new();
    for key in [9u32, 1, 500, 77, 12345] {
        assert!(map.put_root(key, key as u64 * 2));
    }
    assert!(map.remove(77, super::ROOT_BITMAP_ENTRY_INDEX));

    let mut entries = map.iter_level(super::ROOT_BITMAP_ENTRY_INDEX);
    entries.sort();
    assert_eq!(
        entries,
        vec![(1, 2), (9, 18), (500, 1000), (12345, 24690)]
    );
}

#[test]
fn buffer_roundtrip() {
    let mut map = TrieMap::new();
    for i in 0..1_000u32 {
        assert!(map.put_root(i, (i * 3) as u64));
    }
    let bytes = map.as_bytes().to_vec();
    let reopened = TrieMap::from_buffer(
        crate::buffer::DictBuffer::from_vec(bytes),
        map.garbage_bytes(),
    )
    .unwrap();
    for i in 0..1_000u32 {
        assert_eq!(reopened.get_root(i).value, (i * 3) as u64);
    }
    assert_eq!(reopened.garbage_bytes(), map.garbage_bytes());
}

#[test]
fn compacted_preserves_content_and_drops_garbage() {
    let mut map = TrieMap::new();
    let mut rng = StdRng::seed_from_u64(0xC0DE);
    let mut expected: HashMap<u32, u64> = HashMap::new();
    for _ in 0..2_000 {
        let key: u32 = rng.gen_range(0..3_000);
        let value: u64 = rng.gen_range(0..=MAX_VALUE);
        assert!(map.put_root(key, value));
        expected.insert(key, value);
    }
    // Nested level survives compaction too.
    let level = map.get_next_level_bitmap_entry_index_from_root(7);
    assert_ne!(level, INVALID_INDEX);
    assert!(map.put(99, 9999, level));
    // Tombstones are dropped.
    assert!(map.put_root(4_000_000, 1));
    assert!(map.remove(4_000_000, super::ROOT_BITMAP_ENTRY_INDEX));
    expected.remove(&4_000_000);

    assert!(map.garbage_bytes() > 0);
    let compact = map.compacted().unwrap();
    assert_eq!(compact.garbage_bytes(), 0);
    assert!(compact.total_bytes() < map.total_bytes());
    for (&key, &value) in &expected {
        assert_eq!(compact.get_root(key).value, value, "key {key}");
    }
    assert!(!compact.get_root(4_000_000).is_valid);
    let new_level = compact.get_root(7).next_level_bitmap_entry_index;
    assert_ne!(new_level, INVALID_INDEX);
    assert_eq!(compact.get(99, new_level).value, 9999);
}

#[test]
fn compacted_layout_is_canonical() {
    // Same content reached through different histories compacts to the
    // same bytes.
    let mut a = TrieMap::new();
    let mut b = TrieMap::new();
    for key in 0..500u32 {
        assert!(a.put_root(key, key as u64));
    }
    for key in (0..500u32).rev() {
        assert!(b.put_root(key, (key as u64) + 7));
        assert!(b.put_root(key, key as u64));
    }
    assert_eq!(
        a.compacted().unwrap().as_bytes(),
        b.compacted().unwrap().as_bytes()
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn last_write_wins(ops in prop::collection::vec((0u32..64, 0u64..=MAX_VALUE), 1..200)) {
        let mut map = TrieMap::new();
        let mut expected: HashMap<u32, u64> = HashMap::new();
        for (key, value) in ops {
            prop_assert!(map.put_root(key, value));
            expected.insert(key, value);
        }
        for (key, value) in expected {
            prop_assert_eq!(map.get_root(key).value, value);
        }
    }
}

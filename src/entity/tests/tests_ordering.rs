use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::entity::Entity;
use crate::entity::ordering::*;

#[test]
fn keys_compare_as_signed_bytes() {
    // 0x80 is -128 as i8 and must sort before 0x00 and 0x7F.
    assert_eq!(compare_keys(&[0x80], &[0x00]), Ordering::Less);
    assert_eq!(compare_keys(&[0xFF], &[0x00]), Ordering::Less);
    assert_eq!(compare_keys(&[0x7F], &[0x80]), Ordering::Greater);
    assert_eq!(compare_keys(b"abc", b"abd"), Ordering::Less);
}

#[test]
fn prefix_sorts_first() {
    assert_eq!(compare_keys(b"ab", b"abc"), Ordering::Less);
    assert_eq!(compare_keys(b"", b"a"), Ordering::Less);
    assert_eq!(compare_keys(b"abc", b"abc"), Ordering::Equal);
}

#[test]
fn different_keys_ignore_timestamps() {
    let old_a = Entity::live(b"a".to_vec(), b"".to_vec(), 1);
    let new_b = Entity::live(b"b".to_vec(), b"".to_vec(), 1_000);
    let new_a = Entity::live(b"a".to_vec(), b"".to_vec(), 1_000);
    let old_b = Entity::live(b"b".to_vec(), b"".to_vec(), 1);

    assert_eq!(compare(&old_a, &new_b), Ordering::Less);
    assert_eq!(compare(&new_a, &old_b), Ordering::Less);
}

#[test]
fn equal_keys_put_most_recent_first() {
    let older = Entity::live(b"k".to_vec(), b"old".to_vec(), 1);
    let newer = Entity::live(b"k".to_vec(), b"new".to_vec(), 2);

    assert_eq!(compare(&newer, &older), Ordering::Less);
    assert_eq!(compare(&older, &newer), Ordering::Greater);
    assert_eq!(compare(&older, &older), Ordering::Equal);
}

#[test]
fn key_only_order_has_no_tie_break() {
    let older = Entity::live(b"k".to_vec(), b"old".to_vec(), 1);
    let newer = Entity::tombstone(b"k".to_vec(), 9);
    assert_eq!(compare_key_only(&older, &newer), Ordering::Equal);
}

#[test]
fn region_key_orders_btree_by_signed_bytes() {
    let mut map = BTreeMap::new();
    for key in [vec![0x01], vec![0xFF], vec![0x80], vec![0x7F], vec![0x00]] {
        map.insert(RegionKey::new(key.clone()), key);
    }

    let order: Vec<Vec<u8>> = map.into_values().collect();
    assert_eq!(
        order,
        vec![vec![0x80], vec![0xFF], vec![0x00], vec![0x01], vec![0x7F]]
    );
}

#[test]
fn sorting_entities_groups_versions() {
    let mut entities = vec![
        Entity::live(b"b".to_vec(), b"1".to_vec(), 1),
        Entity::live(b"a".to_vec(), b"1".to_vec(), 1),
        Entity::live(b"b".to_vec(), b"3".to_vec(), 3),
        Entity::live(b"a".to_vec(), b"2".to_vec(), 2),
    ];
    entities.sort_by(compare);

    let got: Vec<(&[u8], i64)> = entities.iter().map(|e| (e.key(), e.timestamp())).collect();
    assert_eq!(
        got,
        vec![(&b"a"[..], 2), (&b"a"[..], 1), (&b"b"[..], 3), (&b"b"[..], 1)]
    );
}

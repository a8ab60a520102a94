//! B-tree Page Layout Tests
//!
//! Integration tests for the slotted B-tree page:
//! - Record search and ghost reuse
//! - Randomized insert/ghost/defrag sequences checked against a model
//! - Fence containment and prefix compression
//! - Poor-man's key consistency
//! - Split planning, no-record splits, and format_steal

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use kestrel_common::page::{zeroed_page, PageImage};
use kestrel_common::{Lsn, PageId};
use kestrel_storage::btree::{
    poor_man_key, BTreePage, ChildRef, FenceKeys, FormatSpec, KeyStr, StealSource, LEAF_LEVEL,
    MAX_ENTRY_SIZE,
};

// =============================================================================
// Helpers
// =============================================================================

type Page = BTreePage<Box<PageImage>>;

fn key(n: u32) -> KeyStr {
    KeyStr::from_data(&n.to_be_bytes())
}

fn text(s: &str) -> KeyStr {
    KeyStr::from_data(s.as_bytes())
}

fn spec(level: i16, fences: FenceKeys, pid0: Option<ChildRef>) -> FormatSpec {
    FormatSpec {
        page_id: PageId::new(1, 7),
        store: 3,
        root: 7,
        level,
        pid0,
        foster: None,
        fences,
    }
}

fn format_page(level: i16, fences: FenceKeys, pid0: Option<ChildRef>) -> Page {
    let mut page = BTreePage::new(zeroed_page());
    page.format_steal(&spec(level, fences, pid0), None, None, false)
        .unwrap();
    page
}

fn empty_leaf() -> Page {
    format_page(LEAF_LEVEL, FenceKeys::infinite(), None)
}

/// Live records as (key, element), in slot order.
fn logical_view(page: &Page) -> Vec<(KeyStr, Vec<u8>)> {
    (0..page.nrecs())
        .filter(|&slot| !page.is_ghost(slot))
        .map(|slot| (page.get_key(slot), page.element(slot).to_vec()))
        .collect()
}

fn assert_matches_model(page: &Page, model: &BTreeMap<u32, Vec<u8>>, keyspace: u32) {
    let expected: Vec<(KeyStr, Vec<u8>)> =
        model.iter().map(|(k, v)| (key(*k), v.clone())).collect();
    assert_eq!(logical_view(page), expected);

    for k in 0..keyspace {
        match (page.search(&key(k)), model.get(&k)) {
            (Ok(slot), Some(value)) => {
                assert!(!page.is_ghost(slot), "key {} is a ghost", k);
                assert_eq!(page.element(slot), &value[..]);
            }
            (Ok(slot), None) => assert!(page.is_ghost(slot), "deleted key {} is live", k),
            (Err(_), None) => {}
            (Err(_), Some(_)) => panic!("key {} not found", k),
        }
    }
    assert_eq!(
        page.nrecs() - page.nghosts(),
        model.len(),
        "live count disagrees"
    );
    assert!(page.is_consistent(true, true));
}

fn random_value(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.gen_range(0..48);
    (0..len).map(|_| rng.gen()).collect()
}

// =============================================================================
// Search and Ghosts
// =============================================================================

#[test]
fn test_search_finds_slot_or_insert_point() {
    let mut page = empty_leaf();
    for k in [10, 20, 30] {
        page.insert_leaf(&key(k), b"v").unwrap();
    }

    assert_eq!(page.search(&key(20)), Ok(1));
    assert_eq!(page.search(&key(25)), Err(2));
    assert_eq!(page.search(&key(5)), Err(0));
    assert_eq!(page.search(&key(35)), Err(3));
    assert_eq!(page.search(&key(30)), Ok(2));
}

#[test]
fn test_reinsert_reuses_ghost() {
    let mut page = empty_leaf();
    for k in [10, 20, 30] {
        page.insert_leaf(&key(k), b"old").unwrap();
    }

    let slot = page.search(&key(20)).unwrap();
    page.mark_ghost(slot);
    assert_eq!(page.nghosts(), 1);
    assert!(page.is_ghost(slot));

    let slot = page.insert_leaf(&key(20), b"new value").unwrap();
    assert_eq!(page.search(&key(20)), Ok(slot));
    assert_eq!(page.element(slot), b"new value");
    assert_eq!(page.nghosts(), 0);
    assert_eq!(page.nrecs(), 3);
    assert!(page.is_consistent(true, true));
}

#[test]
fn test_duplicate_live_key_rejected() {
    let mut page = empty_leaf();
    page.insert_leaf(&key(1), b"a").unwrap();
    let before = *page.image();
    let err = page.insert_leaf(&key(1), b"b").unwrap_err();
    assert!(matches!(err, kestrel_common::KestrelError::DuplicateKey));
    assert_eq!(&before[..], &page.image()[..]);
}

#[test]
fn test_reserve_then_replace_ghost() {
    let mut page = empty_leaf();
    let slot = page.reserve_ghost(&key(4), 3).unwrap();
    assert!(page.is_ghost(slot));
    assert_eq!(page.element(slot), &[0, 0, 0]);

    page.replace_ghost(&key(4), b"xyz").unwrap();
    assert!(!page.is_ghost(slot));
    assert_eq!(page.element(slot), b"xyz");
}

#[test]
fn test_element_access_and_overwrite() {
    let mut page = empty_leaf();
    let slot = page.insert_leaf(&key(9), b"abcdef").unwrap();

    page.overwrite_el(slot, 2, b"ZZ").unwrap();
    assert_eq!(page.element(slot), b"abZZef");
    assert!(page.overwrite_el(slot, 5, b"toolong").is_err());

    let mut short = [0u8; 3];
    assert_eq!(page.copy_element(slot, &mut short), Err(6));
    let mut out = [0u8; 16];
    assert_eq!(page.copy_element(slot, &mut out), Ok(6));
    assert_eq!(&out[..6], b"abZZef");

    page.replace_el(slot, b"a much longer element").unwrap();
    assert_eq!(page.element(slot), b"a much longer element");
    assert!(page.is_consistent(true, true));
}

#[test]
fn test_remove_shift() {
    let mut page = empty_leaf();
    for k in 0..5 {
        page.insert_leaf(&key(k), &[k as u8]).unwrap();
    }
    page.remove_shift(2);
    let keys: Vec<KeyStr> = (0..page.nrecs()).map(|s| page.get_key(s)).collect();
    assert_eq!(keys, vec![key(0), key(1), key(3), key(4)]);
}

// =============================================================================
// Randomized Model Check
// =============================================================================

#[test]
fn test_random_operations_match_model() {
    const KEYSPACE: u32 = 400;
    let mut rng = StdRng::seed_from_u64(0x5eed_0001);
    let mut page = empty_leaf();
    let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

    for _ in 0..3000 {
        let k = rng.gen_range(0..KEYSPACE);
        let target = key(k);
        match rng.gen_range(0..10) {
            0..=5 => {
                let value = random_value(&mut rng);
                if model.contains_key(&k) {
                    let slot = page.search(&target).unwrap();
                    match page.replace_el(slot, &value) {
                        Ok(()) => {
                            model.insert(k, value);
                        }
                        Err(e) => assert!(e.is_record_wont_fit()),
                    }
                } else {
                    match page.insert_leaf(&target, &value) {
                        Ok(_) => {
                            model.insert(k, value);
                        }
                        Err(e) => {
                            assert!(e.is_record_wont_fit());
                            page.defrag();
                            if page.insert_leaf(&target, &value).is_ok() {
                                model.insert(k, value);
                            }
                        }
                    }
                }
            }
            6..=8 => {
                if model.remove(&k).is_some() {
                    let slot = page.search(&target).unwrap();
                    page.mark_ghost(slot);
                }
            }
            _ => {
                let before = logical_view(&page);
                page.defrag();
                assert_eq!(page.nghosts(), 0);
                assert_eq!(logical_view(&page), before);
            }
        }
        assert_matches_model(&page, &model, KEYSPACE);
    }
}

#[test]
fn test_compact_preserves_search_results() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut page = empty_leaf();
    for k in 0..120u32 {
        page.insert_leaf(&key(k * 3), &random_value(&mut rng)).unwrap();
    }
    for slot in (0..page.nrecs()).step_by(4) {
        page.mark_ghost(slot);
    }

    let candidate = |page: &Page| -> Vec<Option<Vec<u8>>> {
        (0..400u32)
            .map(|k| match page.search(&key(k)) {
                Ok(slot) if !page.is_ghost(slot) => Some(page.element(slot).to_vec()),
                _ => None,
            })
            .collect()
    };

    let before = candidate(&page);
    let reclaimed = page.defrag();
    assert_eq!(reclaimed.len(), 30);
    assert_eq!(candidate(&page), before);
    assert!(page.is_consistent(true, true));
}

// =============================================================================
// Fences and Prefix Compression
// =============================================================================

#[test]
fn test_fence_contains_agrees_with_comparisons() {
    let fence_sets = vec![
        FenceKeys::infinite(),
        FenceKeys::new(text("apple"), text("apricot"), KeyStr::empty()),
        FenceKeys::new(text("m"), KeyStr::pos_inf(), KeyStr::empty()),
        FenceKeys::new(KeyStr::neg_inf(), text("m"), KeyStr::empty()),
        FenceKeys::new(text("user:0100"), text("user:0200"), text("user:0300")),
    ];
    let alphabet = b"aeilmoprtu0123:";
    let mut rng = StdRng::seed_from_u64(42);

    for fences in fence_sets {
        let page = format_page(LEAF_LEVEL, fences.clone(), None);
        assert_eq!(page.fence_low(), fences.low.as_bytes());
        assert_eq!(page.fence_high(), fences.high);
        assert_eq!(page.chain_fence_high(), fences.chain_high.as_bytes());

        let mut candidates = vec![
            KeyStr::neg_inf(),
            KeyStr::pos_inf(),
            fences.low.clone(),
            fences.high.clone(),
        ];
        for _ in 0..500 {
            let len = rng.gen_range(0..10);
            let data: Vec<u8> = (0..len)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                .collect();
            candidates.push(KeyStr::from_data(&data));
        }

        for candidate in &candidates {
            let by_compare = page.compare_with_fence_low(candidate) != Ordering::Less
                && page.compare_with_fence_high(candidate) == Ordering::Less;
            let by_order = &fences.low <= candidate && candidate < &fences.high;
            assert_eq!(page.fence_contains(candidate), by_compare, "{:?}", candidate);
            assert_eq!(by_compare, by_order, "{:?}", candidate);
        }
        assert!(page.fence_contains(&fences.low));
        assert!(!page.fence_contains(&fences.high));
    }
}

#[test]
fn test_prefix_is_elided_and_restored() {
    let fences = FenceKeys::new(text("user:0000"), text("user:0999"), KeyStr::empty());
    let mut page = format_page(LEAF_LEVEL, fences, None);
    assert_eq!(page.prefix_len(), 7);
    assert_eq!(page.prefix_key(), &text("user:0").as_bytes()[..]);

    let keys: Vec<KeyStr> = (0..50).map(|i| text(&format!("user:0{:03}", i * 7))).collect();
    for (i, k) in keys.iter().enumerate() {
        page.insert_leaf(k, &[i as u8; 5]).unwrap();
    }

    for slot in 0..page.nrecs() {
        let stored = page.key_noprefix(slot);
        let full = page.get_key(slot);
        assert_eq!(full.as_bytes()[page.prefix_len()..], *stored);
        assert_eq!(full, keys[slot]);
    }
    assert!(page.insert_leaf(&text("user:1000"), b"").is_err());
}

#[test]
fn test_poor_man_keys_match_truncated_keys() {
    let mut rng = StdRng::seed_from_u64(99);
    let fences = FenceKeys::new(text("k"), text("l"), KeyStr::empty());
    let mut page = format_page(LEAF_LEVEL, fences, None);
    assert_eq!(page.prefix_len(), 1);

    for _ in 0..200 {
        let len = rng.gen_range(0..6);
        let mut data = vec![b'k'];
        data.extend((0..len).map(|_| rng.gen::<u8>()));
        let _ = page.insert_leaf(&KeyStr::from_data(&data), b"e");
    }
    assert_eq!(page.item_poor(0), 0);
    for slot in 0..page.nrecs() {
        assert_eq!(page.item_poor(slot + 1), poor_man_key(page.key_noprefix(slot)));
    }
    assert!(page.is_consistent(true, true));
}

// =============================================================================
// Space Accounting
// =============================================================================

#[test]
fn test_record_wont_fit_leaves_page_unchanged() {
    let mut page = empty_leaf();
    let big = vec![0xABu8; 1000];
    let mut inserted = 0;
    let err = loop {
        match page.insert_leaf(&key(inserted), &big) {
            Ok(_) => inserted += 1,
            Err(e) => break e,
        }
    };
    assert!(err.is_record_wont_fit());
    assert!(inserted >= 7);

    let before = *page.image();
    assert!(page.insert_leaf(&key(inserted), &big).is_err());
    assert!(page.replace_el(0, &vec![1u8; 2000]).is_err());
    assert_eq!(&before[..], &page.image()[..]);
}

#[test]
fn test_entry_size_limit() {
    let mut page = empty_leaf();
    assert_eq!(BTreePage::<Box<PageImage>>::max_entry_size(), MAX_ENTRY_SIZE);
    let element = vec![0u8; MAX_ENTRY_SIZE];
    assert!(matches!(
        page.insert_leaf(&key(1), &element),
        Err(kestrel_common::KestrelError::KeyTooLarge { .. })
    ));
    page.insert_leaf(&key(1), &element[..MAX_ENTRY_SIZE - 4]).unwrap();
}

#[test]
fn test_leaf_stats() {
    let mut page = empty_leaf();
    for k in 0..10 {
        page.insert_leaf(&key(k), &[0u8; 20]).unwrap();
    }
    let stats = page.leaf_stats();
    assert_eq!(stats.entry_count, 10);
    assert_eq!(stats.key_bytes, 10 * 5);
    assert_eq!(stats.data_bytes, 10 * 20);
    assert_eq!(stats.unused_bytes, page.usable_space());
    assert!(page.check_space_for_insert_leaf(5, 20));
}

// =============================================================================
// Interior Nodes
// =============================================================================

fn interior_with_children() -> Page {
    let mut node = format_page(
        LEAF_LEVEL + 1,
        FenceKeys::infinite(),
        Some(ChildRef::PageId(100)),
    );
    for (slot, k) in [10u32, 20, 30].iter().enumerate() {
        assert!(node.check_space_for_insert_node(&key(*k)));
        node.insert_node(&key(*k), slot, ChildRef::PageId(100 + k))
            .unwrap();
    }
    node
}

#[test]
fn test_search_node_routes_to_children() {
    let node = interior_with_children();
    assert_eq!(node.pid0(), Some(ChildRef::PageId(100)));
    assert_eq!(node.search_node(&key(5)), None);
    assert_eq!(node.search_node(&key(10)), Some(0));
    assert_eq!(node.search_node(&key(15)), Some(0));
    assert_eq!(node.search_node(&key(20)), Some(1));
    assert_eq!(node.search_node(&key(99)), Some(2));
    assert_eq!(node.child(1), Some(ChildRef::PageId(120)));
    assert!(node.is_consistent(true, true));
}

#[test]
fn test_child_swizzle_round_trip() {
    let mut node = interior_with_children();
    node.set_child(1, ChildRef::FrameIndex(4));
    node.set_pid0(Some(ChildRef::FrameIndex(9)));
    assert_eq!(node.child(1), Some(ChildRef::FrameIndex(4)));
    assert_eq!(node.pid0(), Some(ChildRef::FrameIndex(9)));
    assert_eq!(node.get_key(1), key(20));

    node.set_child(1, ChildRef::PageId(120));
    assert_eq!(node.child(1), Some(ChildRef::PageId(120)));
}

#[test]
fn test_merge_steals_second_pid0() {
    let mut left = format_page(
        LEAF_LEVEL + 1,
        FenceKeys::new(KeyStr::neg_inf(), key(50), KeyStr::empty()),
        Some(ChildRef::PageId(100)),
    );
    left.insert_node(&key(10), 0, ChildRef::PageId(110)).unwrap();
    left.insert_node(&key(20), 1, ChildRef::PageId(120)).unwrap();

    let mut right = format_page(
        LEAF_LEVEL + 1,
        FenceKeys::new(key(50), KeyStr::pos_inf(), KeyStr::empty()),
        Some(ChildRef::PageId(150)),
    );
    right.insert_node(&key(60), 0, ChildRef::PageId(160)).unwrap();

    let mut merged = BTreePage::new(zeroed_page());
    merged
        .format_steal(
            &spec(LEAF_LEVEL + 1, FenceKeys::infinite(), Some(ChildRef::PageId(100))),
            Some(StealSource { image: left.image(), from: 0, to: 2 }),
            Some(StealSource { image: right.image(), from: 0, to: 1 }),
            true,
        )
        .unwrap();

    let keys: Vec<KeyStr> = (0..merged.nrecs()).map(|s| merged.get_key(s)).collect();
    let children: Vec<Option<ChildRef>> = (0..merged.nrecs()).map(|s| merged.child(s)).collect();
    assert_eq!(keys, vec![key(10), key(20), key(50), key(60)]);
    assert_eq!(
        children,
        vec![
            Some(ChildRef::PageId(110)),
            Some(ChildRef::PageId(120)),
            Some(ChildRef::PageId(150)),
            Some(ChildRef::PageId(160)),
        ]
    );
    assert!(merged.is_consistent(true, true));
}

// =============================================================================
// Splits
// =============================================================================

#[test]
fn test_split_point_follows_insertion_skew() {
    // Ascending inserts: skewed right, split near the tail.
    let mut page = empty_leaf();
    for k in 0..40 {
        page.insert_leaf(&key(k), b"v").unwrap();
    }
    assert!(page.is_insertion_skewed_right());
    let (mid, right_from) = page.suggest_fence_for_split(&key(40)).unwrap();
    assert_eq!(right_from, 36);
    assert_eq!(mid, key(36));

    // Descending inserts: skewed left, split near the head.
    let mut page = empty_leaf();
    for k in (0..40).rev() {
        page.insert_leaf(&key(k), b"v").unwrap();
    }
    assert!(page.is_insertion_skewed_left());
    let (mid, right_from) = page.suggest_fence_for_split(&key(0)).unwrap();
    assert_eq!(right_from, 4);
    assert_eq!(mid, key(4));

    // Evens then odds: inserts land in the middle, split at the center.
    let mut page = empty_leaf();
    for k in (0..40).step_by(2).chain((1..40).step_by(2)) {
        page.insert_leaf(&key(k), b"v").unwrap();
    }
    assert!(!page.is_insertion_skewed_right());
    assert!(!page.is_insertion_skewed_left());
    let (mid, right_from) = page.suggest_fence_for_split(&key(17)).unwrap();
    assert_eq!(right_from, 20);
    assert_eq!(page.recalculate_fence_for_split(right_from).unwrap(), mid);
}

#[test]
fn test_split_prefers_short_separator() {
    let mut page = empty_leaf();
    // Mixed order keeps the insertion skew near zero.
    let words = [
        "gamma", "alpha", "gammon", "beta", "alphabet", "betamax", "alphanumeric", "betray",
        "alpine", "bettor",
    ];
    for word in words {
        page.insert_leaf(&text(word), b"").unwrap();
    }
    let (mid, right_from) = page.suggest_fence_for_split(&text("zeta")).unwrap();
    // "alpine" | "beta" separates with the single byte "b".
    assert_eq!(right_from, 4);
    assert_eq!(mid, text("b"));
    assert!(mid > page.get_key(3) && mid <= page.get_key(4));
}

#[test]
fn test_format_steal_splits_records() {
    let mut page = empty_leaf();
    for k in 0..20 {
        page.insert_leaf(&key(k), &[k as u8; 3]).unwrap();
    }
    page.mark_ghost(15);
    let mid = page.recalculate_fence_for_split(10).unwrap();

    let mut right = BTreePage::new(zeroed_page());
    right
        .format_steal(
            &spec(LEAF_LEVEL, FenceKeys::new(mid.clone(), KeyStr::pos_inf(), KeyStr::empty()), None),
            Some(StealSource { image: page.image(), from: 10, to: 20 }),
            None,
            false,
        )
        .unwrap();
    assert_eq!(right.nrecs(), 10);
    assert_eq!(right.nghosts(), 1);
    assert!(right.is_ghost(5));
    assert_eq!(right.get_key(0), key(10));
    assert_eq!(right.element(9), &[19u8; 3]);
    assert!(right.is_consistent(true, true));

    let copy = Box::new(*page.image());
    page.format_steal(
        &spec(LEAF_LEVEL, FenceKeys::new(KeyStr::neg_inf(), mid, KeyStr::empty()), None),
        Some(StealSource { image: &copy, from: 0, to: 10 }),
        None,
        false,
    )
    .unwrap();
    assert_eq!(page.nrecs(), 10);
    assert!(!page.fence_contains(&key(10)));
    assert!(page.fence_contains(&key(9)));
    assert!(page.is_consistent(true, true));
}

#[test]
fn test_failed_format_steal_leaves_page_unchanged() {
    let mut page = empty_leaf();
    for k in 0..5 {
        page.insert_leaf(&key(k), b"v").unwrap();
    }
    let source = Box::new(*page.image());
    let before = *page.image();

    // Range past the end of the source.
    let result = page.format_steal(
        &spec(LEAF_LEVEL, FenceKeys::infinite(), None),
        Some(StealSource { image: &source, from: 0, to: 9 }),
        None,
        false,
    );
    assert!(result.is_err());
    assert_eq!(&before[..], &page.image()[..]);

    // Records outside the new fences.
    let result = page.format_steal(
        &spec(LEAF_LEVEL, FenceKeys::new(text("x"), text("y"), KeyStr::empty()), None),
        Some(StealSource { image: &source, from: 0, to: 5 }),
        None,
        false,
    );
    assert!(result.is_err());
    assert_eq!(&before[..], &page.image()[..]);
}

#[test]
fn test_norecord_split_updates_fences_in_place() {
    let mut page = empty_leaf();
    for k in 0..10 {
        page.insert_leaf(&key(k), b"v").unwrap();
    }
    page.norecord_split(ChildRef::PageId(12), &key(100), &KeyStr::pos_inf())
        .unwrap();

    assert_eq!(page.foster(), Some(ChildRef::PageId(12)));
    assert_eq!(page.fence_high(), key(100));
    assert_eq!(page.chain_fence_high(), KeyStr::pos_inf().as_bytes());
    assert_eq!(page.prefix_len(), 0);
    assert_eq!(page.consecutive_skewed_insertions(), 0);
    assert!(page.fence_contains(&key(99)));
    assert!(!page.fence_contains(&key(100)));
    assert_eq!(page.search(&key(7)), Ok(7));

    page.clear_foster();
    assert_eq!(page.foster(), None);
    assert!(page.chain_fence_high().is_empty());
    assert_eq!(page.fence_high(), key(100));
    assert!(page.is_consistent(true, true));
}

#[test]
fn test_key_equal_to_high_fence_is_inconsistent() {
    let build = |high: u32| {
        let mut page = empty_leaf();
        for k in 0..10 {
            page.insert_leaf(&key(k), b"v").unwrap();
        }
        page.norecord_split(ChildRef::PageId(12), &key(high), &KeyStr::pos_inf())
            .unwrap();
        page
    };

    assert!(build(10).is_consistent(true, true));
    assert!(!build(9).is_consistent(true, true));
    assert!(!build(8).is_consistent(true, true));
}

#[test]
fn test_norecord_split_recompresses_prefix() {
    let fences = FenceKeys::new(text("user:0000"), KeyStr::pos_inf(), KeyStr::empty());
    let mut page = format_page(LEAF_LEVEL, fences, None);
    let keys: Vec<KeyStr> = (1..10).map(|i| text(&format!("user:000{}", i))).collect();
    for k in &keys {
        page.insert_leaf(k, b"payload").unwrap();
    }
    page.set_lsn(Lsn(77));
    assert_eq!(page.prefix_len(), 0);

    page.norecord_split(ChildRef::PageId(12), &text("user:0010"), &KeyStr::pos_inf())
        .unwrap();

    assert_eq!(page.prefix_len(), 8);
    assert_eq!(page.lsn(), Lsn(77));
    assert_eq!(page.page_id(), PageId::new(1, 7));
    assert_eq!(page.foster(), Some(ChildRef::PageId(12)));
    assert_eq!(page.fence_high(), text("user:0010"));
    for (slot, k) in keys.iter().enumerate() {
        assert_eq!(&page.get_key(slot), k);
        assert_eq!(page.element(slot), b"payload");
    }
    assert!(page.is_consistent(true, true));
}

#[test]
fn test_norecord_split_chance_for_bulk_load() {
    let mut page = empty_leaf();
    let value = [0u8; 200];
    let mut k = 0;
    while page.check_space_for_insert_leaf(5, value.len()) {
        page.insert_leaf(&key(k), &value).unwrap();
        k += 1;
    }
    assert!(page.is_insertion_extremely_skewed_right());
    assert!(page.check_chance_for_norecord_split(&key(k)));
    assert!(!page.check_chance_for_norecord_split(&key(0)));

    let (mid, right_from) = page.suggest_fence_for_split(&key(k)).unwrap();
    assert_eq!(right_from, page.nrecs());
    assert!(mid > page.get_key(page.nrecs() - 1));
    assert!(mid <= key(k));
}

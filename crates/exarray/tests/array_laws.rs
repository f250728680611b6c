//! Element-level behaviour of a single array: the worked scenario, the
//! fill-value and write/read laws, iteration and node placement.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use exarray::{
    ArrayCache, ArrayError, CreateParams, ExtensibleArray, IterControl, IterStatus, NodeKind,
};
use exarray_cache::{CacheConfig, MemoryStore};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

const FILL: u32 = 0xdead_beef;

fn cache() -> Arc<ArrayCache> {
    Arc::new(ArrayCache::new(Arc::new(MemoryStore::new()), CacheConfig::default()).expect("cache"))
}

fn small_params() -> CreateParams {
    CreateParams::new(4)
        .with_idx_blk_elmts(4)
        .with_data_blk_min_elmts(4)
        .with_max_nelmts_bits(20)
        .with_fill_value(FILL)
}

fn read(array: &ExtensibleArray, index: u64) -> u32 {
    let mut out = [0u8; 4];
    array.get(index, &mut out).expect("get");
    u32::from_le_bytes(out)
}

fn write(array: &ExtensibleArray, index: u64, value: u32) {
    array.set(index, &value.to_le_bytes()).expect("set");
}

#[test]
fn test_worked_scenario() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");
    assert_eq!(array.nelmts().expect("nelmts"), 0);
    assert_eq!(read(&array, 0), FILL);

    write(&array, 2, 42);
    assert_eq!(read(&array, 2), 42);
    assert_eq!(array.nelmts().expect("nelmts"), 3);

    write(&array, 10, 7);
    assert_eq!(read(&array, 10), 7);
    assert_eq!(array.nelmts().expect("nelmts"), 11);

    // 9 shares a data block with 10; 5 lives in a block never created
    assert_eq!(read(&array, 9), FILL);
    assert_eq!(read(&array, 5), FILL);
    let block = array.node_location(10).expect("locate").expect("materialized");
    assert_eq!(block.kind, NodeKind::DataBlock);
    assert_eq!(array.node_location(9).expect("locate"), Some(block));
    assert_eq!(array.node_location(5).expect("locate"), None);

    array.close().expect("close");
}

#[test]
fn test_nelmts_never_decreases() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");
    write(&array, 500, 1);
    write(&array, 3, 2);
    assert_eq!(array.nelmts().expect("nelmts"), 501);
    write(&array, 500, 3);
    assert_eq!(array.nelmts().expect("nelmts"), 501);
}

#[test]
fn test_bad_arguments_mutate_nothing() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");

    let err = array.set(1 << 20, &1u32.to_le_bytes()).expect_err("index too large");
    assert!(matches!(err, ArrayError::InvalidArgument(_)));
    let err = array.set(0, &[1, 2]).expect_err("short value");
    assert!(matches!(err, ArrayError::InvalidArgument(_)));
    let mut short = [0u8; 2];
    let err = array.get(0, &mut short).expect_err("short output");
    assert!(matches!(err, ArrayError::InvalidArgument(_)));

    assert_eq!(array.nelmts().expect("nelmts"), 0);
    assert_eq!(array.stats().expect("stats").nindex_blks, 0);
}

#[test]
fn test_invalid_parameters_rejected() {
    let cache = cache();
    let err = ExtensibleArray::create(&cache, CreateParams::new(4).with_data_blk_min_elmts(3))
        .expect_err("min elements must be a power of two");
    assert!(matches!(err, ArrayError::InvalidConfiguration(_)));
    assert!(cache.is_empty());
}

#[test]
fn test_iterate_visits_fill_and_stops() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");
    write(&array, 1, 10);
    write(&array, 6, 60);

    let mut seen = Vec::new();
    let status = array
        .iterate(|index, value| {
            seen.push((index, u32::from_le_bytes(value.try_into().expect("4 bytes"))));
            IterControl::Continue
        })
        .expect("iterate");
    assert_eq!(status, IterStatus::Completed);
    assert_eq!(seen.len(), 7);
    assert_eq!(seen[1], (1, 10));
    assert_eq!(seen[5], (5, FILL));
    assert_eq!(seen[6], (6, 60));

    let status = array
        .iterate(|index, _| if index == 3 { IterControl::Stop } else { IterControl::Continue })
        .expect("iterate");
    assert_eq!(status, IterStatus::Stopped { index: 3 });
}

#[test]
fn test_node_addresses_are_stable() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");
    write(&array, 200, 1);
    let first = array.node_location(200).expect("locate").expect("materialized");

    for index in [201, 150, 300, 4000, 199] {
        write(&array, index, 2);
    }
    cache.flush().expect("flush");
    cache.evict_all().expect("evict");
    assert_eq!(array.node_location(200).expect("locate"), Some(first));
    assert_eq!(read(&array, 200), 1);
}

#[test]
fn test_stats_track_created_nodes() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");
    let layout = Arc::clone(array.layout());

    write(&array, 0, 1);
    let stats = array.stats().expect("stats");
    assert_eq!(stats.nindex_blks, 1);
    assert_eq!(stats.index_blk_size, layout.iblock_extent());
    assert_eq!(stats.ndata_blks, 0);

    // tier 0 is direct, tier 4 is the first behind a super block
    write(&array, 4, 1);
    write(&array, 64, 1);
    let stats = array.stats().expect("stats");
    assert_eq!(stats.ndata_blks, 2);
    assert_eq!(stats.data_blk_size, layout.dblk_extent(0) + layout.dblk_extent(4));
    assert_eq!(stats.nsuper_blks, 1);
    assert_eq!(stats.super_blk_size, layout.sblk_extent(4));
    assert_eq!(stats.max_idx_set, 65);
    assert_eq!(
        stats.total_size(),
        layout.header_extent() + layout.iblock_extent() + stats.super_blk_size + stats.data_blk_size
    );

    let json = serde_json::to_string(&stats).expect("serialize");
    assert!(json.contains("\"nsuper_blks\":1"));
}

#[test]
fn test_reads_past_materialized_tiers_create_nothing() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, small_params()).expect("create");
    write(&array, 0, 1);

    let resident = cache.len();
    let inserts = cache.stats().inserts;
    let eoa = cache.store().end_of_allocation();
    let stats = array.stats().expect("stats");
    assert_eq!(stats.nsuper_blks, 0);

    // 5000 falls in a super block tier none of whose blocks exist
    assert_eq!(read(&array, 5000), FILL);
    assert_eq!(array.node_location(5000).expect("locate"), None);

    assert_eq!(cache.len(), resident);
    assert_eq!(cache.stats().inserts, inserts);
    assert_eq!(cache.store().end_of_allocation(), eoa);
    assert_eq!(array.stats().expect("stats"), stats);
    assert_eq!(array.nelmts().expect("nelmts"), 1);
}

#[test]
fn test_default_fill_is_zero() {
    let cache = cache();
    let array = ExtensibleArray::create(&cache, CreateParams::new(4)).expect("create");
    assert_eq!(read(&array, 12345), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn writes_read_back_and_everything_else_is_fill(
        writes in proptest::collection::vec((0u64..(1 << 14), any::<u32>()), 1..40),
        probes in proptest::collection::vec(0u64..(1 << 14), 1..40),
    ) {
        let cache = cache();
        let array = ExtensibleArray::create(&cache, small_params())
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let mut expected = BTreeMap::new();
        for &(index, value) in &writes {
            array.set(index, &value.to_le_bytes()).map_err(|e| TestCaseError::fail(e.to_string()))?;
            expected.insert(index, value);
        }

        for (&index, &value) in &expected {
            prop_assert_eq!(read(&array, index), value);
        }
        for index in probes {
            prop_assert_eq!(read(&array, index), expected.get(&index).copied().unwrap_or(FILL));
        }
        let max = expected.keys().next_back().copied().unwrap_or(0);
        prop_assert_eq!(array.nelmts().map_err(|e| TestCaseError::fail(e.to_string()))?, max + 1);
    }
}

//! Persistence, integrity checking and failure handling against the backing
//! store.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use exarray::{ArrayCache, CreateParams, ExtensibleArray, FillValue, NodeKind};
use exarray_cache::{BlockStore, CacheConfig, FileStore, MemoryStore};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn cache_over(store: Arc<dyn BlockStore>) -> Arc<ArrayCache> {
    Arc::new(ArrayCache::new(store, CacheConfig::default()).expect("cache"))
}

fn params() -> CreateParams {
    CreateParams::new(4)
        .with_idx_blk_elmts(4)
        .with_data_blk_min_elmts(4)
        .with_max_nelmts_bits(20)
        .with_fill_value(0xdead_beef_u32)
}

fn read(array: &ExtensibleArray, index: u64) -> u32 {
    let mut out = [0u8; 4];
    array.get(index, &mut out).expect("get");
    u32::from_le_bytes(out)
}

#[test]
fn test_file_store_round_trip() {
    init_tracing();
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("array.bin");

    let addr = {
        let cache = cache_over(Arc::new(FileStore::create(&path).expect("file store")));
        let array = ExtensibleArray::create(&cache, params()).expect("create");
        for index in [0u64, 9, 64, 1000, 65_000] {
            array.set(index, &(index as u32 + 1).to_le_bytes()).expect("set");
        }
        array.flush().expect("flush");
        let addr = array.address();
        array.close().expect("close");
        addr
    };

    let cache = cache_over(Arc::new(FileStore::open(&path).expect("file store")));
    let array = ExtensibleArray::open(&cache, addr).expect("open");
    assert_eq!(array.nelmts().expect("nelmts"), 65_001);
    for index in [0u64, 9, 64, 1000, 65_000] {
        assert_eq!(read(&array, index), index as u32 + 1);
    }
    assert_eq!(read(&array, 8), 0xdead_beef);
    assert_eq!(read(&array, 64_999), 0xdead_beef);
    assert_eq!(array.params().fill(), FillValue::from(0xdead_beef_u32));
}

#[test]
fn test_unflushed_writes_are_not_visible_to_a_new_cache() {
    let store = MemoryStore::new();
    let cache = cache_over(Arc::new(store.clone()));
    let array = ExtensibleArray::create(&cache, params()).expect("create");
    array.flush().expect("flush");
    array.set(3, &1u32.to_le_bytes()).expect("set");

    let other = cache_over(Arc::new(store.clone()));
    let reopened = ExtensibleArray::open(&other, array.address()).expect("open");
    assert_eq!(reopened.nelmts().expect("nelmts"), 0);
    assert_eq!(read(&reopened, 3), 0xdead_beef);
}

#[test]
fn test_created_header_is_durable_before_any_flush() {
    let store = MemoryStore::new();
    let cache = cache_over(Arc::new(store.clone()));
    let array = ExtensibleArray::create(&cache, params()).expect("create");
    assert!(!cache.is_dirty(array.address()));

    let other = cache_over(Arc::new(store.clone()));
    let reopened = ExtensibleArray::open(&other, array.address()).expect("open");
    assert_eq!(reopened.nelmts().expect("nelmts"), 0);
    assert_eq!(reopened.params().fill(), FillValue::from(0xdead_beef_u32));
    assert_eq!(read(&reopened, 7), 0xdead_beef);
}

#[test]
fn test_created_array_survives_close_and_cache_drop() {
    let store = MemoryStore::new();
    let addr = {
        let cache = cache_over(Arc::new(store.clone()));
        let array = ExtensibleArray::create(&cache, params()).expect("create");
        let addr = array.address();
        array.close().expect("close");
        addr
    };

    let cache = cache_over(Arc::new(store));
    let array = ExtensibleArray::open(&cache, addr).expect("open");
    assert_eq!(array.nelmts().expect("nelmts"), 0);
}

#[test]
fn test_last_close_writes_dirty_nodes() {
    init_tracing();
    let store = MemoryStore::new();
    let addr = {
        let cache = cache_over(Arc::new(store.clone()));
        let array = ExtensibleArray::create(&cache, params()).expect("create");
        for index in [1u64, 30, 500, 9000] {
            array.set(index, &(index as u32).to_le_bytes()).expect("set");
        }
        let addr = array.address();
        array.close().expect("close");
        assert_eq!(cache.stats().dirty, 0);
        addr
    };

    let cache = cache_over(Arc::new(store));
    let array = ExtensibleArray::open(&cache, addr).expect("open");
    assert_eq!(array.nelmts().expect("nelmts"), 9001);
    for index in [1u64, 30, 500, 9000] {
        assert_eq!(read(&array, index), index as u32);
    }
    assert_eq!(read(&array, 31), 0xdead_beef);
}

#[test]
fn test_close_writes_only_its_own_array() {
    let cache = cache_over(Arc::new(MemoryStore::new()));
    let first = ExtensibleArray::create(&cache, params()).expect("create");
    let second = ExtensibleArray::create(&cache, params()).expect("create");
    let shared = ExtensibleArray::open(&cache, first.address()).expect("open");
    first.set(100, &1u32.to_le_bytes()).expect("set");
    second.set(100, &2u32.to_le_bytes()).expect("set");

    let first_block = first.node_location(100).expect("locate").expect("materialized");
    let second_block = second.node_location(100).expect("locate").expect("materialized");

    // Another handle is still open on the first array
    first.close().expect("close");
    assert!(cache.is_dirty(first_block.addr));

    shared.close().expect("close");
    assert!(!cache.is_dirty(first_block.addr));
    assert!(cache.is_dirty(second_block.addr));
    assert!(cache.is_dirty(second.address()));
}

#[test]
fn test_top_index_of_wide_arrays_is_out_of_space() {
    init_tracing();
    for bits in [52u8, 63] {
        let store = MemoryStore::new();
        let cache = cache_over(Arc::new(store.clone()));
        let array = ExtensibleArray::create(&cache, CreateParams::new(8).with_max_nelmts_bits(bits))
            .expect("create");
        array.set(0, &1u64.to_le_bytes()).expect("set");

        let before = array.stats().expect("stats");
        let eoa = store.end_of_allocation();
        let resident = cache.len();

        let top = (1u64 << bits) - 1;
        let err = array
            .set(top, &2u64.to_le_bytes())
            .expect_err("top tier super block is too large to hold");
        assert!(err.is_out_of_space(), "{bits} bits: {err}");

        assert_eq!(array.stats().expect("stats"), before);
        assert_eq!(store.end_of_allocation(), eoa);
        assert_eq!(cache.len(), resident);
        assert_eq!(array.nelmts().expect("nelmts"), 1);

        let mut out = [0u8; 8];
        array.get(top, &mut out).expect("get");
        assert_eq!(out, [0; 8]);
        array.set(1, &3u64.to_le_bytes()).expect("set");
        assert_eq!(array.nelmts().expect("nelmts"), 2);
    }
}

#[test]
fn test_top_index_in_a_file_is_out_of_space() {
    let dir = TempDir::new().expect("temp dir");
    let store = FileStore::create(dir.path().join("wide.bin")).expect("file store");
    let cache = cache_over(Arc::new(store));
    let array = ExtensibleArray::create(&cache, CreateParams::new(8).with_max_nelmts_bits(52))
        .expect("create");

    let err = array
        .set((1u64 << 52) - 1, &2u64.to_le_bytes())
        .expect_err("top tier super block is too large to hold");
    assert!(err.is_out_of_space());
    assert_eq!(array.stats().expect("stats").nsuper_blks, 0);
    array.set(5, &1u64.to_le_bytes()).expect("set");
}

#[test]
fn test_node_image_bound_limits_growth() {
    let store = MemoryStore::new();
    let config = CacheConfig::new().with_max_image_len(512);
    let cache = Arc::new(ArrayCache::new(Arc::new(store.clone()), config).expect("cache"));
    let array = ExtensibleArray::create(&cache, params()).expect("create");

    // Early tiers fit in 512 byte images, the super block of tier 15 does not
    array.set(10, &1u32.to_le_bytes()).expect("set");
    let eoa = store.end_of_allocation();
    let err = array
        .set(200_000, &2u32.to_le_bytes())
        .expect_err("data block image exceeds the bound");
    assert!(err.is_out_of_space());
    assert_eq!(store.end_of_allocation(), eoa);
    assert_eq!(read(&array, 10), 1);
}

#[test]
fn test_corrupt_data_block_is_contained() {
    init_tracing();
    let store = MemoryStore::new();
    let cache = cache_over(Arc::new(store.clone()));
    let array = ExtensibleArray::create(&cache, params()).expect("create");
    array.set(2, &42u32.to_le_bytes()).expect("set");
    array.set(10, &7u32.to_le_bytes()).expect("set");
    array.flush().expect("flush");

    let block = array.node_location(10).expect("locate").expect("materialized");
    assert_eq!(block.kind, NodeKind::DataBlock);
    let addr = array.address();
    array.close().expect("close");

    // Flip one element byte behind the checksum's back
    let mut byte = [0u8; 1];
    store.read_at(block.addr.offset(25), &mut byte).expect("read");
    byte[0] ^= 0xff;
    store.write_at(block.addr.offset(25), &byte).expect("write");

    let other = cache_over(Arc::new(store.clone()));
    let array = ExtensibleArray::open(&other, addr).expect("open");
    let mut out = [0u8; 4];
    let err = array.get(10, &mut out).expect_err("checksum mismatch");
    assert!(err.is_corruption());
    assert!(!other.contains(block.addr));
    assert_eq!(other.stats().corruptions, 1);

    // Elements outside the damaged block are unaffected
    assert_eq!(read(&array, 2), 42);
    assert_eq!(read(&array, 5), 0xdead_beef);
    let err = array
        .set(11, &1u32.to_le_bytes())
        .expect_err("damaged block cannot be written");
    assert!(err.is_corruption());
    assert_eq!(array.nelmts().expect("nelmts"), 11);
}

#[test]
fn test_failed_allocation_rolls_back() {
    init_tracing();
    let store = MemoryStore::new();
    let cache = cache_over(Arc::new(store.clone()));
    let array = ExtensibleArray::create(&cache, params()).expect("create");
    array.set(63, &1u32.to_le_bytes()).expect("set");

    let before = array.stats().expect("stats");
    let eoa = store.end_of_allocation();
    let resident = cache.len();

    // Room for the super block of the next tier but not its data block
    store.set_limit(Some(eoa + array.layout().sblk_extent(4)));
    let err = array
        .set(64, &2u32.to_le_bytes())
        .expect_err("data block does not fit");
    assert!(err.is_out_of_space());

    assert_eq!(array.stats().expect("stats"), before);
    assert_eq!(array.nelmts().expect("nelmts"), 64);
    assert_eq!(array.node_location(64).expect("locate"), None);
    assert_eq!(store.end_of_allocation(), eoa);
    assert_eq!(cache.len(), resident);
    assert_eq!(read(&array, 64), 0xdead_beef);

    store.set_limit(None);
    array.set(64, &2u32.to_le_bytes()).expect("set");
    assert_eq!(read(&array, 64), 2);
    assert_eq!(array.stats().expect("stats").nsuper_blks, 1);
}

#[test]
fn test_flush_writes_parents_before_children() {
    let store = MemoryStore::new();
    let cache = cache_over(Arc::new(store.clone()));
    let array = ExtensibleArray::create(&cache, params()).expect("create");
    array.set(100, &5u32.to_le_bytes()).expect("set");

    let block = array.node_location(100).expect("locate").expect("materialized");
    let parents = cache.flush_dependency_parents(block.addr);
    assert_eq!(parents.len(), 1);
    assert_eq!(cache.stats().dirty, cache.len());

    let written = cache.stats().writes;
    array.flush().expect("flush");
    let stats = cache.stats();
    assert_eq!(stats.dirty, 0);
    assert_eq!((stats.writes - written) as usize, stats.resident);
}

#[test]
fn test_header_can_depend_on_another_node() {
    let cache = cache_over(Arc::new(MemoryStore::new()));
    let first = ExtensibleArray::create(&cache, params()).expect("create");
    let second = ExtensibleArray::create(&cache, params()).expect("create");

    second.depend(first.address()).expect("depend");
    assert_eq!(
        cache.flush_dependency_parents(second.address()),
        vec![first.address()]
    );
    assert!(second.depend(first.address()).is_err());

    second.undepend(first.address()).expect("undepend");
    assert!(cache.flush_dependency_parents(second.address()).is_empty());
    assert!(second.undepend(first.address()).is_err());
}

#[test]
fn test_evicted_nodes_reload() {
    let store = MemoryStore::new();
    let cache = Arc::new(
        ArrayCache::new(
            Arc::new(store.clone()),
            CacheConfig::new().with_max_entries(8).with_sync_on_flush(false),
        )
        .expect("cache"),
    );
    let array = ExtensibleArray::create(&cache, params()).expect("create");
    for index in (0..20_000u64).step_by(97) {
        array.set(index, &(index as u32).to_le_bytes()).expect("set");
    }
    array.flush().expect("flush");
    cache.evict_all().expect("evict");
    assert_eq!(cache.len(), 1, "only the pinned header stays resident");

    for index in (0..20_000u64).step_by(97) {
        assert_eq!(read(&array, index), index as u32);
    }
    let stats = cache.stats();
    assert!(stats.loads > 0);
    assert_eq!(stats.corruptions, 0);
}

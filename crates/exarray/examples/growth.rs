//! Grow an array in a file and print how its structure expands.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example growth
//! ```

use exarray::{ArrayCache, CreateParams, ExtensibleArray};
use exarray_cache::{CacheConfig, FileStore};
use std::sync::Arc;
use tempfile::TempDir;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let dir = TempDir::new()?;
    let path = dir.path().join("growth.bin");
    let store = Arc::new(FileStore::create(&path)?);
    let cache = Arc::new(ArrayCache::new(store, CacheConfig::default())?);

    let array = ExtensibleArray::create(&cache, CreateParams::new(8).with_fill_value(u64::MAX))?;
    println!("{:>10} {:>8} {:>8} {:>10}", "nelmts", "sblks", "dblks", "bytes");
    for exp in 0..20u32 {
        let index = (1u64 << exp) - 1;
        array.set(index, &index.to_le_bytes())?;
        let stats = array.stats()?;
        println!(
            "{:>10} {:>8} {:>8} {:>10}",
            stats.max_idx_set,
            stats.nsuper_blks,
            stats.ndata_blks,
            stats.total_size()
        );
    }
    array.flush()?;

    let stats = serde_json::to_string_pretty(&array.stats()?)?;
    println!("{stats}");
    println!("cache: {:?}", cache.stats());
    array.close()?;
    Ok(())
}

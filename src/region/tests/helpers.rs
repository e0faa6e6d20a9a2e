use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::entity::Entity;
use crate::region::Region;

pub const FP_RATE: f64 = 0.01;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Writes `entities` back-to-back, in the given order, to `dir/name`.
///
/// Bypasses the disk writer so tests can also produce files the writer would
/// refuse (duplicate keys, unsorted input).
pub fn write_raw_file(dir: &Path, name: &str, entities: &[Entity]) -> PathBuf {
    let mut buf = Vec::new();
    for entity in entities {
        entity.encode_to(&mut buf).unwrap();
    }
    let path = dir.join(name);
    std::fs::write(&path, buf).unwrap();
    path
}

/// Opens a region over a fresh empty file.
pub fn empty_region(dir: &Path) -> Region {
    init_tracing();
    let path = write_raw_file(dir, "empty-region", &[]);
    Region::open(path, FP_RATE).unwrap()
}

pub fn live(key: &[u8], value: &[u8], ts: i64) -> Entity {
    Entity::live(key.to_vec(), value.to_vec(), ts)
}

pub fn tomb(key: &[u8], ts: i64) -> Entity {
    Entity::tombstone(key.to_vec(), ts)
}

/// Drains a region's logical view into `(key, value)` pairs.
pub fn logical(region: &Region) -> Vec<(Vec<u8>, Vec<u8>)> {
    region
        .values()
        .unwrap()
        .map(|e| {
            let (key, value) = e.unwrap().into_parts();
            (key, value)
        })
        .collect()
}

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::directory::{DirectoryOptions, RegionDirectory};
use crate::entity::Entity;
use crate::region::Region;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open_dir(path: &Path) -> RegionDirectory {
    init_tracing();
    RegionDirectory::open(path, DirectoryOptions::default()).unwrap()
}

/// Places a hand-written region file under `dir`.
pub fn seed_file(dir: &Path, name: &str, entities: &[Entity]) -> PathBuf {
    let mut buf = Vec::new();
    for entity in entities {
        entity.encode_to(&mut buf).unwrap();
    }
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, buf).unwrap();
    path
}

pub fn live(key: &[u8], value: &[u8], ts: i64) -> Entity {
    Entity::live(key.to_vec(), value.to_vec(), ts)
}

pub fn tomb(key: &[u8], ts: i64) -> Entity {
    Entity::tombstone(key.to_vec(), ts)
}

pub fn visible(dir: &RegionDirectory, region: &Region) -> Vec<Entity> {
    dir.values(region).unwrap().map(|e| e.unwrap()).collect()
}

/// Names of the files currently under `path`, sorted.
pub fn files_in(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

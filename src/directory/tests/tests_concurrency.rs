#[cfg(test)]
mod concurrency_tests {
    use crate::directory::DirectoryError;
    use crate::directory::tests::helpers::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_puts_during_flushes_are_not_lost() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(open_dir(tmp.path()));
        let stop = Arc::new(AtomicBool::new(false));

        let flusher = {
            let dir = Arc::clone(&dir);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut flushes = 0;
                while !stop.load(Ordering::Acquire) {
                    let region = dir.get_region(b"key").unwrap();
                    match dir.flush_region(&region) {
                        Ok(_) => flushes += 1,
                        Err(DirectoryError::RegionRetired(_)) => {}
                        Err(e) => panic!("flush failed: {e}"),
                    }
                }
                flushes
            })
        };

        let mut writers = Vec::new();
        for t in 0..4 {
            let dir = Arc::clone(&dir);
            writers.push(thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("key-{t}-{i:04}").into_bytes();
                    assert!(dir.put(&live(&key, b"v", 1)).unwrap());
                }
            }));
        }
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        flusher.join().unwrap();

        let region = dir.get_region(b"key").unwrap();
        assert_eq!(visible(&dir, &region).len(), 1000);
        for t in 0..4 {
            for i in (0..250).step_by(37) {
                let key = format!("key-{t}-{i:04}").into_bytes();
                assert!(dir.get(&key).unwrap().is_some(), "lost {key:?}");
            }
        }
    }

    #[test]
    fn test_concurrent_first_lookups_create_one_region() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(open_dir(tmp.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = Arc::clone(&dir);
                thread::spawn(move || dir.get_region(b"k").unwrap())
            })
            .collect();
        let regions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(dir.region_count().unwrap(), 1);
        assert!(regions.iter().all(|r| Arc::ptr_eq(r, &regions[0])));
    }

    #[test]
    fn test_racing_flushes_of_same_region() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(open_dir(tmp.path()));
        for i in 0..100 {
            dir.put(&live(format!("k{i:03}").as_bytes(), b"v", 1)).unwrap();
        }
        let region = dir.get_region(b"k000").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = Arc::clone(&dir);
                let region = Arc::clone(&region);
                thread::spawn(move || dir.flush_region(&region))
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => succeeded += 1,
                Err(DirectoryError::RegionRetired(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(dir.region_count().unwrap(), 1);
        assert_eq!(files_in(tmp.path()).len(), 1);
        assert_eq!(dir.stats().unwrap().disk_records, 100);
    }
}

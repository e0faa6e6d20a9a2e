#[cfg(test)]
mod tests {
    use crate::directory::tests::helpers::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_first_lookup_creates_region() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path());
        assert_eq!(dir.region_count().unwrap(), 0);

        let region = dir.get_region(b"any").unwrap();
        assert_eq!(dir.region_count().unwrap(), 1);
        assert_eq!(files_in(tmp.path()), vec![region.id().to_string()]);

        let again = dir.get_region(b"other").unwrap();
        assert!(Arc::ptr_eq(&region, &again));
    }

    #[test]
    fn test_region_file_name_is_uuid() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path());

        let region = dir.create_region().unwrap();
        assert!(uuid::Uuid::parse_str(region.id()).is_ok(), "id: {}", region.id());
    }

    #[test]
    fn test_single_region_owns_whole_key_space() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "only", &[live(b"m", b"1", 1)]);
        let dir = open_dir(tmp.path());

        // Keys below the start key still go to the single region.
        let region = dir.get_region(b"a").unwrap();
        assert_eq!(region.id(), "only");
        assert_eq!(dir.routing_anomalies(), 0);
    }

    #[test]
    fn test_floor_lookup_across_regions() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "r-a", &[live(b"a", b"1", 1), live(b"f", b"1", 1)]);
        seed_file(tmp.path(), "r-g", &[live(b"g", b"1", 1), live(b"p", b"1", 1)]);
        seed_file(tmp.path(), "r-q", &[live(b"q", b"1", 1)]);
        let dir = open_dir(tmp.path());

        assert_eq!(dir.get_region(b"a").unwrap().id(), "r-a");
        assert_eq!(dir.get_region(b"c").unwrap().id(), "r-a");
        assert_eq!(dir.get_region(b"g").unwrap().id(), "r-g");
        assert_eq!(dir.get_region(b"h").unwrap().id(), "r-g");
        assert_eq!(dir.get_region(b"zzz").unwrap().id(), "r-q");
        assert_eq!(dir.routing_anomalies(), 0);
    }

    #[test]
    fn test_floor_lookup_uses_signed_order() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "negative", &[live(&[0x80], b"1", 1)]);
        seed_file(tmp.path(), "positive", &[live(&[0x10], b"1", 1)]);
        let dir = open_dir(tmp.path());

        // 0xF0 is negative as i8: above 0x80, below 0x10.
        assert_eq!(dir.get_region(&[0xF0]).unwrap().id(), "negative");
        assert_eq!(dir.get_region(&[0x20]).unwrap().id(), "positive");
    }

    #[test]
    fn test_key_below_every_start_is_anomaly() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "r-m", &[live(b"m", b"1", 1)]);
        seed_file(tmp.path(), "r-t", &[live(b"t", b"1", 1)]);
        let dir = open_dir(tmp.path());

        let region = dir.get_region(b"a").unwrap();
        assert_eq!(region.id(), "r-m", "falls back to the lowest region");
        assert_eq!(dir.routing_anomalies(), 1);
    }

    #[test]
    fn test_shared_start_key_is_anomaly() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "dup-1", &[live(b"k", b"1", 1)]);
        seed_file(tmp.path(), "dup-2", &[live(b"k", b"2", 1)]);
        let dir = open_dir(tmp.path());

        let region = dir.get_region(b"k").unwrap();
        assert_eq!(region.id(), "dup-1");
        assert!(dir.routing_anomalies() >= 1);
    }

    #[test]
    fn test_unindexed_regions_still_route() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path());
        dir.create_region().unwrap();
        dir.create_region().unwrap();

        // Neither region has a start key yet.
        let region = dir.get_region(b"k").unwrap();
        assert!(dir.regions().unwrap().iter().any(|r| Arc::ptr_eq(r, &region)));
        assert_eq!(dir.routing_anomalies(), 1);
    }

    #[test]
    fn test_index_follows_membership_changes() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "r-a", &[live(b"a", b"1", 1)]);
        seed_file(tmp.path(), "r-m", &[live(b"m", b"1", 1)]);
        let dir = open_dir(tmp.path());

        let upper = dir.get_region(b"x").unwrap();
        assert_eq!(upper.id(), "r-m");

        // Retire the upper region; its keys now route to the lower one.
        dir.destroy_region(&upper).unwrap();
        let region = dir.get_region(b"x").unwrap();
        assert_eq!(region.id(), "r-a");
    }

    #[test]
    fn test_put_and_get_route_to_owner() {
        let tmp = TempDir::new().unwrap();
        seed_file(tmp.path(), "r-a", &[live(b"a", b"1", 1)]);
        seed_file(tmp.path(), "r-m", &[live(b"m", b"1", 1)]);
        let dir = open_dir(tmp.path());

        assert!(dir.put(&live(b"c", b"low", 1)).unwrap());
        assert!(dir.put(&live(b"q", b"high", 1)).unwrap());

        let lower = dir.get_region(b"a").unwrap();
        let upper = dir.get_region(b"m").unwrap();
        assert_eq!(lower.get(b"c").unwrap().unwrap().value(), b"low");
        assert_eq!(upper.get(b"q").unwrap().unwrap().value(), b"high");
        assert_eq!(dir.get(b"q").unwrap().unwrap().value(), b"high");
    }

    #[test]
    fn test_empty_index_rebuilt_after_first_write() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path());
        let first = dir.create_region().unwrap();
        dir.create_region().unwrap();

        // No start keys yet: the first put falls back and is counted.
        dir.put(&live(b"m", b"1", 1)).unwrap();
        assert_eq!(dir.routing_anomalies(), 1);
        assert_eq!(first.start_key(), Some(b"m".to_vec()));

        // Same generation, but "m" is now a start key to floor to.
        for key in [b"n", b"o", b"p"] {
            dir.put(&live(key, b"1", 1)).unwrap();
            assert!(Arc::ptr_eq(&dir.get_region(key).unwrap(), &first));
        }
        assert_eq!(dir.routing_anomalies(), 1);
        assert_eq!(first.memstore_len().unwrap(), 4);
    }
}

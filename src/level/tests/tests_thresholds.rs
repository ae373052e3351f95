#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::level::{Level, LevelThresholds};
    use crate::record::{Key, Record};
    use crate::segment::{Segment, SegmentWriter};
    use tempfile::TempDir;

    fn thresholds() -> LevelThresholds {
        // Reference values: 5 files × 4 KiB at level 0, doubling per level.
        LevelThresholds::new(5, 4096, 2)
    }

    fn segment(dir: &std::path::Path, level: usize, key: &[u8], value: &[u8]) -> Arc<Segment> {
        let mut writer = SegmentWriter::create(dir, level).unwrap();
        writer
            .append_record(&Record {
                key: Key::from(key),
                value: value.to_vec(),
                last_modified: 1,
            })
            .unwrap();
        let mut seg = writer.finish().unwrap();
        seg.finalize().unwrap();
        Arc::new(seg)
    }

    #[test]
    fn test_geometric_growth() {
        let t = thresholds();

        assert_eq!(t.max_files(0), 5);
        assert_eq!(t.max_files(1), 10);
        assert_eq!(t.max_files(2), 20);

        assert_eq!(t.max_file_size(0), 4096);
        assert_eq!(t.max_file_size(1), 8192);

        assert_eq!(t.max_total_bytes(0), 5 * 4096);
        assert_eq!(t.max_total_bytes(1), 10 * 8192);
    }

    #[test]
    fn test_needs_compaction_by_file_count() {
        let tmp = TempDir::new().unwrap();
        let t = LevelThresholds::new(2, 1 << 30, 2);
        let mut level = Level::new(0);

        level.insert(segment(tmp.path(), 0, b"a", b"1"));
        level.insert(segment(tmp.path(), 0, b"b", b"2"));
        assert!(!level.needs_compaction(&t));

        level.insert(segment(tmp.path(), 0, b"c", b"3"));
        assert!(level.needs_compaction(&t));
    }

    #[test]
    fn test_needs_compaction_by_total_bytes() {
        let tmp = TempDir::new().unwrap();
        // Generous file count, tiny byte allowance.
        let t = LevelThresholds::new(100, 1, 2);
        let mut level = Level::new(0);
        assert!(!level.needs_compaction(&t));

        level.insert(segment(tmp.path(), 0, b"a", b"payload that outgrows the allowance"));
        assert!(level.needs_compaction(&t));
    }

    #[test]
    fn test_insert_orders_newest_first() {
        let tmp = TempDir::new().unwrap();
        let older = segment(tmp.path(), 0, b"a", b"1");
        let newer = segment(tmp.path(), 0, b"b", b"2");

        // Insert out of order; the level must sort by recency regardless.
        let mut level = Level::new(0);
        level.insert(Arc::clone(&older));
        level.insert(Arc::clone(&newer));

        assert!(level.segments()[0].created() > level.segments()[1].created());

        let mut reversed = Level::new(0);
        reversed.insert(Arc::clone(&newer));
        reversed.insert(Arc::clone(&older));
        assert!(reversed.segments()[0].created() > reversed.segments()[1].created());
    }

    #[test]
    fn test_remove_by_identity() {
        let tmp = TempDir::new().unwrap();
        let keep = segment(tmp.path(), 0, b"a", b"1");
        let drop_me = segment(tmp.path(), 0, b"b", b"2");

        let mut level = Level::new(0);
        level.insert(Arc::clone(&keep));
        level.insert(Arc::clone(&drop_me));

        level.remove(&[drop_me]);
        assert_eq!(level.file_count(), 1);
        assert!(Arc::ptr_eq(&level.segments()[0], &keep));
    }

    #[test]
    fn test_total_bytes_sums_segments() {
        let tmp = TempDir::new().unwrap();
        let a = segment(tmp.path(), 1, b"a", b"aaaa");
        let b = segment(tmp.path(), 1, b"b", b"bbbb");
        let expected = a.size_bytes() + b.size_bytes();

        let mut level = Level::new(1);
        level.insert(a);
        level.insert(b);
        assert_eq!(level.total_bytes(), expected);
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConfig, SEGMENT_DIR};
    use tempfile::TempDir;

    /// One file allowed per level: every second flush makes level 0
    /// compactable, and `multiplier: 1` keeps upper levels just as tight
    /// so cascades are easy to provoke.
    fn tight_config() -> EngineConfig {
        EngineConfig {
            write_buffer_size: 256,
            level0_file_count: 1,
            level0_file_size: 1024 * 1024,
            level_multiplier: 1,
            max_levels: 5,
            wal_max_bytes: 1024 * 1024,
        }
    }

    /// Writes `tag`-prefixed keys until the memtable rotates (leaving the
    /// active buffer empty), flushes the frozen generation into exactly
    /// one level-0 segment, and returns the keys written.
    fn flush_batch(engine: &Engine, tag: u32) -> Vec<String> {
        let mut keys = Vec::new();
        for i in 0.. {
            let key = format!("{tag:02}-key-{i:02}");
            let (_, rotated) = engine.set(key.as_bytes(), &[b'v'; 32]).unwrap();
            keys.push(key);
            if rotated {
                break;
            }
        }
        while engine.flush_oldest_frozen().unwrap() {}
        keys
    }

    fn level_counts(engine: &Engine) -> Vec<usize> {
        engine
            .stats()
            .unwrap()
            .levels
            .iter()
            .map(|l| l.file_count)
            .collect()
    }

    fn assert_all_readable(engine: &Engine, keys: &[String]) {
        for key in keys {
            assert_eq!(
                engine.get(key.as_bytes()).unwrap().value,
                &[b'v'; 32],
                "{key} lost"
            );
        }
    }

    #[test]
    fn test_compaction_moves_level0_to_level1() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), tight_config()).unwrap();

        flush_batch(&engine, 0);
        flush_batch(&engine, 1);
        assert_eq!(level_counts(&engine)[0], 2);

        assert!(engine.compact_once().unwrap());

        let counts = level_counts(&engine);
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 1);
    }

    #[test]
    fn test_reads_survive_compaction() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), tight_config()).unwrap();

        let mut keys = flush_batch(&engine, 0);
        keys.extend(flush_batch(&engine, 1));
        engine.compact_once().unwrap();

        assert_all_readable(&engine, &keys);
    }

    #[test]
    fn test_newer_flush_wins_after_compaction() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), tight_config()).unwrap();

        // Same key in both generations with different values; the newer
        // segment's version must survive the merge.
        engine.set(b"contested", b"old").unwrap();
        flush_batch(&engine, 0);
        engine.set(b"contested", b"new").unwrap();
        flush_batch(&engine, 1);

        engine.compact_once().unwrap();
        assert_eq!(engine.get(b"contested").unwrap().value, b"new");
    }

    #[test]
    fn test_consumed_segment_files_are_deleted() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), tight_config()).unwrap();

        flush_batch(&engine, 0);
        flush_batch(&engine, 1);
        engine.compact_once().unwrap();

        // Exactly one finalized pair remains (the merged level-1 segment).
        let seg_dir = tmp.path().join(SEGMENT_DIR);
        let names: Vec<String> = std::fs::read_dir(&seg_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        let idx: Vec<_> = names.iter().filter(|n| n.ends_with(".idx")).collect();
        let dat: Vec<_> = names.iter().filter(|n| n.ends_with(".dat")).collect();
        assert_eq!(idx.len(), 1, "files on disk: {names:?}");
        assert_eq!(dat.len(), 1, "files on disk: {names:?}");
        assert!(idx[0].starts_with("seg-1-"));
    }

    #[test]
    fn test_compaction_cascades_upward() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), tight_config()).unwrap();

        // First pass parks one segment at level 1.
        let mut keys = flush_batch(&engine, 0);
        keys.extend(flush_batch(&engine, 1));
        engine.compact_once().unwrap();
        assert_eq!(level_counts(&engine)[1], 1);

        // Two more flushes overflow level 0 again; merging them into
        // level 1 gives it two files, over its one-file allowance, so the
        // same pass must cascade into level 2.
        keys.extend(flush_batch(&engine, 2));
        keys.extend(flush_batch(&engine, 3));
        engine.compact_once().unwrap();

        let counts = level_counts(&engine);
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 0);
        assert_eq!(counts[2], 1);

        assert_all_readable(&engine, &keys);
    }

    #[test]
    fn test_top_level_never_compacts() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(
            tmp.path(),
            EngineConfig {
                max_levels: 2,
                ..tight_config()
            },
        )
        .unwrap();

        // Three rounds of two flushes: level 1 (the top) accumulates
        // segments beyond its nominal allowance and must be left alone.
        let mut keys = Vec::new();
        for round in 0..3u32 {
            keys.extend(flush_batch(&engine, round * 2));
            keys.extend(flush_batch(&engine, round * 2 + 1));
            engine.compact_once().unwrap();
        }

        let counts = level_counts(&engine);
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 3);
        assert_all_readable(&engine, &keys);
    }

    #[test]
    fn test_compaction_with_nothing_to_do() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), tight_config()).unwrap();

        assert!(!engine.compact_once().unwrap());

        flush_batch(&engine, 0);
        // One segment at level 0 is within the one-file allowance.
        assert!(!engine.compact_once().unwrap());
    }
}

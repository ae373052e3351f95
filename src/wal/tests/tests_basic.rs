#[cfg(test)]
mod tests {
    use crate::record::{Key, Record};
    use crate::wal::{self, Wal};
    use tempfile::TempDir;

    fn record(key: &[u8], value: &[u8], ts: u64) -> Record {
        Record {
            key: Key::from(key),
            value: value.to_vec(),
            last_modified: ts,
        }
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::create(tmp.path()).unwrap();

        let records = vec![
            record(b"a", b"1", 10),
            record(b"b", b"2", 20),
            record(b"c", b"", 30),
        ];
        for r in &records {
            wal.append(&r.encode().unwrap()).unwrap();
        }
        let path = wal.path().to_path_buf();
        drop(wal);

        let replayed: Vec<_> = wal::replay(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(replayed, records);
    }

    #[test]
    fn test_replay_empty_file() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::create(tmp.path()).unwrap();
        let path = wal.path().to_path_buf();
        drop(wal);

        assert_eq!(wal::replay(&path).unwrap().count(), 0);
    }

    #[test]
    fn test_size_tracks_frames() {
        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::create(tmp.path()).unwrap();
        assert_eq!(wal.size(), 0);

        let bytes = record(b"key", b"value", 1).encode().unwrap();
        wal.append(&bytes).unwrap();
        assert_eq!(wal.size(), 4 + bytes.len() as u64);

        wal.append(&bytes).unwrap();
        assert_eq!(wal.size(), 2 * (4 + bytes.len() as u64));

        // The tracked size matches the bytes actually on disk.
        let on_disk = std::fs::metadata(wal.path()).unwrap().len();
        assert_eq!(wal.size(), on_disk);
    }

    #[test]
    fn test_replay_preserves_append_order() {
        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::create(tmp.path()).unwrap();

        // Same key overwritten repeatedly: replay order is append order,
        // so the last version must come out last.
        for ts in 1..=5u64 {
            wal.append(&record(b"k", &ts.to_le_bytes(), ts).encode().unwrap())
                .unwrap();
        }
        let path = wal.path().to_path_buf();
        drop(wal);

        let replayed: Vec<_> = wal::replay(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let timestamps: Vec<u64> = replayed.iter().map(|r| r.last_modified).collect();
        assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_replay_does_not_modify_file() {
        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::create(tmp.path()).unwrap();
        wal.append(&record(b"a", b"1", 1).encode().unwrap()).unwrap();
        let path = wal.path().to_path_buf();
        drop(wal);

        let before = std::fs::metadata(&path).unwrap().len();
        let _ = wal::replay(&path).unwrap().count();
        let after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(before, after);
    }
}

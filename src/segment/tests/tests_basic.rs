#[cfg(test)]
mod tests {
    use crate::record::{Key, Record};
    use crate::segment::{Segment, SegmentWriter};
    use tempfile::TempDir;

    fn record(key: &[u8], value: &[u8]) -> Record {
        Record {
            key: Key::from(key),
            value: value.to_vec(),
            last_modified: 42,
        }
    }

    fn write_segment(dir: &std::path::Path, level: usize, records: &[Record]) -> Segment {
        let mut writer = SegmentWriter::create(dir, level).unwrap();
        for r in records {
            writer.append_record(r).unwrap();
        }
        let mut segment = writer.finish().unwrap();
        segment.finalize().unwrap();
        segment
    }

    #[test]
    fn test_write_then_search_every_key() {
        let tmp = TempDir::new().unwrap();
        let records: Vec<_> = (0..50u32)
            .map(|i| record(format!("key-{i:04}").as_bytes(), format!("value-{i}").as_bytes()))
            .collect();

        let segment = write_segment(tmp.path(), 0, &records);

        assert_eq!(segment.len(), 50);
        for r in &records {
            let found = segment.search(r.key.as_bytes()).unwrap().unwrap();
            assert_eq!(found, *r);
        }
    }

    #[test]
    fn test_search_missing_key() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(tmp.path(), 0, &[record(b"present", b"v")]);

        assert!(segment.search(b"absent").unwrap().is_none());
        assert!(segment.search(b"presen").unwrap().is_none());
        assert!(segment.search(b"presentx").unwrap().is_none());
    }

    #[test]
    fn test_reopen_round_trip() {
        let tmp = TempDir::new().unwrap();
        let records = vec![
            record(b"a", b"1"),
            record(b"b", b""),
            record(b"c", b"3"),
        ];
        let written = write_segment(tmp.path(), 2, &records);
        let (secs, nanos) = written.created();
        drop(written);

        let reopened = Segment::open(tmp.path(), 2, secs, nanos).unwrap();
        assert_eq!(reopened.level(), 2);
        assert_eq!(reopened.len(), 3);
        for r in &records {
            assert_eq!(reopened.search(r.key.as_bytes()).unwrap().unwrap(), *r);
        }
    }

    #[test]
    fn test_read_record_at_offsets() {
        let tmp = TempDir::new().unwrap();
        let records = vec![record(b"x", b"one"), record(b"y", b"two")];
        let segment = write_segment(tmp.path(), 0, &records);

        for (key, offset) in segment.index() {
            let decoded = segment.read_record_at(*offset).unwrap();
            assert_eq!(decoded.key, *key);
        }
    }

    #[test]
    fn test_raw_record_at_matches_decode() {
        let tmp = TempDir::new().unwrap();
        let records = vec![record(b"raw", b"payload"), record(b"raw2", b"payload2")];
        let segment = write_segment(tmp.path(), 0, &records);

        for offset in segment.index().values() {
            let raw = segment.raw_record_at(*offset).unwrap();
            let (decoded, consumed) = Record::decode(raw).unwrap();
            assert_eq!(consumed, raw.len());
            assert!(records.contains(&decoded));
        }
    }

    #[test]
    fn test_tombstone_round_trips_through_segment() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(tmp.path(), 0, &[record(b"deleted", b"")]);

        let found = segment.search(b"deleted").unwrap().unwrap();
        assert!(found.is_tombstone());
    }

    #[test]
    fn test_size_bytes_matches_data_file() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(tmp.path(), 0, &[record(b"k", b"some value")]);

        let on_disk = std::fs::metadata(segment.data_path()).unwrap().len();
        assert_eq!(segment.size_bytes(), on_disk);
        assert!(on_disk > 0);
    }
}

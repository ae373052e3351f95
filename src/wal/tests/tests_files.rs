#[cfg(test)]
mod tests {
    use crate::wal::{self, Wal};
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_list_files_sorts_oldest_first() {
        let tmp = TempDir::new().unwrap();
        for name in [
            "wal-1700000002.000000500.log",
            "wal-1700000001.999999999.log",
            "wal-1700000002.000000001.log",
        ] {
            File::create(tmp.path().join(name)).unwrap();
        }

        let files = wal::list_files(tmp.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "wal-1700000001.999999999.log",
                "wal-1700000002.000000001.log",
                "wal-1700000002.000000500.log",
            ]
        );
    }

    #[test]
    fn test_ordering_is_numeric_not_lexical() {
        let tmp = TempDir::new().unwrap();
        // Lexically "wal-9..." sorts after "wal-10...", numerically before.
        for name in ["wal-10.000000000.log", "wal-9.000000000.log"] {
            File::create(tmp.path().join(name)).unwrap();
        }

        let files = wal::list_files(tmp.path()).unwrap();
        let first = files[0].file_name().unwrap().to_str().unwrap();
        assert_eq!(first, "wal-9.000000000.log");
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        File::create(tmp.path().join("wal-1.000000000.log")).unwrap();
        File::create(tmp.path().join("notes.txt")).unwrap();
        File::create(tmp.path().join("wal-broken.log")).unwrap();

        let files = wal::list_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_created_files_are_discoverable() {
        let tmp = TempDir::new().unwrap();
        let first = Wal::create(tmp.path()).unwrap();
        let second = Wal::create(tmp.path()).unwrap();

        let files = wal::list_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 2);
        // Enumeration order is creation order.
        assert_eq!(files[0], first.path());
        assert_eq!(files[1], second.path());
    }
}

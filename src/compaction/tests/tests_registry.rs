#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::compaction::DeletionRegistry;

    #[test]
    fn test_mark_and_check() {
        let registry = DeletionRegistry::new();
        let path = PathBuf::from("/data/segments/seg-0-1.000000000.idx");

        assert!(!registry.is_marked(&path));
        registry.mark([path.clone()]);
        assert!(registry.is_marked(&path));
    }

    #[test]
    fn test_unmark_after_deletion() {
        let registry = DeletionRegistry::new();
        let path = PathBuf::from("/data/segments/seg-1-2.000000000.idx");

        registry.mark([path.clone()]);
        registry.unmark(&path);
        assert!(!registry.is_marked(&path));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_batch_marking() {
        let registry = DeletionRegistry::new();
        let paths: Vec<PathBuf> = (0..5)
            .map(|i| PathBuf::from(format!("seg-0-{i}.000000000.idx")))
            .collect();

        registry.mark(paths.clone());
        assert_eq!(registry.len(), 5);
        for p in &paths {
            assert!(registry.is_marked(p));
        }
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;

        let registry = Arc::new(DeletionRegistry::new());
        let path = PathBuf::from("seg-0-9.000000000.idx");

        let marker = {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            std::thread::spawn(move || registry.mark([path]))
        };
        marker.join().unwrap();

        assert!(registry.is_marked(&path));
    }
}

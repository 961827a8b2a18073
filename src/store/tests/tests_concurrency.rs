//! Shared use of one store from several threads.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::store::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn concurrent_writers_and_readers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(dir.path()));

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50u8 {
                        let key = format!("t{t}-{i}");
                        store.insert(&key, &[t, i, 0xAA], i64::from(i)).unwrap();
                        assert_eq!(store.get(&key).unwrap().unwrap(), vec![t, i, 0xAA]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len().unwrap(), 200);
        assert_eq!(store.get("t3-49").unwrap().unwrap(), vec![3, 49, 0xAA]);
        store.close().unwrap();

        let store = open_store(dir.path());
        assert!(store.recovery_report().unwrap().is_clean());
        assert_eq!(store.len().unwrap(), 200);
    }
}

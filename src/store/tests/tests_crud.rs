//! Key-level insert / get / update / append / delete through the store.

#[cfg(test)]
mod tests {
    use crate::data_file::DataFileError;
    use crate::store::tests::helpers::*;
    use crate::store::{GetAllOrder, KeyedRecordStore, StoreError};
    use tempfile::TempDir;

    // ----------------------------------------------------------------
    // Scenario
    // ----------------------------------------------------------------

    #[test]
    fn hello_world_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.insert("a", b"hello", 1).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.stats().unwrap().data.allocated_blocks, 1);
        let freed = store.location("a").unwrap().unwrap().data_location;

        store.append("a", b" world").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some(&b"hello world"[..]));
        assert_eq!(store.stats().unwrap().data.allocated_blocks, 1);

        assert!(store.delete("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.stats().unwrap().data.allocated_blocks, 0);

        store.insert("b", b"reuse", 2).unwrap();
        assert_eq!(store.location("b").unwrap().unwrap().data_location, freed);
    }

    // ----------------------------------------------------------------
    // Insert / update
    // ----------------------------------------------------------------

    #[test]
    fn insert_existing_key_replaces_payload_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.insert("k", b"first", 10).unwrap();
        let location = store.location("k").unwrap().unwrap();
        store.insert("k", b"second, and much longer than one block", 20).unwrap();

        assert_eq!(
            store.get("k").unwrap().unwrap(),
            b"second, and much longer than one block"
        );
        assert_eq!(store.timestamp("k").unwrap(), Some(20));
        assert_eq!(store.location("k").unwrap().unwrap().data_location, location.data_location);
        let stats = store.stats().unwrap();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.index.record_count, 1);
        assert_eq!(stats.data.record_count, 1);
    }

    #[test]
    fn insert_blank_stores_zeros() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.insert_blank("z", 20, 1).unwrap();
        assert_eq!(store.get("z").unwrap().unwrap(), vec![0u8; 20]);
        assert_eq!(store.item_size("z").unwrap(), Some(20));
    }

    #[test]
    fn oversized_blank_lengths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        assert!(matches!(
            store.insert_blank("z", u32::MAX, 1),
            Err(StoreError::DataFile(DataFileError::InvalidArgument(_)))
        ));
        assert!(!store.contains_key("z").unwrap());

        store.insert("k", b"abc", 1).unwrap();
        assert!(matches!(
            store.append_blank("k", i32::MAX as u32),
            Err(StoreError::DataFile(DataFileError::InvalidArgument(_)))
        ));
        assert_eq!(store.get("k").unwrap().unwrap(), b"abc");
    }

    #[test]
    fn update_inserts_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.update("new", b"v1").unwrap();
        assert_eq!(store.get("new").unwrap().unwrap(), b"v1");
        store.update("new", b"v2").unwrap();
        assert_eq!(store.get("new").unwrap().unwrap(), b"v2");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn update_partial_reports_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        assert!(!store.update_partial("nope", b"x", 0).unwrap());

        store.insert("k", b"0123456789abcdefghij", 1).unwrap();
        assert!(store.update_partial("k", b"XYZ", 3).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap(), b"012XYZ6789abcdefghij");
    }

    #[test]
    fn append_inserts_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.append("log", b"one;").unwrap();
        store.append("log", b"two;").unwrap();
        store.append_blank("log", 2).unwrap();
        assert_eq!(store.get("log").unwrap().unwrap(), b"one;two;\0\0");
    }

    #[test]
    fn delete_partial_tail_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        assert!(!store.delete_partial_tail("k", 1).unwrap());
        assert!(!store.delete("k").unwrap());

        store.insert("k", b"keep-drop", 1).unwrap();
        assert!(store.delete_partial_tail("k", 5).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap(), b"keep");

        assert!(store.delete("k").unwrap());
        assert!(!store.contains_key("k").unwrap());
        let stats = store.stats().unwrap();
        assert_eq!(stats.index.record_count, 0);
        assert_eq!(stats.data.record_count, 0);
    }

    // ----------------------------------------------------------------
    // Reads
    // ----------------------------------------------------------------

    #[test]
    fn get_partial_and_multiple() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.insert("a", b"alphabet soup", 1).unwrap();
        store.insert("b", b"bravo", 2).unwrap();

        assert_eq!(store.get_partial("a", 5, 3).unwrap().unwrap(), b"bet");
        assert_eq!(store.get_partial("missing", 0, 1).unwrap(), None);

        let got = store.get_multiple(&["b", "missing", "a"]).unwrap();
        assert_eq!(
            got,
            vec![Some(b"bravo".to_vec()), None, Some(b"alphabet soup".to_vec())]
        );
    }

    #[test]
    fn get_all_orders() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.insert("c", b"3", 5).unwrap();
        store.insert("a", b"1", 9).unwrap();
        store.insert("b", b"2", 5).unwrap();

        let by_key: Vec<String> = store
            .get_all(GetAllOrder::Key)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(by_key, vec!["a", "b", "c"]);

        let by_time = store.get_all(GetAllOrder::Timestamp).unwrap();
        assert_eq!(
            by_time,
            vec![
                ("b".to_string(), b"2".to_vec()),
                ("c".to_string(), b"3".to_vec()),
                ("a".to_string(), b"1".to_vec()),
            ]
        );
        assert_eq!(store.keys().unwrap(), vec!["a", "b", "c"]);
    }

    // ----------------------------------------------------------------
    // Timestamps / persistence
    // ----------------------------------------------------------------

    #[test]
    fn touch_timestamp_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            store.insert("k", b"payload", 1).unwrap();
            assert!(store.touch_timestamp("k", 42).unwrap());
            assert!(!store.touch_timestamp("other", 42).unwrap());
            store.close().unwrap();
        }

        let store = open_store(dir.path());
        assert_eq!(store.timestamp("k").unwrap(), Some(42));
        assert_eq!(store.get("k").unwrap().unwrap(), b"payload");
    }

    #[test]
    fn keys_and_payloads_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let keys = ["plain", "ключ", "nul\0inside", "emoji 😀", ""];
        {
            let store = open_store(dir.path());
            for (i, key) in keys.iter().enumerate() {
                store.insert(key, &vec![i as u8 + 1; i * 11], i as i64).unwrap();
            }
            store.close().unwrap();
        }

        let store = open_store(dir.path());
        assert!(store.recovery_report().unwrap().is_clean());
        assert_eq!(store.len().unwrap(), keys.len());
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(store.get(key).unwrap().unwrap(), vec![i as u8 + 1; i * 11]);
            assert_eq!(store.timestamp(key).unwrap(), Some(i as i64));
        }
    }

    #[test]
    fn clear_all_empties_both_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        for i in 0..10 {
            store.insert(&format!("key-{i}"), &[i as u8; 40], i).unwrap();
        }
        store.clear_all().unwrap();

        assert!(store.is_empty().unwrap());
        let stats = store.stats().unwrap();
        assert_eq!(stats.index.record_count, 0);
        assert_eq!(stats.data.record_count, 0);
        assert_eq!(stats.data.block_capacity, 8);

        store.insert("again", b"x", 1).unwrap();
        assert_eq!(store.get("again").unwrap().unwrap(), b"x");
    }

    // ----------------------------------------------------------------
    // Closed / read-only
    // ----------------------------------------------------------------

    #[test]
    fn closed_store_rejects_everything() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        store.insert("k", b"v", 1).unwrap();

        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.get("k"), Err(StoreError::Closed)));
        assert!(matches!(store.insert("k", b"v", 1), Err(StoreError::Closed)));
        assert!(matches!(store.flush(), Err(StoreError::Closed)));
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            store.insert("k", b"v", 1).unwrap();
            store.close().unwrap();
        }

        let store =
            KeyedRecordStore::open(index_path(dir.path()), data_path(dir.path()), read_only_config())
                .unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"v");
        assert!(matches!(
            store.insert("k", b"w", 2),
            Err(StoreError::DataFile(DataFileError::ReadOnly))
        ));
        assert!(matches!(
            store.delete("k"),
            Err(StoreError::DataFile(DataFileError::ReadOnly))
        ));
        assert_eq!(store.get("k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn flush_and_write_times() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        store.insert("k", b"v", 1).unwrap();
        store.flush().unwrap();
        assert!(store.last_write().unwrap() <= std::time::SystemTime::now());
        assert!(store.last_modified().is_ok());
        assert!(!store.is_modified_externally().unwrap());
    }
}

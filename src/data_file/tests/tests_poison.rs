//! An I/O failure poisons the handle; reopening recovers.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::data_file::tests::helpers::*;
    use crate::data_file::{ChainedDataFile, DataFileError};
    use tempfile::TempDir;

    #[test]
    fn write_failure_poisons_every_later_call() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        {
            let mut file = ChainedDataFile::open(&path, small_config()).unwrap();
            file.insert(b"before").unwrap();
            file.close().unwrap();
        }

        let (mut file, fail) = open_flaky(&path, &small_config());
        assert_eq!(file.read(0).unwrap(), b"before");

        fail.store(true, Ordering::SeqCst);
        assert!(matches!(file.insert(b"lost"), Err(DataFileError::BlockStore(_))));
        assert!(file.is_poisoned());

        fail.store(false, Ordering::SeqCst);
        assert!(matches!(file.read(0), Err(DataFileError::Poisoned)));
        assert!(matches!(file.insert(b"x"), Err(DataFileError::Poisoned)));
        assert!(matches!(file.flush(), Err(DataFileError::Poisoned)));
        file.close().unwrap();

        let mut file = ChainedDataFile::open(&path, small_config()).unwrap();
        assert_eq!(file.start_blocks(), vec![0]);
        assert_eq!(file.read(0).unwrap(), b"before");
    }

    #[test]
    fn argument_errors_do_not_poison() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        ChainedDataFile::open(&path, small_config())
            .unwrap()
            .close()
            .unwrap();

        let (mut file, _fail) = open_flaky(&path, &small_config());
        let start = file.insert(b"abc").unwrap();
        assert!(file.delete_partial_tail(start, 10).is_err());
        assert!(file.read(start + 1).is_err());
        assert!(!file.is_poisoned());
        assert_eq!(file.read(start).unwrap(), b"abc");
    }

    #[test]
    fn failed_append_leaves_previous_content_recoverable() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        {
            let mut file = ChainedDataFile::open(&path, small_config()).unwrap();
            file.insert(b"0123456789").unwrap();
            file.close().unwrap();
        }

        let (mut file, fail) = open_flaky(&path, &small_config());
        fail.store(true, Ordering::SeqCst);
        assert!(file.append(0, &pattern(40, 1)).is_err());
        file.close().unwrap();

        let mut file = ChainedDataFile::open(&path, small_config()).unwrap();
        assert_eq!(file.read(0).unwrap(), b"0123456789");
    }
}

use std::collections::BTreeMap;

use crate::error::Result;
use crate::key::{extract_family, StoreKey};
use crate::mapfile::MapFileWriter;
use crate::storefile::StoreFile;

use super::{Store, FILTER_FILE_NAME};

/// Writes out the current memtable snapshot. Presumes `snapshot()` was
/// called earlier up the chain. On success the snapshot is cleared; on
/// error it survives, and the next flush retries it.
pub(super) fn flush_cache(store: &Store, log_seq_id: i64) -> Result<u64> {
    let snapshot = store.memtable.snapshot_handle();
    let entries = snapshot
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()));
    let flushed = internal_flush_cache(store, entries, log_seq_id)?;
    store.memtable.clear_snapshot(&snapshot)?;
    Ok(flushed)
}

/// Seals a sorted edit stream into a new store file tagged with
/// `log_seq_id` and installs it. Shared by the flusher and by recovery's
/// synthetic flush. Returns the number of bytes written.
pub(super) fn internal_flush_cache(
    store: &Store,
    entries: impl Iterator<Item = (StoreKey, Vec<u8>)>,
    log_seq_id: i64,
) -> Result<u64> {
    let mut entries = entries.peekable();
    if entries.peek().is_none() {
        return Ok(0);
    }

    // Serializes flush writers; reads and a concurrent compaction keep
    // going off the existing file set.
    let _flush = store.flush_lock.lock()?;

    let file = StoreFile::new(&store.config, store.next_file_id());
    let mut writer = MapFileWriter::create(file.mapfile_dir(), store.config.index_interval)?;
    let mut flushed = 0u64;
    let mut written = 0u64;
    for (key, value) in entries {
        if extract_family(&key.column) != store.config.family.name.as_slice() {
            continue;
        }
        flushed += writer.append(&key, &value)?;
        written += 1;
        if let Some(bloom) = &store.bloom {
            let mut probe = key.row.clone();
            probe.extend_from_slice(&key.column);
            bloom.lock()?.insert(&probe);
        }
    }
    writer.finish()?;

    // The file is current up to and including this log sequence id.
    file.write_info(log_seq_id)?;

    if let Some(bloom) = &store.bloom {
        let path = store.config.filter_dir().join(FILTER_FILE_NAME);
        bloom.lock()?.save(&path)?;
    }

    let mapfile = file.mapfile_dir().display().to_string();
    store.install_flushed(log_seq_id, file)?;
    tracing::debug!(
        store = %store.store_name(),
        mapfile = %mapfile,
        entries = written,
        sequence_id = log_seq_id,
        bytes = flushed,
        "added flushed store file"
    );
    Ok(flushed)
}

/// Memtable edits keyed and sorted for a synthetic flush during recovery.
pub(super) fn flush_sorted_cache(
    store: &Store,
    cache: BTreeMap<StoreKey, Vec<u8>>,
    log_seq_id: i64,
) -> Result<u64> {
    internal_flush_cache(store, cache.into_iter(), log_seq_id)
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use crate::config::{FamilyDescriptor, StoreConfig};
    use crate::error::Result;
    use crate::key::{StoreKey, LATEST_TIMESTAMP};
    use tempfile::{tempdir, TempDir};

    fn create_test_store(dir: &TempDir) -> Store {
        let config =
            StoreConfig::new(dir.path(), b"r1".to_vec(), "r1enc", FamilyDescriptor::new("info"));
        Store::open(config, None, None).expect("Failed to open store")
    }

    fn key(row: &[u8], ts: i64) -> StoreKey {
        StoreKey::new(row.to_vec(), b"info:c".to_vec(), ts)
    }

    #[test]
    fn test_flush_and_read_back() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = create_test_store(&dir);

        for i in 0..10 {
            store.add(key(format!("row_{i:03}").as_bytes(), 1), b"value".to_vec());
        }
        store.snapshot_memtable();
        let flushed = store.flush_cache(5)?;
        assert!(flushed > 0, "flush should report bytes written");
        assert_eq!(store.max_sequence_id(), 5);

        // Data must now come out of the store file.
        assert!(store.memtable.is_empty());
        for i in 0..10 {
            let probe = key(format!("row_{i:03}").as_bytes(), LATEST_TIMESTAMP);
            assert_eq!(store.get(&probe, 1)?, vec![b"value".to_vec()]);
        }
        Ok(())
    }

    #[test]
    fn test_flush_empty_snapshot_is_noop() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = create_test_store(&dir);

        store.snapshot_memtable();
        assert_eq!(store.flush_cache(5)?, 0);
        assert_eq!(store.max_sequence_id(), -1);
        Ok(())
    }

    #[test]
    fn test_flush_skips_foreign_family_columns() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = create_test_store(&dir);

        store.add(key(b"row", 1), b"mine".to_vec());
        store.add(
            StoreKey::new(b"row".to_vec(), b"other:c".to_vec(), 1),
            b"foreign".to_vec(),
        );
        store.snapshot_memtable();
        store.flush_cache(2)?;

        assert_eq!(store.get(&key(b"row", LATEST_TIMESTAMP), 1)?, vec![b"mine".to_vec()]);
        let foreign = StoreKey::new(b"row".to_vec(), b"other:c".to_vec(), LATEST_TIMESTAMP);
        assert!(store.get(&foreign, 1)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_repeated_snapshot_preserves_pending_flush() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = create_test_store(&dir);

        store.add(key(b"a", 1), b"v1".to_vec());
        store.snapshot_memtable();
        // A retried flush calls snapshot again; the pending one must
        // survive untouched.
        store.add(key(b"b", 1), b"v2".to_vec());
        store.snapshot_memtable();

        store.flush_cache(3)?;
        assert_eq!(store.get(&key(b"a", LATEST_TIMESTAMP), 1)?, vec![b"v1".to_vec()]);
        // The second write stayed in the memtable and flushes next round.
        store.snapshot_memtable();
        store.flush_cache(4)?;
        assert_eq!(store.get(&key(b"b", LATEST_TIMESTAMP), 1)?, vec![b"v2".to_vec()]);
        assert_eq!(store.max_sequence_id(), 4);
        Ok(())
    }

    #[test]
    fn test_sequence_ids_monotonic_in_install_order() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = create_test_store(&dir);

        for (seq, row) in [(2i64, b"a".as_slice()), (5, b"b"), (9, b"c")] {
            store.add(key(row, 1), b"v".to_vec());
            store.snapshot_memtable();
            store.flush_cache(seq)?;
        }
        let files = store.storefile_snapshot()?;
        let seqs: Vec<i64> = files.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![2, 5, 9], "file set must be ordered by sequence id");
        Ok(())
    }
}

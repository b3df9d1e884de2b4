//! Startup recovery from a reconstruction log.
//!
//! The hosting region hands the engine a segment of its write-ahead log
//! that may hold edits never flushed before the process died. The engine
//! does not own the log; it consumes an already-parsed stream of replay
//! records and rebuilds an in-memory cache of every edit newer than what
//! the on-disk file set already reflects, then seals that cache as a
//! synthetic flush tagged just past the log's highest sequence id.
//!
//! Records are framed as a big-endian `u32` length followed by a bincode
//! body. A clean end of file ends replay; an end of file in the middle of
//! a record means the tail of the log was lost, which is logged as data
//! loss while recovery keeps what it already has.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::{extract_family, StoreKey};

use super::{flush, Store};

/// Column carrying log-internal markers (cache-flush records and the
/// like); never a real cell, always skipped on replay.
pub const META_COLUMN: &[u8] = b"meta:";

/// One parsed write-ahead log edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub region: Vec<u8>,
    pub row: Vec<u8>,
    pub column: Vec<u8>,
    pub timestamp: i64,
    pub value: Vec<u8>,
    pub sequence: i64,
}

/// Sequential reader over a replay log.
pub struct ReplayStream {
    input: BufReader<File>,
    path: std::path::PathBuf,
    done: bool,
}

impl ReplayStream {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            input: BufReader::new(File::open(path)?),
            path: path.to_path_buf(),
            done: false,
        })
    }

    /// The next record, or `None` at the end of the stream. A truncated
    /// tail is logged as data loss and ends the stream early.
    pub fn next_record(&mut self) -> Result<Option<ReplayRecord>> {
        if self.done {
            return Ok(None);
        }
        let len = match self.input.read_u32::<BigEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut body = vec![0u8; len as usize];
        if let Err(e) = self.input.read_exact(&mut body) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                tracing::warn!(log = %self.path.display(),
                    "replay log ends mid-record; continuing, but the tail is DATA LOSS");
                self.done = true;
                return Ok(None);
            }
            return Err(e.into());
        }
        Ok(Some(bincode::deserialize(&body)?))
    }
}

/// Replays the reconstruction log into the store. Edits already reflected
/// by the file set (`sequence <= max_sequence_id`), edits for another
/// region, log meta markers, and foreign-family columns are all skipped.
/// Anything applied is sealed as a synthetic flush at `max seq in log + 1`.
pub(super) fn apply_reconstruction_log(
    store: &Store,
    path: &Path,
    reporter: Option<&dyn Fn()>,
) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if std::fs::metadata(path)?.len() == 0 {
        tracing::warn!(log = %path.display(), "reconstruction log is zero-length");
        return Ok(());
    }

    let max_seq_id = store.max_sequence_id();
    let mut stream = ReplayStream::open(path)?;
    let mut cache: BTreeMap<StoreKey, Vec<u8>> = BTreeMap::new();
    let mut max_seq_in_log = -1i64;
    let mut applied = 0usize;
    let mut skipped = 0usize;

    while let Some(record) = stream.next_record()? {
        max_seq_in_log = max_seq_in_log.max(record.sequence);
        if record.sequence <= max_seq_id {
            skipped += 1;
            continue;
        }
        // Check this edit is for us, and guard against log-internal meta
        // entries.
        if record.column.as_slice() == META_COLUMN
            || record.region != store.config.region_name
            || extract_family(&record.column) != store.config.family.name.as_slice()
        {
            continue;
        }
        cache.insert(
            StoreKey::new(record.row, record.column, record.timestamp),
            record.value,
        );
        applied += 1;
        // Tell the reporter we are making progress every so often; large
        // logs take minutes and the hosting process must heartbeat.
        if let Some(report) = reporter {
            if applied % store.config.report_interval.max(1) == 0 {
                report();
            }
        }
    }
    tracing::debug!(
        store = %store.store_name(),
        applied,
        skipped,
        max_seq_id,
        "applied reconstruction log"
    );

    if !cache.is_empty() {
        // A synthetic flush just past everything the log held.
        flush::flush_sorted_cache(store, cache, max_seq_in_log + 1)?;
    }
    Ok(())
}

/// Writes records in the stream framing. Production logs are written by
/// the region's log layer; this exists for tests.
#[cfg(test)]
pub(crate) fn write_replay_log(path: &Path, records: &[ReplayRecord]) -> Result<()> {
    use byteorder::WriteBytesExt;
    use std::io::Write;

    let mut out = std::io::BufWriter::new(File::create(path)?);
    for record in records {
        let body = bincode::serialize(record)?;
        out.write_u32::<BigEndian>(body.len() as u32)?;
        out.write_all(&body)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use super::*;
    use crate::config::{FamilyDescriptor, StoreConfig};
    use crate::key::LATEST_TIMESTAMP;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path(), b"r1".to_vec(), "r1enc", FamilyDescriptor::new("info"))
            .report_interval(2)
    }

    fn record(row: &[u8], seq: i64) -> ReplayRecord {
        ReplayRecord {
            region: b"r1".to_vec(),
            row: row.to_vec(),
            column: b"info:c".to_vec(),
            timestamp: 100 + seq,
            value: format!("v{seq}").into_bytes(),
            sequence: seq,
        }
    }

    #[test]
    fn test_replay_applies_new_edits() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let log = dir.path().join("reconstruction.log");
        write_replay_log(&log, &[record(b"a", 1), record(b"b", 2)])?;

        let store = Store::open(test_config(&dir), Some(&log), None)?;
        // Replay produced a synthetic flush at max-seq-in-log + 1.
        assert_eq!(store.max_sequence_id(), 3);
        assert_eq!(
            store.get(&StoreKey::new(b"a".to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP), 1)?,
            vec![b"v1".to_vec()]
        );
        assert_eq!(
            store.get(&StoreKey::new(b"b".to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP), 1)?,
            vec![b"v2".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_replay_skips_foreign_and_meta_records() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let log = dir.path().join("reconstruction.log");

        let mut foreign_region = record(b"x", 1);
        foreign_region.region = b"other".to_vec();
        let mut foreign_family = record(b"y", 2);
        foreign_family.column = b"other:c".to_vec();
        let mut meta = record(b"z", 3);
        meta.column = META_COLUMN.to_vec();
        write_replay_log(&log, &[foreign_region, foreign_family, meta, record(b"a", 4)])?;

        let store = Store::open(test_config(&dir), Some(&log), None)?;
        assert_eq!(
            store.get(&StoreKey::new(b"a".to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP), 1)?,
            vec![b"v4".to_vec()]
        );
        for row in [b"x".as_slice(), b"y", b"z"] {
            let probe = StoreKey::new(row.to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP);
            assert!(store.get(&probe, 1)?.is_empty(), "skipped record must not surface");
        }
        Ok(())
    }

    #[test]
    fn test_replay_skips_already_flushed_sequences() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");

        // First life: flush up to sequence 5.
        {
            let store = Store::open(test_config(&dir), None, None)?;
            store.add(StoreKey::new(b"old".to_vec(), b"info:c".to_vec(), 1), b"old".to_vec());
            store.snapshot_memtable();
            store.flush_cache(5)?;
            store.close()?;
        }

        // The log replays both a stale edit and a fresh one.
        let log = dir.path().join("reconstruction.log");
        let mut stale = record(b"stale", 4);
        stale.value = b"must-not-apply".to_vec();
        write_replay_log(&log, &[stale, record(b"fresh", 7)])?;

        let store = Store::open(test_config(&dir), Some(&log), None)?;
        let stale_probe = StoreKey::new(b"stale".to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP);
        assert!(store.get(&stale_probe, 1)?.is_empty());
        let fresh_probe = StoreKey::new(b"fresh".to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP);
        assert_eq!(store.get(&fresh_probe, 1)?, vec![b"v7".to_vec()]);
        assert_eq!(store.max_sequence_id(), 8);
        Ok(())
    }

    #[test]
    fn test_replay_tolerates_truncated_tail() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let log = dir.path().join("reconstruction.log");
        write_replay_log(&log, &[record(b"a", 1), record(b"b", 2)])?;

        // Chop the last record in half.
        let bytes = std::fs::read(&log)?;
        std::fs::write(&log, &bytes[..bytes.len() - 7])?;

        let store = Store::open(test_config(&dir), Some(&log), None)?;
        assert_eq!(
            store.get(&StoreKey::new(b"a".to_vec(), b"info:c".to_vec(), LATEST_TIMESTAMP), 1)?,
            vec![b"v1".to_vec()],
            "records before the truncation point must survive"
        );
        Ok(())
    }

    #[test]
    fn test_replay_reports_progress() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let log = dir.path().join("reconstruction.log");
        let records: Vec<ReplayRecord> =
            (1..=10).map(|i| record(format!("row{i}").as_bytes(), i)).collect();
        write_replay_log(&log, &records)?;

        let calls = AtomicUsize::new(0);
        let report = || {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        let _store = Store::open(test_config(&dir), Some(&log), Some(&report))?;
        // report_interval is 2, so 10 applied edits report five times.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        Ok(())
    }
}

//! Multi-way merge compaction.
//!
//! Several store files are merged into one, newest first. Because the
//! composite key order ranks versions of one cell newest first, a single
//! forward merge can enforce the family's version ceiling and apply
//! tombstones in one pass: every occurrence of a `(row, column)` pair
//! consumes a version slot, tombstones record themselves into the per-row
//! delete set and are dropped, and anything a recorded tombstone covers is
//! dropped too.
//!
//! The output is staged under `compaction.dir/` and only renamed into the
//! live directory once fully written; replaced files are deleted last,
//! after observers re-seated their cursors onto the new file.

use std::collections::HashMap;
use std::fs;

use crate::error::Result;
use crate::key::{is_tombstone, StoreKey};
use crate::mapfile::{MapFileReader, MapFileWriter};
use crate::storefile::StoreFile;

use super::{FileSet, Store};

/// The narrow reader capability the compactor consumes. Today every source
/// is a map file; future reader kinds only need `next` and `reset`.
pub trait CompactionSource {
    fn next(&mut self) -> Result<Option<(StoreKey, Vec<u8>)>>;
    fn reset(&mut self) -> Result<()>;
}

impl CompactionSource for MapFileReader {
    fn next(&mut self) -> Result<Option<(StoreKey, Vec<u8>)>> {
        MapFileReader::next(self)
    }

    fn reset(&mut self) -> Result<()> {
        MapFileReader::reset(self);
        Ok(())
    }
}

/// Compacts the store's files into one. This can take a while, so the
/// calling thread must be able to block; reads and flushes proceed as
/// usual meanwhile (a flush publishes a file with a newer sequence id,
/// which this compaction does not touch). Returns whether a compaction
/// actually ran.
pub(super) fn compact(store: &Store, force: bool) -> Result<bool> {
    // One compaction at a time per engine.
    let _compacting = store.compact_lock.lock()?;

    // Oldest first out of the file set; merge wants newest first.
    let mut files = store.storefile_snapshot()?;
    if files.is_empty() {
        return Ok(false);
    }
    let has_references = files.iter().any(|(_, f)| f.is_reference());
    if !force && !has_references && files.len() < store.config.compaction_threshold {
        return Ok(false);
    }
    files.reverse();

    let staging_dir = store.config.compaction_dir();
    fs::create_dir_all(&staging_dir)?;

    let out_id = store.next_file_id();
    let staged_mapfile = staging_dir.join(out_id.to_string());
    tracing::debug!(
        store = %store.store_name(),
        files = files.len(),
        out = %staged_mapfile.display(),
        "started compaction"
    );

    // Open a fresh reader per input, independent of the engine's cached
    // readers: this iteration pattern would wreck their seek state.
    let mut sources: Vec<Box<dyn CompactionSource>> = Vec::with_capacity(files.len());
    for (_, file) in &files {
        match file.open_reader() {
            Ok(reader) => sources.push(Box::new(reader)),
            Err(e) => {
                tracing::warn!(store = %store.store_name(), file = %file.name(), error = %e,
                    "failed opening compaction reader");
                return Err(e);
            }
        }
    }

    let mut writer = MapFileWriter::create(&staged_mapfile, store.config.index_interval)?;
    let entries = merge(
        &mut sources,
        &mut writer,
        store.config.family.max_versions as u64,
        store,
    )?;
    writer.finish()?;

    // The new file reflects the highest sequence id among its inputs.
    let max_seq_id = files.iter().map(|(seq, _)| *seq).max().unwrap_or(-1);
    let replaced: Vec<i64> = files.iter().map(|(seq, _)| *seq).collect();

    complete_compaction(store, replaced, out_id, max_seq_id)?;
    tracing::debug!(
        store = %store.store_name(),
        entries,
        sequence_id = max_seq_id,
        "completed compaction"
    );
    Ok(true)
}

/// Advances all sources in parallel, always consuming the smallest key.
/// At equal keys the source opened from the newest file is consumed first,
/// so its value is the one that survives.
fn merge(
    sources: &mut [Box<dyn CompactionSource>],
    writer: &mut MapFileWriter,
    max_versions: u64,
    store: &Store,
) -> Result<u64> {
    let mut slots: Vec<Option<(StoreKey, Vec<u8>)>> = Vec::with_capacity(sources.len());
    for source in sources.iter_mut() {
        source.reset()?;
        slots.push(source.next()?);
    }

    let mut times_seen = 0u64;
    let mut last_cell: Option<(Vec<u8>, Vec<u8>)> = None;
    let mut last_row: Option<Vec<u8>> = None;
    let mut last_emitted: Option<StoreKey> = None;
    // Per-row tombstones: column to the newest deleting timestamp, which
    // shadows everything at or below it.
    let mut deletes: HashMap<Vec<u8>, i64> = HashMap::new();
    let mut written = 0u64;

    loop {
        // Pick the smallest current key; at ties the strict comparison
        // keeps the earlier slot, which is the newest source.
        let mut smallest: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            let Some((key, _)) = slot else { continue };
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    let (best, _) = slots[s].as_ref().unwrap();
                    if key < best {
                        smallest = Some(i);
                    }
                }
            }
        }
        let Some(chosen) = smallest else { break };
        let (key, value) = slots[chosen].take().unwrap();

        if last_cell
            .as_ref()
            .is_some_and(|(row, col)| *row == key.row && *col == key.column)
        {
            times_seen += 1;
        } else {
            times_seen = 1;
        }
        if last_row.as_deref() != Some(key.row.as_slice()) {
            deletes.clear();
        }

        let dead = if deletes.get(&key.column).is_some_and(|&ts| key.timestamp <= ts) {
            true
        } else if is_tombstone(&value) {
            let recorded = deletes.entry(key.column.clone()).or_insert(key.timestamp);
            if *recorded < key.timestamp {
                *recorded = key.timestamp;
            }
            true
        } else {
            false
        };
        // At exactly equal keys the newer source already emitted; the rest
        // are duplicates that only consume their version slot.
        let duplicate = last_emitted.as_ref() == Some(&key);

        if !dead
            && !duplicate
            && times_seen <= max_versions
            && !key.row.is_empty()
            && !key.column.is_empty()
        {
            writer.append(&key, &value)?;
            written += 1;
            if let Some(bloom) = &store.bloom {
                let mut probe = key.row.clone();
                probe.extend_from_slice(&key.column);
                bloom.lock()?.insert(&probe);
            }
            last_emitted = Some(key.clone());
        }

        last_cell = Some((key.row.clone(), key.column.clone()));
        last_row = Some(key.row.clone());

        slots[chosen] = sources[chosen].next()?;
    }
    Ok(written)
}

/// Moves a finished compaction into place. Under the engine write lock the
/// staged output is renamed into the live directory, replaced readers are
/// dropped, and the new file and reader are installed; observers are then
/// notified, and only after that are the replaced payloads deleted, so
/// in-flight scanners can re-seat themselves onto the new file before the
/// old ones disappear.
fn complete_compaction(
    store: &Store,
    replaced: Vec<i64>,
    out_id: u64,
    max_seq_id: i64,
) -> Result<()> {
    let staged_mapfile = store.config.compaction_dir().join(out_id.to_string());
    let final_file = StoreFile::new(&store.config, out_id);

    let mut to_delete: Vec<StoreFile> = Vec::new();
    {
        let mut files = store.files.write()?;

        fs::rename(&staged_mapfile, final_file.mapfile_dir())?;
        final_file.write_info(max_seq_id)?;
        let reader = final_file.open_reader()?;

        let FileSet { storefiles, readers } = &mut *files;
        for seq in &replaced {
            readers.remove(seq);
            if let Some(file) = storefiles.remove(seq) {
                to_delete.push(file);
            }
        }
        readers.insert(max_seq_id, std::sync::Arc::new(std::sync::Mutex::new(reader)));
        storefiles.insert(max_seq_id, final_file);
    }
    store.bump_max_sequence_id(max_seq_id);

    // Observer notification precedes deletion.
    store.notify_changed_reader_observers()?;

    for file in to_delete {
        if let Err(e) = file.delete() {
            tracing::warn!(store = %store.store_name(), file = %file.name(), error = %e,
                "failed deleting replaced store file");
        }
    }
    Ok(())
}

//! The per-column-family store engine.
//!
//! A store owns the memory/file hierarchy for one column family of one
//! region: the [`MemTable`] absorbing writes, the ordered set of immutable
//! store files keyed by sequence id, the flusher sealing snapshots into new
//! files, the compactor merging accumulated files, and the unified read
//! path that merges all layers newest-first.
//!
//! Locking and transactions are handled at a higher level; the hosting
//! region manager supplies row locks, batches, and the write-ahead log
//! stream. This engine only consumes an already-parsed replay stream on
//! startup and reports the sequence id its files reflect.

pub mod compaction;
pub mod flush;
pub mod recovery;
pub mod scanner;

pub use recovery::ReplayRecord;
pub use scanner::{RowFilter, StoreScanner};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::config::StoreConfig;
use crate::errinput;
use crate::error::Result;
use crate::filter::BloomFilter;
use crate::key::{is_tombstone, StoreKey, StrippedKey};
use crate::mapfile::MapFileReader;
use crate::memtable::{apply_row_candidate, MemTable};
use crate::storefile::{load_store_files, StoreFile};

const FILTER_FILE_NAME: &str = "filter";

/// A subscriber that must re-seat its cursors when the set of open readers
/// changes (flush install, compaction commit). May be called from any
/// thread. No store file is deleted before all registered observers have
/// been notified.
pub trait ChangedReadersObserver: Send + Sync {
    fn update_readers(&self) -> Result<()>;
}

/// The ordered file set: store files and their open readers, both keyed by
/// sequence id, oldest first. Guarded by the engine lock; readers hold it
/// shared, flush and compaction installs hold it exclusive.
pub(crate) struct FileSet {
    pub storefiles: BTreeMap<i64, StoreFile>,
    pub readers: BTreeMap<i64, Arc<Mutex<MapFileReader>>>,
}

/// Sizes of the store, for split decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSize {
    pub aggregate: u64,
    pub largest: u64,
    pub splittable: bool,
    /// Middle row of the largest splittable file, when one exists.
    pub mid_key: Option<Vec<u8>>,
}

pub struct Store {
    pub(crate) config: StoreConfig,
    name: String,
    pub(crate) memtable: MemTable,
    pub(crate) files: RwLock<FileSet>,
    max_seq_id: AtomicI64,
    next_file_id: AtomicU64,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) compact_lock: Mutex<()>,
    observers: Mutex<Vec<Weak<dyn ChangedReadersObserver>>>,
    pub(crate) bloom: Option<Mutex<BloomFilter>>,
}

impl Store {
    /// Opens the store: creates the directory layout, loads and checks the
    /// on-disk file set, replays unflushed edits from the reconstruction
    /// log if one is supplied, and opens a reader per file.
    ///
    /// `reporter`, when given, is invoked periodically while replay makes
    /// progress so the hosting process can heartbeat.
    pub fn open(
        config: StoreConfig,
        reconstruction_log: Option<&Path>,
        reporter: Option<&dyn Fn()>,
    ) -> Result<Store> {
        fs::create_dir_all(config.map_dir())?;
        fs::create_dir_all(config.info_dir())?;
        // A compaction that died mid-flight leaves staging output behind.
        if config.compaction_dir().exists() {
            fs::remove_dir_all(config.compaction_dir())?;
        }

        let name = format!(
            "{}/{}",
            config.region_encoded,
            String::from_utf8_lossy(&config.family.name)
        );

        let bloom = match &config.family.bloom {
            Some(bloom_config) => {
                fs::create_dir_all(config.filter_dir())?;
                let path = config.filter_dir().join(FILTER_FILE_NAME);
                let filter = match BloomFilter::load(&path) {
                    Ok(Some(filter)) => {
                        tracing::debug!(store = %name, "loaded bloom filter");
                        filter
                    }
                    Ok(None) => BloomFilter::new(bloom_config),
                    Err(e) => {
                        tracing::warn!(store = %name, error = %e,
                            "bloom filter unreadable, starting fresh");
                        BloomFilter::new(bloom_config)
                    }
                };
                Some(Mutex::new(filter))
            }
            None => None,
        };

        let loaded = load_store_files(&config)?;
        let max_seq_id = loaded.iter().map(|(seq, _)| *seq).max().unwrap_or(-1);
        let next_file_id = loaded.iter().map(|(_, file)| file.id() + 1).max().unwrap_or(0);
        let mut storefiles = BTreeMap::new();
        for (seq, file) in loaded {
            storefiles.insert(seq, file);
        }
        tracing::debug!(store = %name, files = storefiles.len(), max_seq_id, "loaded store files");

        let store = Store {
            config,
            name,
            memtable: MemTable::new(),
            files: RwLock::new(FileSet { storefiles, readers: BTreeMap::new() }),
            max_seq_id: AtomicI64::new(max_seq_id),
            next_file_id: AtomicU64::new(next_file_id),
            flush_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
            bloom,
        };

        if let Some(log) = reconstruction_log {
            recovery::apply_reconstruction_log(&store, log, reporter)?;
        }

        // Finally, open readers for everything loaded. Recovery's synthetic
        // flush installed its own reader already. A file whose header turns
        // out to be garbage is dropped rather than refusing the whole
        // store.
        {
            let mut files = store.files.write()?;
            let FileSet { storefiles, readers } = &mut *files;
            let mut unreadable = Vec::new();
            for (seq, file) in storefiles.iter() {
                if readers.contains_key(seq) {
                    continue;
                }
                match file.open_reader() {
                    Ok(reader) => {
                        readers.insert(*seq, Arc::new(Mutex::new(reader)));
                    }
                    Err(e) => {
                        tracing::warn!(store = %store.name, file = %file.name(), error = %e,
                            "skipping unreadable store file. Probable data loss");
                        unreadable.push(*seq);
                    }
                }
            }
            for seq in unreadable {
                storefiles.remove(&seq);
            }
        }
        Ok(store)
    }

    pub(crate) fn store_name(&self) -> &str {
        &self.name
    }

    /// Highest sequence id reflected by the on-disk file set, or -1.
    pub fn max_sequence_id(&self) -> i64 {
        self.max_seq_id.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_max_sequence_id(&self, sequence_id: i64) {
        self.max_seq_id.fetch_max(sequence_id, Ordering::SeqCst);
    }

    pub(crate) fn next_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Adds a value to the memtable.
    pub fn add(&self, key: StoreKey, value: Vec<u8>) {
        self.memtable.add(key, value);
    }

    /// Snapshots the memtable prior to a cache flush.
    pub fn snapshot_memtable(&self) {
        self.memtable.snapshot();
    }

    /// Writes out the current memtable snapshot as a new store file tagged
    /// with `log_seq_id` and installs it. Presumes
    /// [`Store::snapshot_memtable`] has been called previously. Returns the
    /// number of bytes flushed.
    pub fn flush_cache(&self, log_seq_id: i64) -> Result<u64> {
        flush::flush_cache(self, log_seq_id)
    }

    /// Compacts the store files into one if the threshold is met, any file
    /// is a reference, or `force` is set. Returns whether a compaction ran.
    pub fn compact(&self, force: bool) -> Result<bool> {
        compaction::compact(self, force)
    }

    /// True if the store has accumulated enough files, or holds references.
    pub fn needs_compaction(&self) -> bool {
        let files = self.files.read().unwrap();
        files.storefiles.len() >= self.config.compaction_threshold
            || files.storefiles.values().any(|f| f.is_reference())
    }

    /// Closes all readers and returns the file set. The hosting region
    /// prevents further requests before calling this.
    pub fn close(&self) -> Result<Vec<StoreFile>> {
        let mut files = self.files.write()?;
        files.readers.clear();
        self.observers.lock()?.clear();
        let result = files.storefiles.values().cloned().collect();
        tracing::debug!(store = %self.name, "closed");
        Ok(result)
    }

    /// The value for `key` plus up to `n_versions - 1` older versions,
    /// newest first. Empty if the cell is absent or deleted.
    pub fn get(&self, key: &StoreKey, n_versions: usize) -> Result<Vec<Vec<u8>>> {
        if n_versions == 0 {
            return errinput!("number of versions must be > 0");
        }
        let mut results = self.memtable.get(key, n_versions);
        if results.len() >= n_versions {
            return Ok(results);
        }

        // A negative bloom answer means no file can hold this cell.
        if let Some(bloom) = &self.bloom {
            let mut probe = key.row.clone();
            probe.extend_from_slice(&key.column);
            if !bloom.lock()?.contains(&probe) {
                return Ok(results);
            }
        }

        // Deletes accumulate across files: the tombstone may sit in one
        // file and the value it masks in an older one. An in-memory
        // tombstone must mask flushed values the same way.
        let mut deletes: HashMap<Vec<u8>, i64> = HashMap::new();
        if let Some(ts) = self.memtable.delete_timestamp(key) {
            deletes.insert(key.column.clone(), ts);
        }
        for reader in self.reader_snapshot()? {
            let mut reader = reader.lock()?;
            reader.reset();
            let Some((mut found, mut value)) = reader.get_closest(key)? else {
                continue;
            };
            if !found.matches_row_col(key) {
                continue;
            }
            loop {
                if !self.is_cell_deleted(&found, &value, true, Some(&mut deletes)) {
                    results.push(value);
                    if results.len() >= n_versions {
                        return Ok(results);
                    }
                }
                match reader.next()? {
                    Some((k, v)) if k.matches_row_col(key) => {
                        found = k;
                        value = v;
                    }
                    _ => break,
                }
            }
        }
        Ok(results)
    }

    /// All available columns for `key`'s row at or below `key.timestamp`.
    /// The key indicates a row and timestamp, but not a column name.
    pub fn get_full(
        &self,
        key: &StoreKey,
        results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<()> {
        let mut deletes: HashMap<Vec<u8>, i64> = HashMap::new();
        self.memtable.get_full(key, &mut deletes, results);
        for reader in self.reader_snapshot()? {
            let mut reader = reader.lock()?;
            reader.reset();
            get_full_from_file(&mut reader, key, &mut deletes, results)?;
        }
        Ok(())
    }

    /// Keys matching `origin`, newest first, across memtable and files.
    /// An empty column in `origin` matches any column on the row. Pass
    /// `usize::MAX` to retrieve all versions.
    pub fn get_keys(&self, origin: &StoreKey, versions: usize) -> Result<Vec<StoreKey>> {
        let mut keys = self.memtable.get_keys(origin, versions);
        if keys.len() >= versions {
            return Ok(keys);
        }
        for reader in self.reader_snapshot()? {
            let mut reader = reader.lock()?;
            reader.reset();
            let Some((mut found, mut value)) = reader.get_closest(origin)? else {
                continue;
            };
            loop {
                if !row_matches(origin, &found) {
                    break;
                }
                if cell_matches(origin, &found)
                    && !self.is_cell_deleted(&found, &value, false, None)
                    && !keys.contains(&found)
                {
                    keys.push(found.clone());
                    if keys.len() >= versions {
                        return Ok(keys);
                    }
                }
                match reader.next()? {
                    Some((k, v)) => {
                        found = k;
                        value = v;
                    }
                    None => break,
                }
            }
        }
        Ok(keys)
    }

    /// The largest row at or before `row` holding any live cell, if any.
    ///
    /// Only use this on a table where writes occur with strictly
    /// increasing timestamps; catalog-style tables fit that pattern.
    pub fn row_key_at_or_before(&self, row: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut candidates: BTreeMap<StrippedKey, i64> = BTreeMap::new();
        for reader in self.reader_snapshot()? {
            let mut reader = reader.lock()?;
            row_at_or_before_from_file(&mut reader, row, &mut candidates)?;
        }
        self.memtable.row_key_at_or_before(row, &mut candidates);
        Ok(candidates.last_key_value().map(|(stripped, _)| stripped.row.clone()))
    }

    /// Aggregate and largest file sizes, and the split point of the
    /// largest file when the store is splittable. A store holding any
    /// reference file is not splittable.
    pub fn size(&self) -> Result<StoreSize> {
        let files = self.files.read()?;
        let mut size = StoreSize { aggregate: 0, largest: 0, splittable: true, mid_key: None };
        if files.storefiles.is_empty() {
            return Ok(size);
        }
        let mut largest_seq = None;
        for (seq, file) in &files.storefiles {
            let len = file.length().unwrap_or(0);
            size.aggregate += len;
            if largest_seq.is_none() || len > size.largest {
                size.largest = len;
                largest_seq = Some(*seq);
            }
            if size.splittable {
                size.splittable = !file.is_reference();
            }
        }
        if size.splittable {
            if let Some(reader) = largest_seq.and_then(|seq| files.readers.get(&seq)) {
                match split_point(&mut *reader.lock()?) {
                    Ok((splittable, mid_key)) => {
                        size.splittable = splittable;
                        size.mid_key = mid_key;
                    }
                    Err(e) => {
                        tracing::warn!(store = %self.name, error = %e,
                            "failed getting store split point");
                    }
                }
            }
        }
        Ok(size)
    }

    /// A scanner over both the memtable and the store files, starting at
    /// `first_row`, bounded by `timestamp`, restricted to `target_cols`
    /// (a column ending in the family separator matches the whole family).
    /// The store is taken by `Arc` because the scanner registers itself as
    /// a reader-change observer and outlives this call.
    pub fn scanner(
        store: &Arc<Store>,
        timestamp: i64,
        target_cols: &[Vec<u8>],
        first_row: &[u8],
        filter: Option<Box<dyn RowFilter>>,
    ) -> Result<StoreScanner> {
        StoreScanner::new(store, timestamp, target_cols, first_row, filter)
    }

    pub fn add_changed_reader_observer(&self, observer: &Arc<dyn ChangedReadersObserver>) {
        self.observers.lock().unwrap().push(Arc::downgrade(observer));
    }

    pub fn delete_changed_reader_observer(&self, observer: &Arc<dyn ChangedReadersObserver>) {
        let mut observers = self.observers.lock().unwrap();
        let target = Arc::downgrade(observer);
        if !observers.iter().any(|o| Weak::ptr_eq(o, &target)) {
            tracing::warn!(store = %self.name, "observer not in set");
        }
        observers.retain(|o| !Weak::ptr_eq(o, &target) && o.strong_count() > 0);
    }

    /// Tells every live observer the reader set changed. Called after a
    /// flush install or compaction commit, before any file is deleted, so
    /// in-flight scanners can re-seat themselves first.
    pub(crate) fn notify_changed_reader_observers(&self) -> Result<()> {
        let observers: Vec<Weak<dyn ChangedReadersObserver>> = {
            let mut guard = self.observers.lock()?;
            guard.retain(|o| o.strong_count() > 0);
            guard.clone()
        };
        for weak in observers {
            if let Some(observer) = weak.upgrade() {
                observer.update_readers()?;
            }
        }
        Ok(())
    }

    /// Makes a newly flushed file available: reader and file enter the set
    /// under the engine write lock, then observers are told.
    pub(crate) fn install_flushed(&self, sequence_id: i64, file: StoreFile) -> Result<()> {
        {
            let mut files = self.files.write()?;
            let reader = file.open_reader()?;
            files.readers.insert(sequence_id, Arc::new(Mutex::new(reader)));
            files.storefiles.insert(sequence_id, file);
        }
        self.bump_max_sequence_id(sequence_id);
        self.notify_changed_reader_observers()
    }

    /// Open readers, newest first. Snapshotted under the engine lock and
    /// used outside it; each reader is individually serialized because its
    /// cursor is stateful.
    pub(crate) fn reader_snapshot(&self) -> Result<Vec<Arc<Mutex<MapFileReader>>>> {
        let files = self.files.read()?;
        Ok(files.readers.values().rev().cloned().collect())
    }

    /// Current file set, oldest first.
    pub(crate) fn storefile_snapshot(&self) -> Result<Vec<(i64, StoreFile)>> {
        let files = self.files.read()?;
        Ok(files.storefiles.iter().map(|(seq, file)| (*seq, file.clone())).collect())
    }

    /// Checks whether a cell read from a file is dead: masked by a
    /// memtable tombstone at the exact key, masked by a tombstone already
    /// seen in a newer file (which shadows everything at or below its
    /// timestamp), or itself a tombstone, in which case its timestamp is
    /// recorded in `deletes` to mask older files.
    pub(crate) fn is_cell_deleted(
        &self,
        key: &StoreKey,
        value: &[u8],
        check_memtable: bool,
        mut deletes: Option<&mut HashMap<Vec<u8>, i64>>,
    ) -> bool {
        if check_memtable && self.memtable.is_deleted(key) {
            return true;
        }
        if let Some(deletes) = deletes.as_deref() {
            if deletes.get(&key.column).is_some_and(|&ts| key.timestamp <= ts) {
                return true;
            }
        }
        if !is_tombstone(value) {
            return false;
        }
        if let Some(deletes) = deletes.as_deref_mut() {
            let recorded = deletes.entry(key.column.clone()).or_insert(key.timestamp);
            if *recorded < key.timestamp {
                *recorded = key.timestamp;
            }
        }
        true
    }
}

/// Tests that `target` matches `origin` at row granularity. An empty
/// origin column means any column on the row matches.
fn row_matches(origin: &StoreKey, target: &StoreKey) -> bool {
    if origin.column.is_empty() {
        return target.row == origin.row;
    }
    target.matches_row_col(origin)
}

/// Tests that `target` matches `origin` at cell granularity, honoring the
/// origin's timestamp bound when the column is unspecified.
fn cell_matches(origin: &StoreKey, target: &StoreKey) -> bool {
    if origin.column.is_empty() {
        return target.row == origin.row && target.timestamp <= origin.timestamp;
    }
    target.matches_row_col(origin)
}

fn get_full_from_file(
    reader: &mut MapFileReader,
    key: &StoreKey,
    deletes: &mut HashMap<Vec<u8>, i64>,
    results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
) -> Result<()> {
    let Some((mut found, mut value)) = reader.get_closest(key)? else {
        return Ok(());
    };
    loop {
        if !results.contains_key(&found.column) && key.matches_without_column(&found) {
            if is_tombstone(&value) {
                // Record the most recent delete per column; a newer file's
                // tombstone masks older files' values.
                let recorded = deletes.entry(found.column.clone()).or_insert(found.timestamp);
                if *recorded < found.timestamp {
                    *recorded = found.timestamp;
                }
            } else if deletes.get(&found.column).is_none_or(|&ts| ts < found.timestamp) {
                results.insert(found.column.clone(), value.clone());
            }
        } else if key.row < found.row {
            return Ok(());
        }
        match reader.next()? {
            Some((k, v)) => {
                found = k;
                value = v;
            }
            None => return Ok(()),
        }
    }
}

/// Contributes one file's candidates for the largest live row at or before
/// `row`. Sweeps rows forward from an anchor, applying the shared
/// add/evict rule; when nothing at or after the anchor survives its
/// tombstones, steps the anchor back one row at a time.
fn row_at_or_before_from_file(
    reader: &mut MapFileReader,
    row: &[u8],
    candidates: &mut BTreeMap<StrippedKey, i64>,
) -> Result<()> {
    reader.reset();
    let Some(final_key) = reader.final_key()? else {
        return Ok(()); // Nothing admitted by this file.
    };
    let mut deleted: HashMap<StrippedKey, i64> = HashMap::new();

    if candidates.is_empty() {
        // Anchor at the last row starting at or before `row`; when the
        // whole file ends earlier, its final row is the best it can offer.
        let mut anchor = if final_key.row.as_slice() < row {
            final_key.row.clone()
        } else {
            match reader.get_closest_before(&StoreKey::row_probe(row))? {
                Some((key, _)) => key.row,
                None => match reader.get_closest(&StoreKey::row_probe(row))? {
                    Some((key, _)) if key.row.as_slice() == row => key.row,
                    _ => return Ok(()),
                },
            }
        };
        loop {
            sweep_rows(reader, &anchor, row, candidates, &mut deleted)?;
            if !candidates.is_empty() {
                return Ok(());
            }
            // Everything from the anchor on was deleted; step back a row.
            match reader.get_closest_before(&StoreKey::row_probe(&anchor))? {
                Some((key, _)) => anchor = key.row,
                None => return Ok(()),
            }
        }
    }

    let first_candidate_row = candidates
        .first_key_value()
        .map(|(stripped, _)| stripped.row.clone())
        .unwrap_or_default();
    if final_key.row < first_candidate_row {
        // The whole file ends before any candidate; only its final row
        // could add or refresh one.
        return sweep_rows(reader, &final_key.row, &final_key.row, candidates, &mut deleted);
    }
    // Start at the earliest candidate's row so deletes between it and the
    // target row are discovered.
    sweep_rows(reader, &first_candidate_row, row, candidates, &mut deleted)
}

/// Applies every entry of rows `start_row..` up to and including `limit_row`
/// to the candidate set.
fn sweep_rows(
    reader: &mut MapFileReader,
    start_row: &[u8],
    limit_row: &[u8],
    candidates: &mut BTreeMap<StrippedKey, i64>,
    deleted: &mut HashMap<StrippedKey, i64>,
) -> Result<()> {
    let Some((key, value)) = reader.get_closest(&StoreKey::row_probe(start_row))? else {
        return Ok(());
    };
    let mut current = Some((key, value));
    while let Some((key, value)) = current {
        if key.row.as_slice() > limit_row {
            break;
        }
        apply_row_candidate(candidates, deleted, &key, &value);
        current = reader.next()?;
    }
    Ok(())
}

/// Splittability of one file: the middle index row, unless first, middle
/// and final rows coincide (a single giant row can never be split).
fn split_point(reader: &mut MapFileReader) -> Result<(bool, Option<Vec<u8>>)> {
    reader.reset();
    let first = reader.next()?;
    let last = reader.final_key()?;
    match (reader.mid_key(), first, last) {
        (Some(mid), Some((first, _)), Some(last)) => {
            if mid.row == first.row && mid.row == last.row {
                Ok((false, None))
            } else {
                Ok((true, Some(mid.row)))
            }
        }
        _ => Ok((true, None)),
    }
}

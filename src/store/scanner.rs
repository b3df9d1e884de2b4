//! Scanners over the memtable and the store files, and the merge scanner
//! unifying them.
//!
//! Two cooperating cursors feed the merge: one walking the memtable row by
//! row, one walking every store file in parallel. Each call to
//! [`StoreScanner::next`] picks the chosen row (smallest row across live
//! cursors, newest timestamp within it), drains both cursors' cells for
//! that row newest-wins, suppresses tombstoned columns, applies the caller
//! row filter, and advances everything at or below the chosen row.
//!
//! The store-file cursor registers itself as a changed-readers observer:
//! when a flush or compaction swaps the reader set, it reopens its private
//! readers seated at the row it was about to fetch, under its own lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::error::Result;
use crate::key::{is_tombstone, StoreKey, FAMILY_SEPARATOR, LATEST_TIMESTAMP, TOMBSTONE};
use crate::mapfile::MapFileReader;

use super::{ChangedReadersObserver, Store};

/// Columns of one row, as produced by a scanner step.
pub type RowResults = BTreeMap<Vec<u8>, Vec<u8>>;

/// Caller-supplied row filter. Rows and cells it rejects are skipped and
/// the scan moves on; `filter_all_remaining` ends the scan early.
pub trait RowFilter: Send {
    /// Called once when the scan starts.
    fn reset(&mut self) {}
    /// True filters the whole row out by its key.
    fn filter_row_key(&mut self, row: &[u8]) -> bool;
    /// True filters the row out based on one of its cells.
    fn filter_cell(&mut self, row: &[u8], column: &[u8], value: &[u8]) -> bool;
    /// True once no later row can match.
    fn filter_all_remaining(&mut self) -> bool {
        false
    }
}

/// Which columns a scan wants. A target ending in the family separator
/// matches every member of that family (a wildcard scan, which must also
/// drain older timestamps on a row to pick up all the members).
#[derive(Clone)]
pub(crate) struct ColumnSet {
    matchers: Vec<ColumnMatcher>,
    wildcard: bool,
    multiple: bool,
}

#[derive(Clone)]
enum ColumnMatcher {
    Exact(Vec<u8>),
    Family(Vec<u8>),
}

impl ColumnSet {
    pub(crate) fn new(target_cols: &[Vec<u8>]) -> Self {
        let mut matchers = Vec::with_capacity(target_cols.len());
        let mut wildcard = false;
        let mut families: HashMap<Vec<u8>, usize> = HashMap::new();
        for col in target_cols {
            *families.entry(crate::key::extract_family(col).to_vec()).or_default() += 1;
            if col.last() == Some(&FAMILY_SEPARATOR) {
                matchers.push(ColumnMatcher::Family(col.clone()));
                wildcard = true;
            } else {
                matchers.push(ColumnMatcher::Exact(col.clone()));
            }
        }
        let multiple = families.values().any(|&n| n > 1);
        Self { matchers, wildcard, multiple }
    }

    pub(crate) fn matches(&self, column: &[u8]) -> bool {
        self.matchers.iter().any(|m| match m {
            ColumnMatcher::Exact(target) => target == column,
            ColumnMatcher::Family(prefix) => column.starts_with(prefix),
        })
    }

    /// Wildcard and multi-matcher scans must look past the chosen
    /// timestamp to pick up the rest of a family's members.
    pub(crate) fn multi_version(&self) -> bool {
        self.wildcard || self.multiple
    }
}

/// Cursor over the memtable: yields one row at a time via repeated
/// full-row reads and next-row probes against the live memtable, so it
/// stays correct across snapshot moves.
pub(crate) struct MemTableScanner {
    store: Arc<Store>,
    timestamp: i64,
    columns: ColumnSet,
    current_row: Option<Vec<u8>>,
}

impl MemTableScanner {
    fn new(store: Arc<Store>, timestamp: i64, columns: ColumnSet, first_row: &[u8]) -> Self {
        Self { store, timestamp, columns, current_row: Some(first_row.to_vec()) }
    }

    fn next(&mut self) -> Result<Option<(StoreKey, RowResults)>> {
        while let Some(row) = self.current_row.clone() {
            let mut deletes: HashMap<Vec<u8>, i64> = HashMap::new();
            let mut row_results: RowResults = BTreeMap::new();
            let key = StoreKey::new(row.clone(), Vec::new(), self.timestamp);
            let rowtime =
                self.store.memtable.get_full(&key, &mut deletes, &mut row_results);
            // Surface this row's tombstones so the merge layer can shadow
            // older layers' values for the same columns.
            for (column, _) in deletes.drain() {
                row_results.insert(column, TOMBSTONE.to_vec());
            }

            let mut results = RowResults::new();
            for (column, value) in row_results {
                if self.columns.matches(&column) {
                    results.insert(column, value);
                }
            }

            self.current_row = self.store.memtable.next_row(&row);
            if !results.is_empty() {
                // Pin the sentinel down to the newest real timestamp seen.
                let ts = if self.timestamp == LATEST_TIMESTAMP && rowtime != -1 {
                    rowtime
                } else {
                    self.timestamp
                };
                return Ok(Some((StoreKey::new(row, Vec::new(), ts), results)));
            }
        }
        Ok(None)
    }
}

struct SfsInner {
    /// Private readers, newest file first. `None` marks an exhausted one.
    readers: Vec<Option<MapFileReader>>,
    /// The entry each reader is parked on.
    slots: Vec<Option<(StoreKey, Vec<u8>)>>,
    closed: bool,
}

/// Cursor over all store files. Holds a weak handle on the engine so it
/// can reopen its private readers when the reader set changes.
pub(crate) struct StoreFileScanner {
    store: Weak<Store>,
    timestamp: i64,
    columns: ColumnSet,
    inner: Mutex<SfsInner>,
}

impl StoreFileScanner {
    fn new(
        store: &Arc<Store>,
        timestamp: i64,
        columns: ColumnSet,
        first_row: &[u8],
    ) -> Result<Arc<Self>> {
        let scanner = Arc::new(Self {
            store: Arc::downgrade(store),
            timestamp,
            columns,
            inner: Mutex::new(SfsInner { readers: Vec::new(), slots: Vec::new(), closed: false }),
        });
        {
            let mut inner = scanner.inner.lock()?;
            scanner.open_readers(&mut inner, first_row)?;
        }
        Ok(scanner)
    }

    /// Opens fresh readers over the current file set, cued at `first_row`
    /// (or the start when empty), leaving each slot on its first
    /// column-matching entry. Existing readers are dropped.
    fn open_readers(&self, inner: &mut SfsInner, first_row: &[u8]) -> Result<()> {
        let Some(store) = self.store.upgrade() else {
            inner.closed = true;
            return Ok(());
        };
        let files = store.storefile_snapshot()?;
        inner.readers.clear();
        inner.slots.clear();
        for (_, file) in files.iter().rev() {
            inner.readers.push(Some(file.open_reader()?));
            inner.slots.push(None);
        }
        for i in 0..inner.readers.len() {
            if !first_row.is_empty() && self.find_first_row(inner, i, first_row)? {
                continue;
            }
            while self.advance(inner, i)? {
                if self.column_match(inner, i) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Seeks reader `i` to `first_row`. Returns true when this cursor
    /// needs no further positioning: either it is exhausted, or it landed
    /// on a column-matching entry.
    fn find_first_row(&self, inner: &mut SfsInner, i: usize, first_row: &[u8]) -> Result<bool> {
        let Some(reader) = inner.readers[i].as_mut() else {
            return Ok(true);
        };
        match reader.get_closest(&StoreKey::row_probe(first_row))? {
            None => {
                inner.readers[i] = None;
                inner.slots[i] = None;
                Ok(true)
            }
            Some(entry) => {
                inner.slots[i] = Some(entry);
                Ok(self.column_match(inner, i))
            }
        }
    }

    /// Parks reader `i` on its next entry within the scan timestamp.
    /// False when the reader is exhausted.
    fn advance(&self, inner: &mut SfsInner, i: usize) -> Result<bool> {
        loop {
            let Some(reader) = inner.readers[i].as_mut() else {
                inner.slots[i] = None;
                return Ok(false);
            };
            match reader.next()? {
                None => {
                    inner.readers[i] = None;
                    inner.slots[i] = None;
                    return Ok(false);
                }
                Some((key, value)) => {
                    if key.timestamp <= self.timestamp {
                        inner.slots[i] = Some((key, value));
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn column_match(&self, inner: &SfsInner, i: usize) -> bool {
        inner.slots[i]
            .as_ref()
            .is_some_and(|(key, _)| self.columns.matches(&key.column))
    }

    /// The next viable `(row, timestamp)`: smallest row across cursors,
    /// newest timestamp within it. Cursors still parked on an entry newer
    /// than the scan timestamp (possible right after seeking) are advanced
    /// first.
    fn viable(&self, inner: &mut SfsInner) -> Result<Option<(Vec<u8>, i64)>> {
        for i in 0..inner.slots.len() {
            loop {
                let too_new = matches!(&inner.slots[i],
                    Some((key, _)) if key.timestamp > self.timestamp
                        && self.columns.matches(&key.column));
                if !too_new || !self.advance(inner, i)? || self.column_match(inner, i) {
                    break;
                }
            }
        }
        let mut viable: Option<(Vec<u8>, i64)> = None;
        for slot in &inner.slots {
            if let Some((key, _)) = slot {
                let better = match &viable {
                    None => true,
                    Some((row, ts)) => {
                        key.row < *row || (key.row == *row && key.timestamp > *ts)
                    }
                };
                if better {
                    viable = Some((key.row.clone(), key.timestamp));
                }
            }
        }
        Ok(viable)
    }

    pub(crate) fn next(&self) -> Result<Option<(StoreKey, RowResults)>> {
        let mut inner = self.inner.lock()?;
        if inner.closed {
            return Ok(None);
        }
        let Some((row, ts)) = self.viable(&mut inner)? else {
            return Ok(None);
        };

        let mut results = RowResults::new();
        let mut inserted = false;
        for i in 0..inner.slots.len() {
            // Drain this cursor's entries for the chosen row. Only the
            // first value per column is wanted; wildcard scans also pull
            // older timestamps for missed family members.
            loop {
                let Some((key, value)) = inner.slots[i].clone() else { break };
                if key.row != row {
                    break;
                }
                if !self.columns.multi_version() && key.timestamp != ts {
                    break;
                }
                if self.columns.matches(&key.column) && !results.contains_key(&key.column) {
                    results.insert(key.column, value);
                    inserted = true;
                }
                if !self.advance(&mut inner, i)? {
                    break;
                }
            }
            // Move this cursor beyond the chosen row, onto a valid
            // timestamp and matching column, ready for next time.
            loop {
                let stale = match &inner.slots[i] {
                    Some((key, _)) => {
                        key.row <= row
                            || key.timestamp > self.timestamp
                            || !self.columns.matches(&key.column)
                    }
                    None => false,
                };
                if !stale || !self.advance(&mut inner, i)? {
                    break;
                }
            }
        }
        if inserted {
            Ok(Some((StoreKey::new(row, Vec::new(), ts), results)))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.readers.clear();
            inner.slots.clear();
            inner.closed = true;
        }
    }
}

impl ChangedReadersObserver for StoreFileScanner {
    fn update_readers(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.closed {
            return Ok(());
        }
        // The cursors are lined up at the next row to fetch; reopen the
        // readers cued there so the next call continues seamlessly.
        let seat_row = self.viable(&mut inner)?.map(|(row, _)| row).unwrap_or_default();
        self.open_readers(&mut inner, &seat_row)?;
        tracing::debug!(
            row = %String::from_utf8_lossy(&seat_row),
            "replaced scanner readers"
        );
        Ok(())
    }
}

/// Scanner over both the memtable and the store files.
pub struct StoreScanner {
    store: Arc<Store>,
    mem: Option<MemTableScanner>,
    files: Option<Arc<StoreFileScanner>>,
    pending: [Option<(StoreKey, RowResults)>; 2],
    filter: Option<Box<dyn RowFilter>>,
    multi_version: bool,
    closed: bool,
}

impl StoreScanner {
    pub(crate) fn new(
        store: &Arc<Store>,
        timestamp: i64,
        target_cols: &[Vec<u8>],
        first_row: &[u8],
        mut filter: Option<Box<dyn RowFilter>>,
    ) -> Result<StoreScanner> {
        if let Some(f) = &mut filter {
            f.reset();
        }
        let columns = ColumnSet::new(target_cols);
        let mem = MemTableScanner::new(store.clone(), timestamp, columns.clone(), first_row);
        let files = StoreFileScanner::new(store, timestamp, columns.clone(), first_row)?;
        let observer: Arc<dyn ChangedReadersObserver> = files.clone();
        store.add_changed_reader_observer(&observer);

        let mut scanner = StoreScanner {
            store: store.clone(),
            mem: Some(mem),
            files: Some(files),
            pending: [None, None],
            filter,
            multi_version: columns.multi_version(),
            closed: false,
        };
        // Advance to the first row in each sub-scanner.
        for i in 0..2 {
            scanner.advance_sub(i)?;
        }
        Ok(scanner)
    }

    /// Produces the next unfiltered row, or `None` when the scan is done
    /// (after which all sub-scanners are closed).
    pub fn next(&mut self) -> Result<Option<(StoreKey, RowResults)>> {
        if self.closed {
            return Ok(None);
        }
        let mut filtered = true;
        let mut more = true;
        let mut results = RowResults::new();
        let mut chosen_key: Option<StoreKey> = None;

        while filtered && more {
            // Find the lowest-possible row; newest timestamp breaks ties.
            let mut chosen: Option<(Vec<u8>, i64)> = None;
            for (key, _) in self.pending.iter().flatten() {
                let better = match &chosen {
                    None => true,
                    Some((row, ts)) => {
                        key.row < *row || (key.row == *row && key.timestamp > *ts)
                    }
                };
                if better {
                    chosen = Some((key.row.clone(), key.timestamp));
                }
            }

            // Filter the whole row by its key?
            filtered = match (&mut self.filter, &chosen) {
                (Some(f), Some((row, _))) => f.filter_row_key(row),
                _ => false,
            };

            if let Some((row, ts)) = &chosen {
                if !filtered {
                    chosen_key = Some(StoreKey::new(row.clone(), Vec::new(), *ts));
                    // Tombstones seen in a newer layer must mask the same
                    // column coming out of an older layer for this row.
                    let mut deleted: HashSet<Vec<u8>> = HashSet::new();
                    for i in 0..2 {
                        while let Some((key, cells)) = self.pending[i].take() {
                            if key.row != *row
                                || (!self.multi_version && key.timestamp != *ts)
                            {
                                self.pending[i] = Some((key, cells));
                                break;
                            }
                            for (column, value) in cells {
                                if is_tombstone(&value) {
                                    deleted.insert(column);
                                } else if !deleted.contains(&column)
                                    && !results.contains_key(&column)
                                {
                                    if let Some(f) = &mut self.filter {
                                        if f.filter_cell(row, &column, &value) {
                                            filtered = true;
                                            results.clear();
                                            break;
                                        }
                                    }
                                    results.insert(column, value);
                                }
                            }
                            self.advance_sub(i)?;
                            if filtered {
                                break;
                            }
                        }
                    }
                }
                // Advance every sub-scanner still at or below the chosen
                // row.
                for i in 0..2 {
                    while self.pending[i]
                        .as_ref()
                        .is_some_and(|(key, _)| key.row <= *row)
                    {
                        self.advance_sub(i)?;
                    }
                }
            }

            more = chosen.is_some();
            if let Some(f) = &mut self.filter {
                if f.filter_all_remaining() {
                    more = false;
                }
            }
            if results.is_empty() && !filtered {
                // No results for this row; mark it filtered so we move on
                // to the next one.
                filtered = true;
            }
            if !more {
                break;
            }
        }

        if results.is_empty() {
            more = false;
        }
        if !more {
            self.close();
        }
        match chosen_key {
            Some(key) if !results.is_empty() => Ok(Some((key, results))),
            _ => Ok(None),
        }
    }

    fn advance_sub(&mut self, i: usize) -> Result<()> {
        let next = match i {
            0 => match &mut self.mem {
                Some(scanner) => scanner.next()?,
                None => None,
            },
            _ => match &self.files {
                Some(scanner) => scanner.next()?,
                None => None,
            },
        };
        if next.is_none() {
            self.close_sub(i);
        }
        self.pending[i] = next;
        Ok(())
    }

    fn close_sub(&mut self, i: usize) {
        match i {
            0 => {
                self.mem = None;
            }
            _ => {
                if let Some(files) = self.files.take() {
                    let observer: Arc<dyn ChangedReadersObserver> = files.clone();
                    self.store.delete_changed_reader_observer(&observer);
                    files.close();
                }
            }
        }
        self.pending[i] = None;
    }

    /// Shuts the scanner down and deregisters the reader-change observer.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for i in 0..2 {
            self.close_sub(i);
        }
        self.closed = true;
    }
}

impl Drop for StoreScanner {
    fn drop(&mut self) {
        self.close();
    }
}

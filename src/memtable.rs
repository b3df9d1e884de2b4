//! In-memory sorted buffer of recent writes, with the flush-snapshot
//! protocol.
//!
//! The memtable keeps two maps. `current` absorbs writes; when a flush
//! begins, `current` is moved wholesale into `snapshot` and a fresh empty
//! `current` is installed. Reads consult both, current first, until the
//! flusher reports the snapshot persisted and lets it go. If a flush fails
//! the snapshot survives and the next flush picks it up again.
//!
//! # Data structure
//!
//! Both maps are `crossbeam_skiplist::SkipMap`s. The skip list accepts
//! inserts through a shared reference, so concurrent writers only need the
//! outer lock in read mode; the exclusive mode is reserved for the snapshot
//! swap and clear, which must observe a quiescent pair of maps. Iteration
//! is ordered by [`StoreKey`], meaning versions of one cell appear newest
//! first and a whole row is one contiguous range.
//!
//! # Snapshot identity
//!
//! `clear_snapshot` takes the handle the flusher was given and verifies it
//! is still the live snapshot by pointer identity. A mismatch means the
//! flush protocol was violated (for example two concurrent flushers) and is
//! reported as [`Error::UnexpectedSnapshot`].

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::key::{is_tombstone, StoreKey, StrippedKey, LATEST_TIMESTAMP};

/// A frozen set of entries handed to the flusher. Compared by identity on
/// [`MemTable::clear_snapshot`].
pub type Snapshot = Arc<SkipMap<StoreKey, Vec<u8>>>;

#[derive(Debug)]
struct Maps {
    current: Snapshot,
    snapshot: Snapshot,
}

/// In-memory modifications to one column family.
#[derive(Debug)]
pub struct MemTable {
    maps: RwLock<Maps>,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                current: Arc::new(SkipMap::new()),
                snapshot: Arc::new(SkipMap::new()),
            }),
        }
    }

    /// Write an update. Concurrent writers are allowed; at equal keys the
    /// last writer wins.
    pub fn add(&self, key: StoreKey, value: Vec<u8>) {
        let maps = self.maps.read().unwrap();
        maps.current.insert(key, value);
    }

    /// Moves `current` aside for a flush. If a previous snapshot is still
    /// live the flusher failed or never cleaned up; log and keep it, so the
    /// retry flushes the old snapshot rather than losing it.
    pub fn snapshot(&self) {
        let mut maps = self.maps.write().unwrap();
        if !maps.snapshot.is_empty() {
            tracing::warn!(
                "snapshot called again without clearing previous; doing nothing. \
                 Another ongoing flush, or did the last attempt fail?"
            );
            return;
        }
        if !maps.current.is_empty() {
            maps.snapshot = std::mem::replace(&mut maps.current, Arc::new(SkipMap::new()));
        }
    }

    /// The current snapshot, for the flusher to persist and then pass back
    /// to [`MemTable::clear_snapshot`].
    pub fn snapshot_handle(&self) -> Snapshot {
        self.maps.read().unwrap().snapshot.clone()
    }

    /// The passed snapshot was persisted; let it go.
    pub fn clear_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut maps = self.maps.write().unwrap();
        if !Arc::ptr_eq(&maps.snapshot, snapshot) {
            return Err(Error::UnexpectedSnapshot(
                "the snapshot being cleared is not the current one".into(),
            ));
        }
        if !snapshot.is_empty() {
            maps.snapshot = Arc::new(SkipMap::new());
        }
        Ok(())
    }

    /// Up to `n_versions` values for `(key.row, key.column)` at timestamps
    /// at or below `key.timestamp`, newest first, tombstones skipped.
    pub fn get(&self, key: &StoreKey, n_versions: usize) -> Vec<Vec<u8>> {
        let maps = self.maps.read().unwrap();
        let mut results = internal_get(&maps.current, key, n_versions);
        if results.len() < n_versions {
            let remaining = n_versions - results.len();
            results.extend(internal_get(&maps.snapshot, key, remaining));
        }
        results
    }

    /// True if the exact key carries a tombstone in the current map.
    pub fn is_deleted(&self, key: &StoreKey) -> bool {
        let maps = self.maps.read().unwrap();
        maps.current
            .get(key)
            .is_some_and(|entry| is_tombstone(entry.value()))
    }

    /// The newest tombstone timestamp for `(key.row, key.column)` at or
    /// below `key.timestamp`, across both maps. Point reads seed their
    /// cross-file delete set with this so an in-memory delete masks
    /// flushed values.
    pub fn delete_timestamp(&self, key: &StoreKey) -> Option<i64> {
        let maps = self.maps.read().unwrap();
        let mut best: Option<i64> = None;
        for map in [&maps.current, &maps.snapshot] {
            for entry in tail(map, key) {
                if !entry.key().matches_row_col(key) {
                    break;
                }
                if is_tombstone(entry.value()) {
                    // Entries run newest first, so the first tombstone in
                    // this map is its newest.
                    let ts = entry.key().timestamp;
                    best = Some(best.map_or(ts, |b| b.max(ts)));
                    break;
                }
            }
        }
        best
    }

    /// Keys matching `origin`, newest first. An empty column in `origin`
    /// matches any column on the row with timestamp at or below
    /// `origin.timestamp`.
    pub fn get_keys(&self, origin: &StoreKey, versions: usize) -> Vec<StoreKey> {
        let maps = self.maps.read().unwrap();
        let mut results = internal_get_keys(&maps.current, origin, versions);
        if results.len() < versions {
            let remaining = versions - results.len();
            results.extend(internal_get_keys(&maps.snapshot, origin, remaining));
        }
        results
    }

    /// All available columns for `key`'s row at or below `key.timestamp`.
    /// Records per-column delete timestamps into `deletes` (keeping the
    /// maximum observed) and the first live value per column into
    /// `results`. Returns the largest non-sentinel timestamp observed on
    /// the row, or -1.
    pub fn get_full(
        &self,
        key: &StoreKey,
        deletes: &mut HashMap<Vec<u8>, i64>,
        results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> i64 {
        let maps = self.maps.read().unwrap();
        let mut rowtime = internal_get_full(&maps.current, key, deletes, results);
        let ts = internal_get_full(&maps.snapshot, key, deletes, results);
        if ts > rowtime {
            rowtime = ts;
        }
        rowtime
    }

    /// Contributes this memtable's candidates for the largest row at or
    /// before `row` into the shared candidate map.
    pub fn row_key_at_or_before(&self, row: &[u8], candidates: &mut BTreeMap<StrippedKey, i64>) {
        let maps = self.maps.read().unwrap();
        internal_row_at_or_before(&maps.current, row, candidates);
        internal_row_at_or_before(&maps.snapshot, row, candidates);
    }

    /// The smallest row strictly greater than `row` present in either map.
    pub fn next_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        let maps = self.maps.read().unwrap();
        match (
            internal_next_row(&maps.current, row),
            internal_next_row(&maps.snapshot, row),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Entry count across both maps.
    pub fn len(&self) -> usize {
        let maps = self.maps.read().unwrap();
        maps.current.len() + maps.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tail<'a>(
    map: &'a SkipMap<StoreKey, Vec<u8>>,
    from: &StoreKey,
) -> impl Iterator<Item = crossbeam_skiplist::map::Entry<'a, StoreKey, Vec<u8>>> {
    map.range((Bound::Included(from.clone()), Bound::Unbounded))
}

fn internal_get(map: &SkipMap<StoreKey, Vec<u8>>, key: &StoreKey, n_versions: usize) -> Vec<Vec<u8>> {
    let mut results = Vec::new();
    for entry in tail(map, key) {
        if !entry.key().matches_row_col(key) {
            // The map is sorted; no further entry can match.
            break;
        }
        if !is_tombstone(entry.value()) {
            results.push(entry.value().clone());
        }
        if results.len() >= n_versions {
            break;
        }
    }
    results
}

fn internal_get_keys(
    map: &SkipMap<StoreKey, Vec<u8>>,
    origin: &StoreKey,
    versions: usize,
) -> Vec<StoreKey> {
    let mut results = Vec::new();
    for entry in tail(map, origin) {
        let key = entry.key();
        if origin.column.is_empty() {
            // No column name: compare rows and timestamps only.
            if key.row != origin.row {
                break;
            }
            if key.timestamp > origin.timestamp {
                continue;
            }
        } else if !key.matches_row_col(origin) {
            break;
        }
        if !is_tombstone(entry.value()) {
            results.push(key.clone());
            if results.len() >= versions {
                break;
            }
        }
    }
    results
}

fn internal_get_full(
    map: &SkipMap<StoreKey, Vec<u8>>,
    key: &StoreKey,
    deletes: &mut HashMap<Vec<u8>, i64>,
    results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
) -> i64 {
    let mut rowtime = -1i64;
    for entry in tail(map, key) {
        let found = entry.key();
        if !results.contains_key(&found.column) && key.matches_without_column(found) {
            if found.timestamp != LATEST_TIMESTAMP && found.timestamp > rowtime {
                rowtime = found.timestamp;
            }
            if is_tombstone(entry.value()) {
                // The column's recorded delete timestamp is the maximum
                // observed.
                let recorded = deletes.entry(found.column.clone()).or_insert(found.timestamp);
                if *recorded < found.timestamp {
                    *recorded = found.timestamp;
                }
            } else if deletes.get(&found.column).is_none_or(|&ts| ts < found.timestamp) {
                results.insert(found.column.clone(), entry.value().clone());
            }
        } else if key.row < found.row {
            break;
        }
    }
    rowtime
}

fn internal_next_row(map: &SkipMap<StoreKey, Vec<u8>>, row: &[u8]) -> Option<Vec<u8>> {
    for entry in tail(map, &StoreKey::row_probe(row)) {
        if entry.key().row.as_slice() > row {
            // Deletes are not suppressed here, as in the original scanner.
            return Some(entry.key().row.clone());
        }
    }
    None
}

/// Applies one cell to a closest-row-before candidate set. A tombstone
/// evicts a matching candidate at or below its timestamp and is remembered
/// in `deleted` so a shadowed value seen later in the same scan is not
/// re-admitted; a live value becomes a candidate unless a remembered
/// tombstone covers it.
pub(crate) fn apply_row_candidate(
    candidates: &mut BTreeMap<StrippedKey, i64>,
    deleted: &mut HashMap<StrippedKey, i64>,
    key: &StoreKey,
    value: &[u8],
) {
    let stripped = key.stripped();
    if is_tombstone(value) {
        let recorded = deleted.entry(stripped.clone()).or_insert(key.timestamp);
        if *recorded < key.timestamp {
            *recorded = key.timestamp;
        }
        if let Some(&best) = candidates.get(&stripped) {
            if best <= key.timestamp {
                candidates.remove(&stripped);
            }
        }
    } else if deleted.get(&stripped).is_none_or(|&d| d < key.timestamp) {
        candidates.insert(stripped, key.timestamp);
    }
}

fn internal_row_at_or_before(
    map: &SkipMap<StoreKey, Vec<u8>>,
    row: &[u8],
    candidates: &mut BTreeMap<StrippedKey, i64>,
) {
    // Start from the earliest candidate's row if one exists; nothing
    // smaller can win.
    let search_key = match candidates.first_key_value() {
        Some((stripped, _)) => StoreKey::row_probe(&stripped.row),
        None => StoreKey::row_probe(row),
    };
    let mut deleted: HashMap<StrippedKey, i64> = HashMap::new();

    let mut tail_iter = tail(map, &search_key).peekable();
    if tail_iter.peek().is_some_and(|entry| entry.key().row.as_slice() <= row) {
        // Walk forward applying add/evict logic until past the target row.
        for entry in tail_iter {
            let found = entry.key();
            if found.row.as_slice() > row {
                break;
            }
            apply_row_candidate(candidates, &mut deleted, found, entry.value());
        }
        if !candidates.is_empty() {
            return;
        }
        // Everything from the search point on was deleted; the answer, if
        // any, lies in the rows before it.
    }

    if candidates.is_empty() {
        // Search backwards for the latest row holding any live cell.
        let head = map.range((Bound::Unbounded, Bound::Excluded(search_key)));
        let mut current_row: Option<Vec<u8>> = None;
        for entry in head.rev() {
            let found = entry.key();
            let crossed_row = current_row.as_deref().is_some_and(|r| r != found.row.as_slice());
            if crossed_row && !candidates.is_empty() {
                break;
            }
            apply_row_candidate(candidates, &mut deleted, found, entry.value());
            current_row = Some(found.row.clone());
        }
    } else {
        // Only the last row before the search point can still matter;
        // anything smaller would have moved the search point earlier.
        let last_row = {
            let mut head = map.range((Bound::Unbounded, Bound::Excluded(search_key.clone())));
            match head.next_back() {
                Some(entry) => entry.key().row.clone(),
                None => return,
            }
        };
        for entry in tail(map, &StoreKey::row_probe(&last_row)) {
            let found = entry.key();
            if found.row != last_row {
                break;
            }
            apply_row_candidate(candidates, &mut deleted, found, entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TOMBSTONE;

    fn key(row: &[u8], col: &[u8], ts: i64) -> StoreKey {
        StoreKey::new(row.to_vec(), col.to_vec(), ts)
    }

    fn probe(row: &[u8], col: &[u8]) -> StoreKey {
        key(row, col, LATEST_TIMESTAMP)
    }

    #[test]
    fn test_add_and_get() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 1), b"v1".to_vec());
        memtable.add(key(b"r", b"f:c", 2), b"v2".to_vec());
        memtable.add(key(b"r", b"f:d", 2), b"other".to_vec());

        assert_eq!(memtable.get(&probe(b"r", b"f:c"), 1), vec![b"v2".to_vec()]);
        assert_eq!(
            memtable.get(&probe(b"r", b"f:c"), 5),
            vec![b"v2".to_vec(), b"v1".to_vec()]
        );
        // Timestamp bound hides newer versions.
        assert_eq!(memtable.get(&key(b"r", b"f:c", 1), 5), vec![b"v1".to_vec()]);
        assert!(memtable.get(&probe(b"x", b"f:c"), 1).is_empty());
    }

    #[test]
    fn test_last_writer_wins_at_equal_keys() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 7), b"first".to_vec());
        memtable.add(key(b"r", b"f:c", 7), b"second".to_vec());
        assert_eq!(memtable.get(&probe(b"r", b"f:c"), 5), vec![b"second".to_vec()]);
    }

    #[test]
    fn test_get_skips_tombstones() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 1), b"v1".to_vec());
        memtable.add(key(b"r", b"f:c", 2), TOMBSTONE.to_vec());

        assert_eq!(memtable.get(&probe(b"r", b"f:c"), 1), vec![b"v1".to_vec()]);
        assert!(memtable.is_deleted(&key(b"r", b"f:c", 2)));
        assert!(!memtable.is_deleted(&key(b"r", b"f:c", 1)));
    }

    #[test]
    fn test_snapshot_protocol() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 1), b"v1".to_vec());

        memtable.snapshot();
        let snapshot = memtable.snapshot_handle();
        assert_eq!(snapshot.len(), 1);

        // Reads still see the snapshot contents.
        assert_eq!(memtable.get(&probe(b"r", b"f:c"), 1), vec![b"v1".to_vec()]);

        // New writes land in the fresh current map.
        memtable.add(key(b"r", b"f:c", 2), b"v2".to_vec());
        assert_eq!(
            memtable.get(&probe(b"r", b"f:c"), 5),
            vec![b"v2".to_vec(), b"v1".to_vec()]
        );

        memtable.clear_snapshot(&snapshot).expect("Failed to clear snapshot");
        assert_eq!(memtable.get(&probe(b"r", b"f:c"), 5), vec![b"v2".to_vec()]);
    }

    #[test]
    fn test_second_snapshot_is_noop_while_first_live() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 1), b"v1".to_vec());
        memtable.snapshot();
        let first = memtable.snapshot_handle();

        memtable.add(key(b"r", b"f:c", 2), b"v2".to_vec());
        memtable.snapshot();
        // The retry must see the first snapshot, not a new one.
        assert!(Arc::ptr_eq(&memtable.snapshot_handle(), &first));
        assert_eq!(memtable.snapshot_handle().len(), 1);
    }

    #[test]
    fn test_clear_snapshot_requires_identity() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 1), b"v1".to_vec());
        memtable.snapshot();

        let stale: Snapshot = Arc::new(SkipMap::new());
        assert!(matches!(
            memtable.clear_snapshot(&stale),
            Err(Error::UnexpectedSnapshot(_))
        ));

        let live = memtable.snapshot_handle();
        memtable.clear_snapshot(&live).expect("Failed to clear live snapshot");
    }

    #[test]
    fn test_get_keys_with_column() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:c", 1), b"a".to_vec());
        memtable.add(key(b"r", b"f:c", 2), b"b".to_vec());
        memtable.add(key(b"r", b"f:c", 3), TOMBSTONE.to_vec());
        memtable.add(key(b"r", b"f:d", 9), b"c".to_vec());

        let keys = memtable.get_keys(&probe(b"r", b"f:c"), usize::MAX);
        assert_eq!(
            keys,
            vec![key(b"r", b"f:c", 2), key(b"r", b"f:c", 1)],
            "tombstone and foreign column must be excluded"
        );

        let keys = memtable.get_keys(&probe(b"r", b"f:c"), 1);
        assert_eq!(keys, vec![key(b"r", b"f:c", 2)]);
    }

    #[test]
    fn test_get_keys_empty_column_matches_any() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:a", 5), b"x".to_vec());
        memtable.add(key(b"r", b"f:b", 9), b"y".to_vec());
        memtable.add(key(b"s", b"f:a", 5), b"z".to_vec());

        let keys = memtable.get_keys(&key(b"r", b"", 6), usize::MAX);
        assert_eq!(keys, vec![key(b"r", b"f:a", 5)], "ts bound must exclude f:b@9");

        let keys = memtable.get_keys(&key(b"r", b"", LATEST_TIMESTAMP), usize::MAX);
        assert_eq!(keys, vec![key(b"r", b"f:a", 5), key(b"r", b"f:b", 9)]);
    }

    #[test]
    fn test_get_full_applies_delete_timestamps() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:a", 5), b"va".to_vec());
        memtable.add(key(b"r", b"f:a", 7), TOMBSTONE.to_vec());
        memtable.add(key(b"r", b"f:b", 5), b"vb".to_vec());

        let mut deletes = HashMap::new();
        let mut results = BTreeMap::new();
        let rowtime = memtable.get_full(&probe(b"r", b""), &mut deletes, &mut results);

        assert_eq!(rowtime, 7);
        assert_eq!(deletes.get(b"f:a".as_slice()), Some(&7));
        assert_eq!(results.len(), 1);
        assert_eq!(results.get(b"f:b".as_slice()), Some(&b"vb".to_vec()));
    }

    #[test]
    fn test_get_full_older_tombstone_does_not_lower_delete_ts() {
        let memtable = MemTable::new();
        memtable.add(key(b"r", b"f:a", 9), TOMBSTONE.to_vec());
        memtable.add(key(b"r", b"f:a", 3), TOMBSTONE.to_vec());
        memtable.add(key(b"r", b"f:a", 5), b"va".to_vec());

        let mut deletes = HashMap::new();
        let mut results = BTreeMap::new();
        memtable.get_full(&probe(b"r", b""), &mut deletes, &mut results);

        // The recorded delete timestamp is the maximum observed, so the
        // value at ts=5 stays shadowed.
        assert_eq!(deletes.get(b"f:a".as_slice()), Some(&9));
        assert!(results.is_empty());
    }

    #[test]
    fn test_next_row_spans_both_maps() {
        let memtable = MemTable::new();
        memtable.add(key(b"b", b"f:c", 1), b"v".to_vec());
        memtable.snapshot();
        memtable.add(key(b"d", b"f:c", 1), b"v".to_vec());

        assert_eq!(memtable.next_row(b"a"), Some(b"b".to_vec()));
        assert_eq!(memtable.next_row(b"b"), Some(b"d".to_vec()));
        assert_eq!(memtable.next_row(b"d"), None);
    }

    #[test]
    fn test_row_at_or_before_basic() {
        let memtable = MemTable::new();
        for row in [b"010".as_slice(), b"020", b"030"] {
            memtable.add(key(row, b"f:c", 1), b"v".to_vec());
        }

        let mut candidates = BTreeMap::new();
        memtable.row_key_at_or_before(b"015", &mut candidates);
        let best = candidates.last_key_value().expect("expected a candidate");
        assert_eq!(best.0.row, b"010");

        let mut candidates = BTreeMap::new();
        memtable.row_key_at_or_before(b"020", &mut candidates);
        assert_eq!(candidates.last_key_value().expect("candidate").0.row, b"020");

        let mut candidates = BTreeMap::new();
        memtable.row_key_at_or_before(b"050", &mut candidates);
        assert_eq!(candidates.last_key_value().expect("candidate").0.row, b"030");
    }

    #[test]
    fn test_row_at_or_before_tombstone_evicts_candidate() {
        let memtable = MemTable::new();
        memtable.add(key(b"010", b"f:c", 1), b"v".to_vec());
        memtable.add(key(b"020", b"f:c", 1), b"v".to_vec());
        memtable.add(key(b"020", b"f:c", 2), TOMBSTONE.to_vec());

        let mut candidates = BTreeMap::new();
        memtable.row_key_at_or_before(b"025", &mut candidates);
        assert_eq!(
            candidates.last_key_value().expect("candidate").0.row,
            b"010",
            "deleted row must not win"
        );
    }

    #[test]
    fn test_concurrent_adds_under_shared_lock() {
        use std::thread;

        let memtable = Arc::new(MemTable::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let m = memtable.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let row = format!("row_{:03}", i).into_bytes();
                    m.add(StoreKey::new(row, b"f:c".to_vec(), t), vec![t as u8]);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }
        assert_eq!(memtable.len(), 400);
    }
}

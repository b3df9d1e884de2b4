//! Composite cell keys and their total order.
//!
//! A cell is addressed by `(row, column, timestamp)`. Keys sort by row
//! ascending, then column ascending, then timestamp *descending*, so that
//! within a `(row, column)` pair the newest version sorts first. This is the
//! single ordering used by the memtable, the on-disk sorted runs, and the
//! merging compactor; all shadowing and version-limit logic relies on it.
//!
//! Columns are namespaced by family: the column family is the prefix of the
//! column name up to the `:` separator. Each family is served by its own
//! engine instance, and flush/recovery skip columns of foreign families.

use serde::{Deserialize, Serialize};

/// Reserved sentinel timestamp. Because timestamps sort descending, a probe
/// key carrying this value precedes every real entry for the same row and
/// column, which makes it a start-of-row cursor position.
pub const LATEST_TIMESTAMP: i64 = i64::MAX;

/// Separator between the column family name and the column qualifier.
pub const FAMILY_SEPARATOR: u8 = b':';

/// Distinguished value marking a deleted cell. A tombstone at timestamp `t`
/// masks all values for the same `(row, column)` with timestamp `<= t` that
/// are encountered later in merge order.
pub const TOMBSTONE: &[u8] = b"EMBER::TOMBSTONE";

/// Returns true if the value is the deletion marker.
pub fn is_tombstone(value: &[u8]) -> bool {
    value == TOMBSTONE
}

/// Returns the family prefix of a column name: everything up to and
/// excluding the separator, or the whole name if there is none.
pub fn extract_family(column: &[u8]) -> &[u8] {
    match column.iter().position(|&b| b == FAMILY_SEPARATOR) {
        Some(idx) => &column[..idx],
        None => column,
    }
}

/// Coordinates of a single cell version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreKey {
    pub row: Vec<u8>,
    pub column: Vec<u8>,
    pub timestamp: i64,
}

impl StoreKey {
    pub fn new(row: Vec<u8>, column: Vec<u8>, timestamp: i64) -> Self {
        Self { row, column, timestamp }
    }

    /// A probe that sorts before every real entry of `row`: empty column,
    /// latest timestamp.
    pub fn row_probe(row: &[u8]) -> Self {
        Self::new(row.to_vec(), Vec::new(), LATEST_TIMESTAMP)
    }

    /// True if `other` has the same row and column as this key.
    pub fn matches_row_col(&self, other: &StoreKey) -> bool {
        self.row == other.row && self.column == other.column
    }

    /// True if `other` is on the same row with a timestamp at or below this
    /// key's. Column is ignored; used by full-row reads.
    pub fn matches_without_column(&self, other: &StoreKey) -> bool {
        self.row == other.row && other.timestamp <= self.timestamp
    }

    /// This key with the timestamp removed.
    pub fn stripped(&self) -> StrippedKey {
        StrippedKey { row: self.row.clone(), column: self.column.clone() }
    }
}

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            // Descending: newer versions sort before older ones.
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A `(row, column)` pair without the timestamp. Used as the candidate-map
/// key by closest-row-at-or-before lookups, where one candidate per cell is
/// tracked with its best timestamp alongside.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StrippedKey {
    pub row: Vec<u8>,
    pub column: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(row: &[u8], col: &[u8], ts: i64) -> StoreKey {
        StoreKey::new(row.to_vec(), col.to_vec(), ts)
    }

    #[test]
    fn test_ordering_rows_and_columns_ascend() {
        assert!(key(b"a", b"f:x", 1) < key(b"b", b"f:x", 1));
        assert!(key(b"a", b"f:x", 1) < key(b"a", b"f:y", 1));
    }

    #[test]
    fn test_ordering_timestamps_descend() {
        // Newer versions of the same cell sort first.
        assert!(key(b"a", b"f:x", 9) < key(b"a", b"f:x", 3));
        assert!(key(b"a", b"f:x", LATEST_TIMESTAMP) < key(b"a", b"f:x", 0));
    }

    #[test]
    fn test_row_probe_precedes_row_entries() {
        let probe = StoreKey::row_probe(b"row1");
        assert!(probe < key(b"row1", b"f:x", LATEST_TIMESTAMP));
        assert!(probe < key(b"row1", b"f:x", 0));
        assert!(probe > key(b"row0", b"f:zzz", 0));
    }

    #[test]
    fn test_matchers() {
        let origin = key(b"r", b"f:c", 10);
        assert!(origin.matches_row_col(&key(b"r", b"f:c", 3)));
        assert!(!origin.matches_row_col(&key(b"r", b"f:d", 10)));
        assert!(origin.matches_without_column(&key(b"r", b"f:d", 10)));
        assert!(origin.matches_without_column(&key(b"r", b"f:d", 2)));
        assert!(!origin.matches_without_column(&key(b"r", b"f:d", 11)));
        assert!(!origin.matches_without_column(&key(b"s", b"f:c", 2)));
    }

    #[test]
    fn test_extract_family() {
        assert_eq!(extract_family(b"info:name"), b"info");
        assert_eq!(extract_family(b"info:"), b"info");
        assert_eq!(extract_family(b"info"), b"info");
    }

    #[test]
    fn test_stripped_key_order_ignores_timestamp() {
        let a = key(b"r", b"f:c", 5).stripped();
        let b = key(b"r", b"f:c", 99).stripped();
        assert_eq!(a, b);
        assert!(key(b"r", b"f:c", 1).stripped() < key(b"s", b"f:a", 1).stripped());
    }
}

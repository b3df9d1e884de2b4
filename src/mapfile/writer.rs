use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};

use crate::errinput;
use crate::error::Result;
use crate::key::StoreKey;

use super::{
    write_entry, write_header, DATA_FILE_NAME, DATA_MAGIC, INDEX_FILE_NAME, INDEX_MAGIC,
};

/// Writes a sorted run into a store file directory: entries stream into
/// `data`, the sparse index accumulates in memory and is written to `index`
/// when the writer is finished.
pub struct MapFileWriter {
    data: BufWriter<File>,
    index_path: PathBuf,
    index: Vec<(StoreKey, u64)>,
    index_interval: usize,
    offset: u64,
    entries: u64,
    last_key: Option<StoreKey>,
}

impl MapFileWriter {
    /// Creates the store file directory and an empty data file inside it.
    pub fn create(dir: &Path, index_interval: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut data = BufWriter::new(File::create(dir.join(DATA_FILE_NAME))?);
        write_header(&mut data, DATA_MAGIC)?;
        Ok(Self {
            data,
            index_path: dir.join(INDEX_FILE_NAME),
            index: Vec::new(),
            index_interval: index_interval.max(1),
            offset: super::HEADER_LEN,
            entries: 0,
            last_key: None,
        })
    }

    /// Appends one entry. Keys must arrive in non-decreasing order.
    /// Returns the number of data bytes the entry occupies.
    pub fn append(&mut self, key: &StoreKey, value: &[u8]) -> Result<u64> {
        if let Some(last) = &self.last_key {
            if key < last {
                return errinput!(
                    "key out of order: {:?} appended after {:?}",
                    key.row,
                    last.row
                );
            }
        }
        if self.entries % self.index_interval as u64 == 0 {
            self.index.push((key.clone(), self.offset));
        }
        let written = write_entry(&mut self.data, key, value)?;
        self.offset += written;
        self.entries += 1;
        self.last_key = Some(key.clone());
        Ok(written)
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Flushes the data file and writes the index sidecar. Returns the
    /// total number of data bytes written.
    pub fn finish(mut self) -> Result<u64> {
        self.data.flush()?;
        write_index(&self.index_path, self.entries, &self.index)?;
        Ok(self.offset)
    }
}

/// Writes an index file: header, entry count, then `(key, offset)` pairs.
pub(crate) fn write_index(path: &Path, entries: u64, index: &[(StoreKey, u64)]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_header(&mut out, INDEX_MAGIC)?;
    out.write_u64::<BigEndian>(entries)?;
    for (key, offset) in index {
        out.write_u32::<BigEndian>(key.row.len() as u32)?;
        out.write_all(&key.row)?;
        out.write_u32::<BigEndian>(key.column.len() as u32)?;
        out.write_all(&key.column)?;
        out.write_i64::<BigEndian>(key.timestamp)?;
        out.write_u64::<BigEndian>(*offset)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    fn key(row: &[u8], ts: i64) -> StoreKey {
        StoreKey::new(row.to_vec(), b"f:c".to_vec(), ts)
    }

    #[test]
    fn test_write_creates_data_and_index() {
        let dir = tempdir().expect("Failed to create temp dir");
        let file_dir = dir.path().join("0");

        let mut writer = MapFileWriter::create(&file_dir, 2).expect("Failed to create writer");
        for i in 0..5 {
            let row = format!("row_{i}").into_bytes();
            writer
                .append(&key(&row, 1), b"value")
                .expect("Failed to append");
        }
        assert_eq!(writer.entry_count(), 5);
        let bytes = writer.finish().expect("Failed to finish");
        assert!(bytes > super::super::HEADER_LEN);

        assert!(file_dir.join(DATA_FILE_NAME).exists());
        assert!(file_dir.join(INDEX_FILE_NAME).exists());
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let dir = tempdir().expect("Failed to create temp dir");
        let mut writer =
            MapFileWriter::create(&dir.path().join("0"), 32).expect("Failed to create writer");

        writer.append(&key(b"b", 1), b"v").expect("Failed to append");
        let result = writer.append(&key(b"a", 1), b"v");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_equal_keys_allowed() {
        // Compaction may emit several versions of one cell; equal full keys
        // coming from distinct inputs must not be rejected.
        let dir = tempdir().expect("Failed to create temp dir");
        let mut writer =
            MapFileWriter::create(&dir.path().join("0"), 32).expect("Failed to create writer");

        writer.append(&key(b"a", 5), b"v1").expect("Failed to append");
        writer.append(&key(b"a", 5), b"v2").expect("Failed to append duplicate");
        writer.append(&key(b"a", 3), b"v3").expect("Failed to append older version");
    }
}

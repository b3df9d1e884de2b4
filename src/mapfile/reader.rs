use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::StoreKey;

use super::writer::write_index;
use super::{
    read_entry, read_header, DATA_FILE_NAME, DATA_MAGIC, HEADER_LEN, INDEX_FILE_NAME, INDEX_MAGIC,
};

/// Which half of a split parent's row range a reference file exposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Half {
    /// Rows at or above the split key.
    Top,
    /// Rows below the split key.
    Bottom,
}

/// Row-range restriction applied by readers opened over a reference file.
#[derive(Clone, Debug)]
pub struct HalfRange {
    pub split_row: Vec<u8>,
    pub half: Half,
}

impl HalfRange {
    fn admits(&self, row: &[u8]) -> bool {
        match self.half {
            Half::Top => row >= self.split_row.as_slice(),
            Half::Bottom => row < self.split_row.as_slice(),
        }
    }
}

/// A stateful cursor over one sorted run. The sparse index is held in
/// memory; the data file is read forward from whatever offset the cursor
/// was last seated at. Callers sharing a reader serialize access to it,
/// since every operation moves the seek position.
pub struct MapFileReader {
    data: File,
    index: Vec<(StoreKey, u64)>,
    entry_count: u64,
    pos: u64,
    restriction: Option<HalfRange>,
}

impl MapFileReader {
    /// Opens the run in `dir`, loading its index. Fails if either file is
    /// missing, misheadered, or the index is undecodable; see
    /// [`MapFileReader::rebuild_index`] for the repair path.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, None)
    }

    /// Opens a run narrowed to one half of its row range, as referenced by
    /// a split child region.
    pub fn open_half(dir: &Path, restriction: HalfRange) -> Result<Self> {
        Self::open_with(dir, Some(restriction))
    }

    fn open_with(dir: &Path, restriction: Option<HalfRange>) -> Result<Self> {
        let mut data = File::open(dir.join(DATA_FILE_NAME))?;
        read_header(&mut data, DATA_MAGIC, "data file")?;

        let mut index_in = BufReader::new(File::open(dir.join(INDEX_FILE_NAME))?);
        read_header(&mut index_in, INDEX_MAGIC, "index file")?;
        let entry_count = index_in.read_u64::<BigEndian>()?;
        let index = read_index_entries(&mut index_in)?;

        Ok(Self { data, index, entry_count, pos: HEADER_LEN, restriction })
    }

    /// Scans the data file sequentially and rewrites the index sidecar.
    /// Used once at load time when the index is missing or empty. Returns
    /// the number of entries indexed over.
    pub fn rebuild_index(dir: &Path, index_interval: usize) -> Result<u64> {
        let mut data = File::open(dir.join(DATA_FILE_NAME))?;
        read_header(&mut data, DATA_MAGIC, "data file")?;
        let interval = index_interval.max(1) as u64;

        let mut index = Vec::new();
        let mut entries = 0u64;
        let mut offset = HEADER_LEN;
        let mut reader = BufReader::new(&mut data);
        while let Some((key, value)) = read_entry(&mut reader)? {
            if entries % interval == 0 {
                index.push((key.clone(), offset));
            }
            // 24 bytes of fixed fields plus a trailing crc32.
            offset += 24 + key.row.len() as u64 + key.column.len() as u64 + value.len() as u64 + 4;
            entries += 1;
        }
        write_index(&dir.join(INDEX_FILE_NAME), entries, &index)?;
        Ok(entries)
    }

    /// Re-seats the cursor at the first entry.
    pub fn reset(&mut self) {
        self.pos = HEADER_LEN;
    }

    /// Number of entries in the underlying run (references report the
    /// parent's count; the restriction is applied during iteration).
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Reads the entry under the cursor and advances. `None` at the end of
    /// the run, or past the admitted half for a reference.
    pub fn next(&mut self) -> Result<Option<(StoreKey, Vec<u8>)>> {
        loop {
            self.data.seek(SeekFrom::Start(self.pos))?;
            let mut input = &self.data;
            let Some((key, value)) = read_entry(&mut input)? else {
                return Ok(None);
            };
            self.pos = input.stream_position()?;
            match &self.restriction {
                Some(range) if !range.admits(&key.row) => {
                    if range.half == Half::Bottom {
                        // Keys are sorted, nothing admissible remains.
                        return Ok(None);
                    }
                    continue;
                }
                _ => return Ok(Some((key, value))),
            }
        }
    }

    /// Seats the cursor at the smallest entry `>= key` and returns it; a
    /// following [`MapFileReader::next`] yields the entry after it. `None`
    /// if every entry sorts below `key`.
    pub fn get_closest(&mut self, key: &StoreKey) -> Result<Option<(StoreKey, Vec<u8>)>> {
        let target = self.clamp_forward(key);
        self.seek_index(&target);
        while let Some((found, value)) = self.next()? {
            if found >= target {
                return Ok(Some((found, value)));
            }
        }
        Ok(None)
    }

    /// Seats the cursor just past the largest entry `<= key` and returns
    /// that entry. `None` if every entry sorts above `key`.
    pub fn get_closest_before(&mut self, key: &StoreKey) -> Result<Option<(StoreKey, Vec<u8>)>> {
        if let Some(range) = &self.restriction {
            if range.half == Half::Top && key.row.as_slice() < range.split_row.as_slice() {
                return Ok(None);
            }
        }
        let target = self.clamp_backward(key);
        self.seek_index(&target);
        let mut best: Option<(StoreKey, Vec<u8>, u64)> = None;
        loop {
            match self.next()? {
                Some((found, value)) if found <= target => {
                    best = Some((found, value, self.pos));
                }
                _ => break,
            }
        }
        match best {
            Some((found, value, after)) => {
                self.pos = after;
                Ok(Some((found, value)))
            }
            None => Ok(None),
        }
    }

    /// The last admitted key in the run, without disturbing the cursor.
    pub fn final_key(&mut self) -> Result<Option<StoreKey>> {
        let saved = self.pos;
        self.pos = match &self.restriction {
            // A bottom half may end anywhere before the split; scan it all.
            Some(range) if range.half == Half::Bottom => HEADER_LEN,
            _ => self.index.last().map_or(HEADER_LEN, |(_, offset)| *offset),
        };
        let mut last = None;
        while let Some((key, _)) = self.next()? {
            last = Some(key);
        }
        self.pos = saved;
        Ok(last)
    }

    /// The key in the middle of the index; the split-point candidate.
    pub fn mid_key(&self) -> Option<StoreKey> {
        if self.index.is_empty() {
            return None;
        }
        Some(self.index[self.index.len() / 2].0.clone())
    }

    /// When a top-half reference is asked for keys below its split point,
    /// the earliest admissible position is the start of the split row.
    fn clamp_forward(&self, key: &StoreKey) -> StoreKey {
        match &self.restriction {
            Some(range)
                if range.half == Half::Top && key.row.as_slice() < range.split_row.as_slice() =>
            {
                StoreKey::row_probe(&range.split_row)
            }
            _ => key.clone(),
        }
    }

    /// When a bottom-half reference is asked for keys at or above its
    /// split point, the latest admissible position is just before the
    /// split row begins.
    fn clamp_backward(&self, key: &StoreKey) -> StoreKey {
        match &self.restriction {
            Some(range)
                if range.half == Half::Bottom
                    && key.row.as_slice() >= range.split_row.as_slice() =>
            {
                StoreKey::row_probe(&range.split_row)
            }
            _ => key.clone(),
        }
    }

    /// Largest indexed offset whose key is `<= target`, else the first
    /// entry.
    fn seek_index(&mut self, target: &StoreKey) {
        let idx = self.index.partition_point(|(key, _)| key <= target);
        self.pos = if idx == 0 { HEADER_LEN } else { self.index[idx - 1].1 };
    }
}

fn read_index_entries(input: &mut impl Read) -> Result<Vec<(StoreKey, u64)>> {
    let mut entries = Vec::new();
    loop {
        let row_len = match input.read_u32::<BigEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let mut row = vec![0u8; row_len as usize];
        input.read_exact(&mut row)?;
        let col_len = input.read_u32::<BigEndian>()?;
        let mut column = vec![0u8; col_len as usize];
        input.read_exact(&mut column)?;
        let timestamp = input.read_i64::<BigEndian>()?;
        let offset = input.read_u64::<BigEndian>()?;
        entries.push((StoreKey::new(row, column, timestamp), offset));
    }
    Ok(entries)
}

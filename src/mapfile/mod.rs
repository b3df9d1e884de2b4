//! On-disk sorted-run format.
//!
//! Each store file is a directory holding a `data` file and an `index`
//! file. The data file is a sequence of cell entries in ascending key
//! order; the index file is a sparse list of `(key, offset)` pairs, one
//! per `index_interval` entries, loaded whole into memory by readers.
//!
//! ## Data file layout
//!
//! ```text
//! +--------------------+
//! | Magic (u32)        |
//! | Version (u32)      |
//! +--------------------+
//! | Entry 1            |
//! | Entry 2            |
//! | ...                |
//! +--------------------+
//! ```
//!
//! ## Entry format
//!
//! ```text
//! +-----------+-----+-----------+--------+--------+-----------+-------+--------+
//! |row_len:u32| row |col_len:u32| column | ts:i64 |val_len:u32| value |crc32:u32|
//! +-----------+-----+-----------+--------+--------+-----------+-------+--------+
//! ```
//!
//! All integers are big-endian. The CRC32 covers every preceding byte of
//! the entry; a mismatch or a mid-entry EOF is reported as corruption.
//!
//! The `Writer` enforces non-decreasing key order on append, so a reader
//! can binary-search the sparse index and scan forward from the chosen
//! offset. Readers are stateful cursors; access to a shared reader is
//! serialized by the caller.

pub mod reader;
pub mod writer;

pub use reader::{HalfRange, MapFileReader};
pub use writer::MapFileWriter;

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::key::StoreKey;
use crate::{errcorrupt, errinput};

pub(crate) const DATA_MAGIC: u32 = 0x454D_4252; // "EMBR"
pub(crate) const INDEX_MAGIC: u32 = 0x454D_4249; // "EMBI"
pub(crate) const FORMAT_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: u64 = 8;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Name of the sorted payload inside a store file directory.
pub const DATA_FILE_NAME: &str = "data";
/// Name of the sparse index inside a store file directory.
pub const INDEX_FILE_NAME: &str = "index";

/// Keys and values may not exceed this length; larger lengths in a data
/// file indicate corruption rather than a real entry.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

pub(crate) fn write_header(w: &mut impl Write, magic: u32) -> Result<()> {
    w.write_u32::<BigEndian>(magic)?;
    w.write_u32::<BigEndian>(FORMAT_VERSION)?;
    Ok(())
}

pub(crate) fn read_header(r: &mut impl Read, magic: u32, what: &str) -> Result<()> {
    let found = r.read_u32::<BigEndian>()?;
    if found != magic {
        return errcorrupt!("{what} has magic {found:#x}, expected {magic:#x}");
    }
    let version = r.read_u32::<BigEndian>()?;
    if version != FORMAT_VERSION {
        return errcorrupt!("{what} has version {version}, expected {FORMAT_VERSION}");
    }
    Ok(())
}

/// Serializes one entry. Returns the number of bytes written.
pub(crate) fn write_entry(w: &mut impl Write, key: &StoreKey, value: &[u8]) -> Result<u64> {
    if key.row.len() as u64 > MAX_FIELD_LEN as u64 || value.len() as u64 > MAX_FIELD_LEN as u64 {
        return errinput!("entry field exceeds {MAX_FIELD_LEN} bytes");
    }
    let mut buf = Vec::with_capacity(24 + key.row.len() + key.column.len() + value.len());
    buf.write_u32::<BigEndian>(key.row.len() as u32)?;
    buf.extend_from_slice(&key.row);
    buf.write_u32::<BigEndian>(key.column.len() as u32)?;
    buf.extend_from_slice(&key.column);
    buf.write_i64::<BigEndian>(key.timestamp)?;
    buf.write_u32::<BigEndian>(value.len() as u32)?;
    buf.extend_from_slice(value);

    let crc = CRC32.checksum(&buf);
    w.write_all(&buf)?;
    w.write_u32::<BigEndian>(crc)?;
    Ok(buf.len() as u64 + 4)
}

/// Reads one entry. `Ok(None)` means a clean end of file; an EOF inside an
/// entry is corruption.
pub(crate) fn read_entry(r: &mut impl Read) -> Result<Option<(StoreKey, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    let n = r.read(&mut len_buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n < 4 {
        r.read_exact(&mut len_buf[n..])
            .map_err(|_| crate::error::Error::Corrupt("entry truncated in row length".into()))?;
    }
    let row_len = u32::from_be_bytes(len_buf);
    if row_len > MAX_FIELD_LEN {
        return errcorrupt!("entry row length {row_len} out of range");
    }

    // Accumulate the raw entry bytes so the checksum can be recomputed the
    // same way the writer produced it.
    let mut raw = len_buf.to_vec();

    fn read_field(r: &mut impl Read, raw: &mut Vec<u8>, len: usize, what: &str) -> Result<usize> {
        let start = raw.len();
        raw.resize(start + len, 0);
        r.read_exact(&mut raw[start..])
            .map_err(|_| crate::error::Error::Corrupt(format!("entry truncated in {what}")))?;
        Ok(start)
    }

    let row_at = read_field(r, &mut raw, row_len as usize, "row")?;
    let at = read_field(r, &mut raw, 4, "column length")?;
    let col_len = u32::from_be_bytes(raw[at..at + 4].try_into().unwrap());
    if col_len > MAX_FIELD_LEN {
        return errcorrupt!("entry column length {col_len} out of range");
    }
    let col_at = read_field(r, &mut raw, col_len as usize, "column")?;
    let at = read_field(r, &mut raw, 8, "timestamp")?;
    let timestamp = i64::from_be_bytes(raw[at..at + 8].try_into().unwrap());
    let at = read_field(r, &mut raw, 4, "value length")?;
    let val_len = u32::from_be_bytes(raw[at..at + 4].try_into().unwrap());
    if val_len > MAX_FIELD_LEN {
        return errcorrupt!("entry value length {val_len} out of range");
    }
    let val_at = read_field(r, &mut raw, val_len as usize, "value")?;

    let expected = CRC32.checksum(&raw);
    let mut crc_buf = [0u8; 4];
    r.read_exact(&mut crc_buf)
        .map_err(|_| crate::error::Error::Corrupt("entry truncated in checksum".into()))?;
    let found = u32::from_be_bytes(crc_buf);
    if found != expected {
        return errcorrupt!("entry checksum mismatch: stored {found:#x}, computed {expected:#x}");
    }

    let row = raw[row_at..row_at + row_len as usize].to_vec();
    let column = raw[col_at..col_at + col_len as usize].to_vec();
    let value = raw[val_at..val_at + val_len as usize].to_vec();
    Ok(Some((StoreKey::new(row, column, timestamp), value)))
}

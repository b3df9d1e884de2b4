//! Store file metadata and load-time consistency checks.
//!
//! A store file is one immutable sorted run: a `mapfiles/<name>/` directory
//! holding the data and index pair, plus an `info/<name>` sidecar recording
//! the highest WAL sequence id the run reflects. Names follow the grammar
//! `<id>` or `<id>.<parent-region>`; the second form marks a *reference*, a
//! file that narrows a split parent's run to one half of its row range.
//! References are read like any other file but are never splittable and
//! are compacted away rather than rewritten.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::mapfile::reader::Half;
use crate::mapfile::{HalfRange, MapFileReader, DATA_FILE_NAME, INDEX_FILE_NAME};

/// Side-band on a store file that exposes one half of a split parent's
/// row range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitReference {
    /// Encoded name of the region whose file is referenced.
    pub parent_region: String,
    /// Id of the referenced file inside the parent's family directory.
    pub parent_file_id: u64,
    /// Row the parent was split at.
    pub split_row: Vec<u8>,
    /// Which side of the split this reference exposes.
    pub half: Half,
}

/// Contents of the info sidecar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfoRecord {
    /// Highest WAL sequence id reflected by the file's contents.
    pub sequence_id: i64,
    /// Present when the file is a reference.
    pub reference: Option<SplitReference>,
}

/// Metadata handle on one immutable sorted run.
#[derive(Clone, Debug)]
pub struct StoreFile {
    id: u64,
    name: String,
    mapfile_dir: PathBuf,
    info_path: PathBuf,
    reference: Option<SplitReference>,
}

impl StoreFile {
    /// A plain (non-reference) file owned by this store.
    pub fn new(config: &StoreConfig, id: u64) -> Self {
        let name = id.to_string();
        Self {
            id,
            mapfile_dir: config.map_dir().join(&name),
            info_path: config.info_dir().join(&name),
            name,
            reference: None,
        }
    }

    /// A reference to half of a parent region's file. The data lives in
    /// the parent's family directory; only the info sidecar is ours.
    pub fn new_reference(config: &StoreConfig, id: u64, reference: SplitReference) -> Self {
        let name = format!("{}.{}", id, reference.parent_region);
        Self {
            id,
            mapfile_dir: config
                .family_dir_in(&reference.parent_region)
                .join("mapfiles")
                .join(reference.parent_file_id.to_string()),
            info_path: config.info_dir().join(&name),
            name,
            reference: Some(reference),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reference(&self) -> Option<&SplitReference> {
        self.reference.as_ref()
    }

    pub fn mapfile_dir(&self) -> &Path {
        &self.mapfile_dir
    }

    pub fn data_path(&self) -> PathBuf {
        self.mapfile_dir.join(DATA_FILE_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.mapfile_dir.join(INDEX_FILE_NAME)
    }

    pub fn info_path(&self) -> &Path {
        &self.info_path
    }

    /// Size of the data payload in bytes.
    pub fn length(&self) -> Result<u64> {
        Ok(fs::metadata(self.data_path())?.len())
    }

    /// Writes the info sidecar. The file's contents are current up to and
    /// including `sequence_id`.
    pub fn write_info(&self, sequence_id: i64) -> Result<()> {
        let record = InfoRecord { sequence_id, reference: self.reference.clone() };
        fs::write(&self.info_path, bincode::serialize(&record)?)?;
        Ok(())
    }

    pub fn load_info(&self) -> Result<InfoRecord> {
        let bytes = fs::read(&self.info_path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Opens a fresh stateful reader over this file, restricted to the
    /// referenced half when the file is a reference.
    pub fn open_reader(&self) -> Result<MapFileReader> {
        match &self.reference {
            Some(reference) => MapFileReader::open_half(
                &self.mapfile_dir,
                HalfRange { split_row: reference.split_row.clone(), half: reference.half },
            ),
            None => MapFileReader::open(&self.mapfile_dir),
        }
    }

    /// Removes the on-disk payload and the info sidecar.
    pub fn delete(&self) -> Result<()> {
        fs::remove_dir_all(&self.mapfile_dir)?;
        fs::remove_file(&self.info_path)?;
        Ok(())
    }
}

/// Parses a store file name per the grammar `^(\d+)(?:\.(.+))?$`. Returns
/// the file id and, for references, the parent region's encoded name.
pub fn parse_name(name: &str) -> Result<(u64, Option<&str>)> {
    let (id_part, parent) = match name.split_once('.') {
        Some((id, parent)) if !parent.is_empty() => (id, Some(parent)),
        Some(_) => return Err(Error::BadName(name.to_string())),
        None => (name, None),
    };
    if id_part.is_empty() || !id_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::BadName(name.to_string()));
    }
    let id = id_part
        .parse::<u64>()
        .map_err(|_| Error::BadName(name.to_string()))?;
    Ok((id, parent))
}

/// Loads the store's files from disk, enforcing the data/info pairing.
/// Every info sidecar must have a sound mapfile directory and vice versa:
/// zero-length infos are skipped, orphans of either kind are deleted, a
/// zero-length data payload is treated as data loss and removed, and a
/// missing or empty index is rebuilt once. Unparseable names are fatal.
///
/// Returns `(sequence_id, file)` pairs in no particular order.
pub fn load_store_files(config: &StoreConfig) -> Result<Vec<(i64, StoreFile)>> {
    let info_dir = config.info_dir();
    let map_dir = config.map_dir();
    let mut results = Vec::new();
    let mut live_map_dirs = Vec::new();

    let mut info_entries: Vec<PathBuf> =
        fs::read_dir(&info_dir)?.map(|e| Ok(e?.path())).collect::<Result<_>>()?;
    info_entries.sort();

    for info_path in info_entries {
        // Empty info files should never happen, but data loss in the
        // underlying filesystem can leave them behind.
        if fs::metadata(&info_path)?.len() == 0 {
            tracing::warn!(path = %info_path.display(), "skipping zero-length info file, data loss?");
            continue;
        }
        let name = info_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::BadName(info_path.display().to_string()))?
            .to_string();
        let (id, parent) = parse_name(&name)?;

        let record: InfoRecord = match fs::read(&info_path)
            .map_err(Error::from)
            .and_then(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %info_path.display(), error = %e,
                    "skipping undecodable info file, data loss?");
                continue;
            }
        };

        let file = match (&record.reference, parent) {
            (Some(reference), Some(_)) => StoreFile::new_reference(config, id, reference.clone()),
            (None, None) => StoreFile::new(config, id),
            _ => {
                tracing::warn!(path = %info_path.display(),
                    "info record and file name disagree about being a reference, skipping");
                continue;
            }
        };

        if !file.data_path().exists() {
            fs::remove_file(&info_path)?;
            tracing::warn!(mapfile = %file.mapfile_dir().display(),
                "mapfile does not exist, cleaned up orphaned info file. Probable data loss");
            continue;
        }
        if fs::metadata(file.data_path())?.len() == 0 {
            file.delete()?;
            tracing::warn!(mapfile = %file.mapfile_dir().display(),
                "mapfile has empty data, deleting. Probable data loss");
            continue;
        }
        let index_missing = !file.index_path().exists()
            || fs::metadata(file.index_path())?.len() == 0;
        if index_missing {
            match MapFileReader::rebuild_index(file.mapfile_dir(), config.index_interval) {
                Ok(entries) => {
                    tracing::debug!(mapfile = %file.mapfile_dir().display(), entries,
                        "rebuilt missing index");
                }
                Err(e) => {
                    tracing::warn!(mapfile = %file.mapfile_dir().display(), error = %e,
                        "failed index rebuild, skipping file. Probable data loss");
                    continue;
                }
            }
        }

        if !file.is_reference() {
            live_map_dirs.push(file.mapfile_dir().to_path_buf());
        }
        results.push((record.sequence_id, file));
    }

    // Mapfile directories without a surviving info sidecar are orphans.
    for entry in fs::read_dir(&map_dir)? {
        let path = entry?.path();
        if !live_map_dirs.contains(&path) {
            tracing::warn!(path = %path.display(), "deleting orphaned mapfile directory");
            fs::remove_dir_all(&path)?;
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FamilyDescriptor, StoreConfig};
    use crate::key::StoreKey;
    use crate::mapfile::MapFileWriter;
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> StoreConfig {
        let config =
            StoreConfig::new(dir.path(), b"r1".to_vec(), "r1enc", FamilyDescriptor::new("info"));
        std::fs::create_dir_all(config.map_dir()).expect("Failed to create map dir");
        std::fs::create_dir_all(config.info_dir()).expect("Failed to create info dir");
        config
    }

    fn write_file(config: &StoreConfig, id: u64, seq: i64, rows: usize) -> StoreFile {
        let file = StoreFile::new(config, id);
        let mut writer =
            MapFileWriter::create(file.mapfile_dir(), 4).expect("Failed to create writer");
        for i in 0..rows {
            let key = StoreKey::new(format!("row_{i:03}").into_bytes(), b"info:c".to_vec(), 1);
            writer.append(&key, b"v").expect("Failed to append");
        }
        writer.finish().expect("Failed to finish");
        file.write_info(seq).expect("Failed to write info");
        file
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(parse_name("12").expect("plain name"), (12, None));
        assert_eq!(
            parse_name("12.parentregion").expect("reference name"),
            (12, Some("parentregion"))
        );
        assert!(matches!(parse_name("notdigits"), Err(Error::BadName(_))));
        assert!(matches!(parse_name("12."), Err(Error::BadName(_))));
        assert!(matches!(parse_name(""), Err(Error::BadName(_))));
    }

    #[test]
    fn test_info_round_trip() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        let file = write_file(&config, 7, 42, 3);

        let info = file.load_info().expect("Failed to load info");
        assert_eq!(info.sequence_id, 42);
        assert!(info.reference.is_none());
    }

    #[test]
    fn test_load_store_files() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        write_file(&config, 1, 10, 3);
        write_file(&config, 2, 20, 3);

        let mut loaded = load_store_files(&config).expect("Failed to load store files");
        loaded.sort_by_key(|(seq, _)| *seq);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, 10);
        assert_eq!(loaded[1].0, 20);
    }

    #[test]
    fn test_load_skips_zero_length_info() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        write_file(&config, 1, 10, 3);
        std::fs::write(config.info_dir().join("99"), b"").expect("Failed to write empty info");

        let loaded = load_store_files(&config).expect("Failed to load store files");
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_load_deletes_orphaned_info_and_mapfile() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        let keeper = write_file(&config, 1, 10, 3);

        // Info without data.
        let orphan_info = StoreFile::new(&config, 50);
        orphan_info.write_info(50).expect("Failed to write info");

        // Data without info.
        let orphan_map = StoreFile::new(&config, 60);
        let mut writer =
            MapFileWriter::create(orphan_map.mapfile_dir(), 4).expect("Failed to create writer");
        writer
            .append(&StoreKey::new(b"r".to_vec(), b"info:c".to_vec(), 1), b"v")
            .expect("Failed to append");
        writer.finish().expect("Failed to finish");

        let loaded = load_store_files(&config).expect("Failed to load store files");
        assert_eq!(loaded.len(), 1);
        assert!(!orphan_info.info_path().exists(), "orphaned info must be deleted");
        assert!(!orphan_map.mapfile_dir().exists(), "orphaned mapfile must be deleted");
        assert!(keeper.mapfile_dir().exists());
    }

    #[test]
    fn test_load_deletes_empty_data() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        let broken = StoreFile::new(&config, 3);
        std::fs::create_dir_all(broken.mapfile_dir()).expect("Failed to create dir");
        std::fs::write(broken.data_path(), b"").expect("Failed to write empty data");
        broken.write_info(5).expect("Failed to write info");

        let loaded = load_store_files(&config).expect("Failed to load store files");
        assert!(loaded.is_empty());
        assert!(!broken.mapfile_dir().exists());
    }

    #[test]
    fn test_load_rebuilds_missing_index() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        let file = write_file(&config, 4, 11, 10);
        std::fs::remove_file(file.index_path()).expect("Failed to remove index");

        let loaded = load_store_files(&config).expect("Failed to load store files");
        assert_eq!(loaded.len(), 1);
        let mut reader = loaded[0].1.open_reader().expect("Failed to open reader");
        let mut count = 0;
        while reader.next().expect("read failed").is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn test_load_propagates_bad_names() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = test_config(&dir);
        std::fs::write(config.info_dir().join("not-a-number"), b"junk")
            .expect("Failed to write bad info");

        assert!(matches!(load_store_files(&config), Err(Error::BadName(_))));
    }

    #[test]
    fn test_reference_reads_parent_data() {
        let dir = tempdir().expect("Failed to create temp dir");
        // Parent region with a real file.
        let parent_config =
            StoreConfig::new(dir.path(), b"parent".to_vec(), "parentenc", FamilyDescriptor::new("info"));
        std::fs::create_dir_all(parent_config.map_dir()).expect("Failed to create map dir");
        std::fs::create_dir_all(parent_config.info_dir()).expect("Failed to create info dir");
        write_file(&parent_config, 8, 30, 10);

        // Child region referencing the top half.
        let child_config =
            StoreConfig::new(dir.path(), b"child".to_vec(), "childenc", FamilyDescriptor::new("info"));
        std::fs::create_dir_all(child_config.map_dir()).expect("Failed to create map dir");
        std::fs::create_dir_all(child_config.info_dir()).expect("Failed to create info dir");
        let reference = SplitReference {
            parent_region: "parentenc".to_string(),
            parent_file_id: 8,
            split_row: b"row_005".to_vec(),
            half: Half::Top,
        };
        let ref_file = StoreFile::new_reference(&child_config, 9, reference);
        ref_file.write_info(30).expect("Failed to write info");

        let loaded = load_store_files(&child_config).expect("Failed to load store files");
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].1.is_reference());

        let mut reader = loaded[0].1.open_reader().expect("Failed to open reference reader");
        let (first, _) = reader.next().expect("read failed").expect("expected entries");
        assert_eq!(first.row, b"row_005", "top half must exclude rows below the split");
    }
}

use std::path::PathBuf;

/// Configuration for one column-family store engine.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory under which all region directories live.
    pub basedir: PathBuf,

    /// Region name as it appears in replay records.
    pub region_name: Vec<u8>,

    /// Encoded region name used as the on-disk directory component.
    pub region_encoded: String,

    /// The column family this engine serves.
    pub family: FamilyDescriptor,

    /// Number of store files that triggers a compaction (default: 3).
    pub compaction_threshold: usize,

    /// One sparse index entry per this many data entries (default: 32).
    pub index_interval: usize,

    /// Progress-report cadence during recovery, in applied edits
    /// (default: 2048).
    pub report_interval: usize,
}

impl StoreConfig {
    pub fn new(
        basedir: impl Into<PathBuf>,
        region_name: impl Into<Vec<u8>>,
        region_encoded: impl Into<String>,
        family: FamilyDescriptor,
    ) -> Self {
        Self {
            basedir: basedir.into(),
            region_name: region_name.into(),
            region_encoded: region_encoded.into(),
            family,
            compaction_threshold: 3,
            index_interval: 32,
            report_interval: 2048,
        }
    }

    /// Set the compaction file-count threshold.
    pub fn compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Set the sparse index interval.
    pub fn index_interval(mut self, interval: usize) -> Self {
        self.index_interval = interval;
        self
    }

    /// Set the recovery progress-report interval.
    pub fn report_interval(mut self, interval: usize) -> Self {
        self.report_interval = interval;
        self
    }

    /// `basedir/<region>/<family>` for an arbitrary region.
    pub fn family_dir_in(&self, region_encoded: &str) -> PathBuf {
        self.basedir
            .join(region_encoded)
            .join(String::from_utf8_lossy(&self.family.name).as_ref())
    }

    /// This store's family directory.
    pub fn family_dir(&self) -> PathBuf {
        self.family_dir_in(&self.region_encoded)
    }

    /// Directory of sorted-run payloads, one subdirectory per store file.
    pub fn map_dir(&self) -> PathBuf {
        self.family_dir().join("mapfiles")
    }

    /// Directory of info sidecars, one flat file per store file.
    pub fn info_dir(&self) -> PathBuf {
        self.family_dir().join("info")
    }

    /// Directory holding the persisted bloom filter.
    pub fn filter_dir(&self) -> PathBuf {
        self.family_dir().join("filter")
    }

    /// Staging directory for compaction outputs before rename.
    pub fn compaction_dir(&self) -> PathBuf {
        self.family_dir().join("compaction.dir")
    }
}

/// Schema of one column family.
#[derive(Debug, Clone)]
pub struct FamilyDescriptor {
    /// Family name, without the trailing separator.
    pub name: Vec<u8>,

    /// Maximum number of non-tombstone versions a compaction retains per
    /// `(row, column)` (default: 3).
    pub max_versions: u32,

    /// Bloom filter settings, if the family keeps one.
    pub bloom: Option<BloomConfig>,
}

impl FamilyDescriptor {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), max_versions: 3, bloom: None }
    }

    /// Set the per-cell version ceiling.
    pub fn max_versions(mut self, versions: u32) -> Self {
        self.max_versions = versions;
        self
    }

    /// Enable a bloom filter for this family.
    pub fn bloom(mut self, config: BloomConfig) -> Self {
        self.bloom = Some(config);
        self
    }
}

/// Sizing of the family's bloom filter.
#[derive(Debug, Clone)]
pub struct BloomConfig {
    /// Number of bits in the filter vector.
    pub bits: u64,

    /// Number of hash functions.
    pub hashes: u32,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self { bits: 1 << 20, hashes: 4 }
    }
}

impl BloomConfig {
    pub fn new(bits: u64, hashes: u32) -> Self {
        Self { bits, hashes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/db", b"r1".to_vec(), "r1enc", FamilyDescriptor::new("info"));
        assert_eq!(config.compaction_threshold, 3);
        assert_eq!(config.index_interval, 32);
        assert_eq!(config.report_interval, 2048);
        assert_eq!(config.family.max_versions, 3);
        assert!(config.family.bloom.is_none());
    }

    #[test]
    fn test_builder() {
        let family = FamilyDescriptor::new("info")
            .max_versions(5)
            .bloom(BloomConfig::new(4096, 3));
        let config = StoreConfig::new("/tmp/db", b"r1".to_vec(), "r1enc", family)
            .compaction_threshold(2)
            .index_interval(8);

        assert_eq!(config.compaction_threshold, 2);
        assert_eq!(config.index_interval, 8);
        assert_eq!(config.family.max_versions, 5);
        assert_eq!(config.family.bloom.as_ref().unwrap().bits, 4096);
    }

    #[test]
    fn test_directory_layout() {
        let config = StoreConfig::new("/data", b"r1".to_vec(), "1028785192", FamilyDescriptor::new("info"));
        assert_eq!(config.map_dir(), PathBuf::from("/data/1028785192/info/mapfiles"));
        assert_eq!(config.info_dir(), PathBuf::from("/data/1028785192/info/info"));
        assert_eq!(config.filter_dir(), PathBuf::from("/data/1028785192/info/filter"));
        assert_eq!(config.compaction_dir(), PathBuf::from("/data/1028785192/info/compaction.dir"));
    }
}

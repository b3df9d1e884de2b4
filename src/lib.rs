pub mod config;
pub mod error;
pub mod filter;
pub mod key;
pub mod mapfile;
pub mod memtable;
pub mod storefile;
pub mod store;

pub use config::{BloomConfig, FamilyDescriptor, StoreConfig};
pub use error::{Error, Result};
pub use key::{StoreKey, LATEST_TIMESTAMP, TOMBSTONE};
pub use mapfile::reader::Half;
pub use store::{ChangedReadersObserver, ReplayRecord, RowFilter, Store, StoreScanner, StoreSize};
pub use storefile::{SplitReference, StoreFile};
